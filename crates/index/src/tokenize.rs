//! The three column pipelines (§4.5.1–§4.5.3): word, date, number.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use kvlayer_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;

static WORD_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w]+").expect("valid regex"));

/// Run a single query term through the same decode/stem step as the
/// indexing pipeline, so `field:running` matches records indexed under
/// the stem `run` (§4.5.1, §4.5.4).
pub fn stem_query_word(word: &str) -> String {
    let ascii = deunicode::deunicode(word).to_lowercase();
    Stemmer::create(Algorithm::English).stem(&ascii).into_owned()
}

/// A stemmed word and its position in the field's raw token stream,
/// counted before length/stopword filtering so phrase adjacency still
/// reflects true word distance (§4.5.1 step 4).
pub type WordOffsets = Vec<(String, usize)>;

/// Tokenize a free-text value into `(stemmed_word, offset)` pairs
/// (§4.5.1).
pub fn word_tokens(
    text: &str,
    min_word_length: usize,
    max_word_length: usize,
    use_remove_words: bool,
    remove_words: &HashSet<String>,
) -> WordOffsets {
    let ascii = deunicode::deunicode(text).to_lowercase();
    let stemmer = Stemmer::create(Algorithm::English);
    let mut out = Vec::new();
    for (offset, raw) in WORD_SPLIT.split(&ascii).enumerate() {
        if raw.is_empty() {
            continue;
        }
        if raw.len() < min_word_length || raw.len() > max_word_length {
            continue;
        }
        if use_remove_words && remove_words.contains(raw) {
            continue;
        }
        out.push((stemmer.stem(raw).into_owned(), offset));
    }
    out
}

/// `YYYY_MM_DD`/`YYYY_MM`/`YYYY` tokens for a date field value, all at
/// offset 0 since a date has no internal word order (§4.5.2).
pub fn date_tokens(date: NaiveDate) -> WordOffsets {
    vec![
        (format!("{:04}_{:02}_{:02}", date.year(), date.month(), date.day()), 0),
        (format!("{:04}_{:02}", date.year(), date.month()), 0),
        (format!("{:04}", date.year()), 0),
    ]
}

/// Parse a date source value (epoch seconds, or an ISO/US-style string)
/// into a calendar date for indexing.
pub fn parse_date_value(value: &serde_json::Value) -> Result<NaiveDate> {
    if let Some(epoch) = value.as_i64() {
        return Utc
            .timestamp_opt(epoch, 0)
            .single()
            .map(|dt| dt.date_naive())
            .ok_or_else(|| Error::InvalidInput(format!("epoch {epoch} out of range")));
    }
    let s = value
        .as_str()
        .ok_or_else(|| Error::InvalidInput("date field value must be a string or epoch".into()))?;
    parse_date_str(s)
}

fn parse_date_str(s: &str) -> Result<NaiveDate> {
    for fmt in ["%Y-%m-%d", "%Y_%m_%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    Err(Error::InvalidInput(format!("unrecognized date literal '{s}'")))
}

/// Normalize a date-range query literal to `YYYY_MM_DD` (§4.5.2).
/// Accepts the same literal forms plus epoch seconds and the relative
/// keywords `today`/`now`/`yesterday`/`this month`/`this year`.
pub fn normalize_date_query(literal: &str, today: NaiveDate) -> Result<String> {
    let trimmed = literal.trim();
    let date = match trimmed.to_lowercase().as_str() {
        "today" | "now" => today,
        "yesterday" => today.pred_opt().expect("today is not the epoch minimum"),
        "this month" => today.with_day(1).expect("day 1 always valid"),
        "this year" => today
            .with_month(1)
            .and_then(|d| d.with_day(1))
            .expect("jan 1 always valid"),
        _ => {
            if let Ok(epoch) = trimmed.parse::<i64>() {
                Utc.timestamp_opt(epoch, 0)
                    .single()
                    .map(|dt| dt.date_naive())
                    .ok_or_else(|| Error::InvalidInput(format!("epoch {epoch} out of range")))?
            } else {
                parse_date_str(trimmed).or_else(|_| {
                    NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d")
                        .map_err(|_| Error::InvalidInput(format!("unrecognized date literal '{literal}'")))
                })?
            }
        }
    };
    Ok(format!("{:04}_{:02}_{:02}", date.year(), date.month(), date.day()))
}

const NUMBER_CLAMP: f64 = 1_000_000.0;

/// Exact/hundred-bucket/thousand-bucket tokens for a number field value
/// (§4.5.3).
pub fn number_tokens(raw: f64, multiply: f64, divide: f64) -> WordOffsets {
    let scaled = (raw * multiply / divide).clamp(-NUMBER_CLAMP, NUMBER_CLAMP);
    let rounded = scaled.round() as i64;
    let exact = number_token(rounded);
    let hundred = format!("H{}", bucket(rounded, 100));
    let thousand = format!("T{}", bucket(rounded, 1000));
    vec![(exact, 0), (hundred, 0), (thousand, 0)]
}

fn number_token(n: i64) -> String {
    if n < 0 {
        format!("N{}", -n)
    } else {
        n.to_string()
    }
}

/// Floor-divide `n` by `size` (`size` always positive), so negative
/// numbers bucket the same shape as positive ones: `-1234` lands in
/// hundred-bucket `-13`, not `-12`.
fn bucket(n: i64, size: i64) -> i64 {
    n.div_euclid(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_tokens_stems_and_filters_short_words() {
        let remove = HashSet::new();
        let toks = word_tokens("The Running Foxes", 3, 32, false, &remove);
        let words: Vec<&str> = toks.iter().map(|(w, _)| w.as_str()).collect();
        assert!(words.contains(&"run"));
        assert!(words.contains(&"fox"));
        assert!(!words.contains(&"the"));
    }

    #[test]
    fn word_tokens_preserve_raw_offsets_through_stopword_removal() {
        let mut remove = HashSet::new();
        remove.insert("the".to_string());
        let toks = word_tokens("the quick brown fox", 1, 32, true, &remove);
        assert_eq!(toks[0].1, 1); // "quick" at raw offset 1, not 0
    }

    #[test]
    fn date_tokens_cover_three_granularities() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let toks = date_tokens(d);
        let words: Vec<&str> = toks.iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(words, vec!["2024_03_07", "2024_03", "2024"]);
    }

    #[test]
    fn number_tokens_bucket_negative_and_positive() {
        let toks = number_tokens(-1234.0, 1.0, 1.0);
        let words: Vec<&str> = toks.iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(words, vec!["N1234", "H-13", "T-2"]);
    }

    #[test]
    fn number_tokens_clamp_to_range() {
        let toks = number_tokens(5_000_000.0, 1.0, 1.0);
        assert_eq!(toks[0].0, "1000000");
    }

    #[test]
    fn normalize_date_query_handles_keywords() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(normalize_date_query("today", today).unwrap(), "2024_03_07");
        assert_eq!(
            normalize_date_query("yesterday", today).unwrap(),
            "2024_03_06"
        );
        assert_eq!(normalize_date_query("this month", today).unwrap(), "2024_03_01");
        assert_eq!(normalize_date_query("this year", today).unwrap(), "2024_01_01");
    }

    #[test]
    fn normalize_date_query_accepts_literal_forms() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            normalize_date_query("2024-03-07", today).unwrap(),
            "2024_03_07"
        );
        assert_eq!(
            normalize_date_query("03/07/2024", today).unwrap(),
            "2024_03_07"
        );
    }
}
