//! The three query forms (§4.5.4): simple query strings, structured
//! query objects, and the PxQL grammar.

use crate::tokenize::stem_query_word;
use kvlayer_core::{Error, Result};

/// How sibling clauses in a group combine (§4.5.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    And,
    Or,
}

/// A PxQL comparison operator (§4.5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Eq,
    Ne,
    Match,
    NotMatch,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A query AST node. The structured-query form (§4.5.4) is just this
/// type built directly by the caller; the simple-string and PxQL forms
/// are parsed into it.
#[derive(Debug, Clone)]
pub enum Query {
    /// A single word within a field.
    Word { field: String, word: String, negate: bool },
    /// A literal phrase: every word must appear, at contiguous offsets,
    /// in the order given.
    Phrase { field: String, words: Vec<String>, negate: bool },
    /// A comparison against a date/number field's summary master list.
    Range { field: String, op: RangeOp, value: String, negate: bool },
    /// A nested group combined with `mode`.
    Group { mode: Mode, clauses: Vec<Query>, negate: bool },
}

impl Query {
    pub(crate) fn is_negated(&self) -> bool {
        match self {
            Query::Word { negate, .. }
            | Query::Phrase { negate, .. }
            | Query::Range { negate, .. }
            | Query::Group { negate, .. } => *negate,
        }
    }

    pub(crate) fn is_group(&self) -> bool {
        matches!(self, Query::Group { .. })
    }
}

/// Parse `"field1:word1 word2 field2:word3"` form (§4.5.4): a bare term
/// continues the previously named field, a leading `-` negates a term
/// within its field, and `"…"` quotes a literal phrase.
pub fn parse_simple(input: &str, default_field: &str) -> Query {
    let mut clauses = Vec::new();
    let mut field = default_field.to_string();
    for raw_term in split_respecting_quotes(input) {
        let (term, mut negate) = if let Some(rest) = raw_term.strip_prefix('-') {
            (rest, true)
        } else {
            (raw_term.as_str(), false)
        };
        let (maybe_field, body) = match term.split_once(':') {
            Some((f, b)) if !f.is_empty() => (Some(f), b),
            _ => (None, term),
        };
        if let Some(f) = maybe_field {
            field = f.to_string();
        }
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        if let Some(phrase) = body.strip_prefix('"').and_then(|b| b.strip_suffix('"')) {
            let words: Vec<String> = phrase.split_whitespace().map(stem_query_word).collect();
            if words.len() > 1 {
                clauses.push(Query::Phrase { field: field.clone(), words, negate });
                continue;
            }
            if let Some(w) = words.into_iter().next() {
                clauses.push(Query::Word { field: field.clone(), word: w, negate });
            }
            continue;
        }
        if let Some(inner) = body.strip_prefix('-') {
            // `field:-word` form.
            negate = true;
            clauses.push(Query::Word {
                field: field.clone(),
                word: stem_query_word(inner),
                negate,
            });
            continue;
        }
        clauses.push(Query::Word {
            field: field.clone(),
            word: stem_query_word(body),
            negate,
        });
    }
    Query::Group { mode: Mode::And, clauses, negate: false }
}

/// Split on whitespace but keep `"quoted phrases"` intact as one term.
fn split_respecting_quotes(input: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                current.push(ch);
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
}

/// Parse the PxQL grammar (§4.5.4): `<column> <op> <value>`, combined
/// into `( … )` groups with `&`/`&&` or `|`/`||`. Mixing `&` and `|`
/// within one group without additional parens is a parse error.
pub fn parse_pxql(input: &str) -> Result<Query> {
    let tokens = pxql_lex(input)?;
    let mut pos = 0;
    let query = parse_pxql_group(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(Error::ParseError(format!(
            "unexpected trailing tokens in PxQL query at token {pos}"
        )));
    }
    Ok(query)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Op(RangeOp),
    Ident(String),
    Literal(String),
}

fn pxql_lex(input: &str) -> Result<Vec<Tok>> {
    let mut out = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '&' => {
                i += 1;
                if chars.get(i) == Some(&'&') {
                    i += 1;
                }
                out.push(Tok::And);
            }
            '|' => {
                i += 1;
                if chars.get(i) == Some(&'|') {
                    i += 1;
                }
                out.push(Tok::Or);
            }
            '!' if chars.get(i + 1) == Some(&'~') => {
                out.push(Tok::Op(RangeOp::NotMatch));
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'~') => {
                out.push(Tok::Op(RangeOp::Match));
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(RangeOp::Eq));
                i += 2;
            }
            '=' => {
                out.push(Tok::Op(RangeOp::Eq));
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(RangeOp::Le));
                i += 2;
            }
            '<' => {
                out.push(Tok::Op(RangeOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(RangeOp::Ge));
                i += 2;
            }
            '>' => {
                out.push(Tok::Op(RangeOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(Error::ParseError("unterminated string literal".into()));
                }
                out.push(Tok::Literal(chars[start..j].iter().collect()));
                i = j + 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && !"()&|!=<>\"' \t\n".contains(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "not" | "NOT" => out.push(Tok::Not),
                    "" => return Err(Error::ParseError(format!("unexpected character '{c}'"))),
                    _ => out.push(Tok::Ident(word)),
                }
            }
        }
    }
    Ok(out)
}

/// Parse a sequence of comparisons joined by one connective kind at this
/// nesting level; rejects mixed `&`/`|` without parens.
fn parse_pxql_group(tokens: &[Tok], pos: &mut usize) -> Result<Query> {
    let mut clauses = vec![parse_pxql_term(tokens, pos)?];
    let mut mode: Option<Mode> = None;
    loop {
        let connective = match tokens.get(*pos) {
            Some(Tok::And) => Mode::And,
            Some(Tok::Or) => Mode::Or,
            _ => break,
        };
        match mode {
            None => mode = Some(connective),
            Some(m) if m == connective => {}
            Some(_) => {
                return Err(Error::ParseError(
                    "ambiguous operator precedence: mixing & and | requires parentheses".into(),
                ))
            }
        }
        *pos += 1;
        clauses.push(parse_pxql_term(tokens, pos)?);
    }
    if clauses.len() == 1 {
        return Ok(clauses.into_iter().next().unwrap());
    }
    Ok(Query::Group {
        mode: mode.unwrap_or(Mode::And),
        clauses,
        negate: false,
    })
}

fn parse_pxql_term(tokens: &[Tok], pos: &mut usize) -> Result<Query> {
    let negate = if tokens.get(*pos) == Some(&Tok::Not) {
        *pos += 1;
        true
    } else {
        false
    };
    match tokens.get(*pos) {
        Some(Tok::LParen) => {
            *pos += 1;
            let mut inner = parse_pxql_group(tokens, pos)?;
            if tokens.get(*pos) != Some(&Tok::RParen) {
                return Err(Error::ParseError("expected closing ')'".into()));
            }
            *pos += 1;
            if negate {
                apply_negate(&mut inner);
            }
            Ok(inner)
        }
        Some(Tok::Ident(field)) => {
            let field = field.clone();
            *pos += 1;
            let op = match tokens.get(*pos) {
                Some(Tok::Op(op)) => *op,
                _ => {
                    return Err(Error::ParseError(format!(
                        "expected a comparison operator after column '{field}'"
                    )))
                }
            };
            *pos += 1;
            let value = match tokens.get(*pos) {
                Some(Tok::Literal(v)) | Some(Tok::Ident(v)) => v.clone(),
                _ => return Err(Error::ParseError("expected a value after the operator".into())),
            };
            *pos += 1;
            Ok(match op {
                RangeOp::Eq | RangeOp::Match | RangeOp::NotMatch
                    if !value.chars().any(|c| c.is_whitespace()) =>
                {
                    Query::Word {
                        field,
                        word: stem_query_word(&value),
                        negate: negate ^ matches!(op, RangeOp::NotMatch),
                    }
                }
                RangeOp::Eq | RangeOp::Match | RangeOp::NotMatch => Query::Phrase {
                    field,
                    words: value.split_whitespace().map(stem_query_word).collect(),
                    negate: negate ^ matches!(op, RangeOp::NotMatch),
                },
                _ => Query::Range { field, op, value, negate },
            })
        }
        other => Err(Error::ParseError(format!("unexpected token: {other:?}"))),
    }
}

fn apply_negate(query: &mut Query) {
    match query {
        Query::Word { negate, .. }
        | Query::Phrase { negate, .. }
        | Query::Range { negate, .. }
        | Query::Group { negate, .. } => *negate = !*negate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_query_continues_field_and_negates() {
        let q = parse_simple("title:rust -beginner book", "title");
        if let Query::Group { clauses, .. } = q {
            assert_eq!(clauses.len(), 3);
            match &clauses[1] {
                Query::Word { field, word, negate } => {
                    assert_eq!(field, "title");
                    assert_eq!(word, &stem_query_word("beginner"));
                    assert!(negate);
                }
                other => panic!("unexpected clause: {other:?}"),
            }
        } else {
            panic!("expected group");
        }
    }

    #[test]
    fn simple_query_quoted_phrase() {
        let q = parse_simple(r#"title:"old man""#, "title");
        if let Query::Group { clauses, .. } = q {
            match &clauses[0] {
                Query::Phrase { words, .. } => {
                    assert_eq!(words, &vec![stem_query_word("old"), stem_query_word("man")])
                }
                other => panic!("unexpected clause: {other:?}"),
            }
        } else {
            panic!("expected group");
        }
    }

    #[test]
    fn pxql_parses_comparison() {
        let q = parse_pxql("price > 10").unwrap();
        match q {
            Query::Range { field, op, value, negate } => {
                assert_eq!(field, "price");
                assert_eq!(op, RangeOp::Gt);
                assert_eq!(value, "10");
                assert!(!negate);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pxql_parses_group_with_and() {
        let q = parse_pxql("(price > 10 && price < 20)").unwrap();
        match q {
            Query::Group { mode, clauses, .. } => {
                assert_eq!(mode, Mode::And);
                assert_eq!(clauses.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pxql_rejects_mixed_operators_without_parens() {
        let err = parse_pxql("a = 1 & b = 2 | c = 3").unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn pxql_allows_mixed_operators_with_parens() {
        let q = parse_pxql("(a = 1 & b = 2) | c = 3").unwrap();
        assert!(matches!(q, Query::Group { mode: Mode::Or, .. }));
    }
}
