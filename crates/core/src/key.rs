//! Key normalization for kvlayer
//!
//! A key is a byte string normalized to lower-case ASCII alphanumerics plus
//! `- . /`. Keys ending in a dotted extension (e.g. `.bin`, `.gif`) address
//! a raw byte buffer ("binary key"); every other key addresses a structured
//! JSON record ("JSON key").

use deunicode::deunicode;
use once_cell::sync::Lazy;
use regex::Regex;

/// A normalized storage key.
///
/// `NormalizedKey` is produced only by [`normalize`]; it is never
/// constructed directly from an unvalidated string, so any `&str` derived
/// from it is guaranteed to already satisfy the normalization rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    /// Borrow the normalized key as a plain string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a sub-key by appending a path suffix, e.g. for list pages
    /// (`K/0`), hash tree nodes (`K/data/a/f`), or index columns
    /// (`<base>/<field>/word/<word>`).
    ///
    /// The suffix is appended verbatim (not renormalized) since callers
    /// build suffixes out of already-safe alphabets (digits, hex nibbles,
    /// stemmed words).
    pub fn child(&self, suffix: &str) -> NormalizedKey {
        NormalizedKey(format!("{}/{}", self.0, suffix))
    }

    /// True if this key is a "binary key": its normalized form ends in a
    /// dotted extension, so its value is an opaque byte buffer rather than
    /// a JSON document.
    pub fn is_binary(&self) -> bool {
        is_binary_key(&self.0)
    }
}

impl std::fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

static NON_ALLOWED_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\-./]+").unwrap());
static DOUBLE_SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"//+").unwrap());
static EXTENSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.[a-z0-9]{1,8}$").unwrap());

/// Normalize a raw key per §3.1: unidecode, lower-case, collapse runs of
/// disallowed characters to `-`, collapse `//` to `/`, and strip leading
/// and trailing `/`.
pub fn normalize(raw: &str) -> NormalizedKey {
    let ascii = deunicode(raw).to_lowercase();
    let collapsed = NON_ALLOWED_RUN.replace_all(&ascii, "-");
    let no_double_slash = DOUBLE_SLASH.replace_all(&collapsed, "/");
    let trimmed = no_double_slash.trim_matches('/');
    NormalizedKey(trimmed.to_string())
}

/// Check whether an already-normalized key string ends with a dotted
/// extension (a "binary key").
pub fn is_binary_key(normalized: &str) -> bool {
    EXTENSION.is_match(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_cases_and_strips_slashes() {
        let k = normalize("/Users/Bob//Documents/");
        assert_eq!(k.as_str(), "users-bob/documents");
    }

    #[test]
    fn collapses_disallowed_runs() {
        let k = normalize("hello!!world??");
        assert_eq!(k.as_str(), "hello-world-");
        // trailing disallowed run collapses to a trailing '-', not stripped
        // (only '/' is stripped at the edges).
    }

    #[test]
    fn unidecodes_non_ascii() {
        let k = normalize("caf\u{e9}");
        assert_eq!(k.as_str(), "cafe");
    }

    #[test]
    fn binary_key_detection() {
        assert!(normalize("avatars/bob.gif").is_binary());
        assert!(normalize("archive.tar.bin").is_binary());
        assert!(!normalize("users/bob").is_binary());
        assert!(!normalize("a.b.c/no-extension-here").is_binary());
    }

    #[test]
    fn child_appends_suffix_verbatim() {
        let k = normalize("mylist");
        assert_eq!(k.child("0").as_str(), "mylist/0");
        assert_eq!(k.child("data").child("a").as_str(), "mylist/data/a");
    }
}
