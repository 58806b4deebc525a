//! Migration version identifiers.
//!
//! A version is a dotted sequence of tokens such as `1`, `1.2.3` or `2024.01.rc1`.
//! Numeric tokens compare as arbitrary-precision integers, alphanumeric tokens
//! compare lexically, and a numeric token always sorts before an alphanumeric one.
//! Missing trailing tokens count as zero, so `1.2 == 1.2.0` and `1.2 < 1.2.1`.
//!
//! Two sentinels bracket every real version: [`Version::EMPTY`] sorts first and
//! [`Version::LATEST`] sorts last.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version {input:?}: {reason}")]
pub struct ParseVersionError {
    /// The rejected input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    /// Decimal digits without leading zeros ("0" for zero).
    Numeric(String),
    Alpha(String),
}

impl Token {
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = raw.trim_start_matches('0');
            let digits = if trimmed.is_empty() { "0" } else { trimmed };
            return Some(Token::Numeric(digits.to_string()));
        }
        if raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Some(Token::Alpha(raw.to_string()));
        }
        None
    }

    fn is_zero(&self) -> bool {
        matches!(self, Token::Numeric(digits) if digits == "0")
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // No leading zeros, so a longer digit string is a larger number.
            (Token::Numeric(a), Token::Numeric(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Token::Numeric(_), Token::Alpha(_)) => Ordering::Less,
            (Token::Alpha(_), Token::Numeric(_)) => Ordering::Greater,
            (Token::Alpha(a), Token::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
enum Repr {
    Empty,
    Parts { tokens: Vec<Token>, text: String },
    Latest,
}

/// A comparable migration version.
#[derive(Debug, Clone)]
pub struct Version {
    repr: Repr,
}

impl Default for Version {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Version {
    /// Version of a schema with nothing applied. Sorts before every real version.
    pub const EMPTY: Version = Version { repr: Repr::Empty };

    /// Open-ended upper bound. Sorts after every real version.
    pub const LATEST: Version = Version { repr: Repr::Latest };

    /// Parse a version string. `_` is accepted as a separator and displayed as `.`.
    /// The word `latest` (any case) yields [`Version::LATEST`].
    pub fn parse(input: &str) -> Result<Self, ParseVersionError> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::LATEST);
        }
        if trimmed.is_empty() {
            return Err(ParseVersionError {
                input: input.to_string(),
                reason: "version is empty",
            });
        }

        let text = trimmed.replace('_', ".");
        let mut tokens = Vec::new();
        for raw in text.split('.') {
            let token = Token::parse(raw).ok_or_else(|| ParseVersionError {
                input: input.to_string(),
                reason: if raw.is_empty() {
                    "empty version segment"
                } else {
                    "only letters, digits and '-' are allowed in a segment"
                },
            })?;
            tokens.push(token);
        }

        // Trailing zeros carry no ordering information; dropping them keeps Eq and Hash aligned.
        while tokens.len() > 1 && tokens.last().is_some_and(Token::is_zero) {
            tokens.pop();
        }

        Ok(Self {
            repr: Repr::Parts { tokens, text },
        })
    }

    /// Whether this is the [`Version::EMPTY`] sentinel.
    pub fn is_empty_schema(&self) -> bool {
        matches!(self.repr, Repr::Empty)
    }

    /// Whether this is the [`Version::LATEST`] sentinel.
    pub fn is_latest(&self) -> bool {
        matches!(self.repr, Repr::Latest)
    }

    /// The normalized textual form of a real version, `None` for sentinels.
    pub fn as_str(&self) -> Option<&str> {
        match &self.repr {
            Repr::Parts { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Shorthand for `self > other`.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.repr, &other.repr) {
            (Repr::Empty, Repr::Empty) | (Repr::Latest, Repr::Latest) => Ordering::Equal,
            (Repr::Empty, _) | (_, Repr::Latest) => Ordering::Less,
            (_, Repr::Empty) | (Repr::Latest, _) => Ordering::Greater,
            (Repr::Parts { tokens: a, .. }, Repr::Parts { tokens: b, .. }) => {
                let zero = Token::Numeric("0".to_string());
                for i in 0..a.len().max(b.len()) {
                    let left = a.get(i).unwrap_or(&zero);
                    let right = b.get(i).unwrap_or(&zero);
                    match left.cmp(right) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                Ordering::Equal
            }
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.repr {
            Repr::Empty => 0u8.hash(state),
            Repr::Parts { tokens, .. } => {
                1u8.hash(state);
                tokens.hash(state);
            }
            Repr::Latest => 2u8.hash(state),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Empty => write!(f, "<< Empty Schema >>"),
            Repr::Parts { text, .. } => write!(f, "{}", text),
            Repr::Latest => write!(f, "<< Latest Version >>"),
        }
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.repr {
            Repr::Empty => serializer.serialize_str(""),
            Repr::Parts { text, .. } => serializer.serialize_str(text),
            Repr::Latest => serializer.serialize_str("latest"),
        }
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(Version::EMPTY);
        }
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("1") < v("2"));
        assert!(v("1.9") < v("1.10"));
        assert!(v("2") > v("1.99.99"));
        assert!(v("201004200021") > v("201004200020"));
    }

    #[test]
    fn test_zero_padding() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert_eq!(v("1.2"), v("1.2.0.0"));
        assert!(v("1.2") < v("1.2.1"));
        assert_eq!(v("005"), v("5"));
    }

    #[test]
    fn test_underscore_separator() {
        let version = v("1_2_3");
        assert_eq!(version, v("1.2.3"));
        assert_eq!(version.to_string(), "1.2.3");
    }

    #[test]
    fn test_alphanumeric_tokens() {
        assert!(v("1.alpha") < v("1.beta"));
        assert!(v("1.9") < v("1.alpha"));
        assert!(v("1.2") < v("1.2.rc1"));
    }

    #[test]
    fn test_large_numbers_beyond_u64() {
        assert!(v("99999999999999999999999") < v("100000000000000000000000"));
    }

    #[test]
    fn test_sentinels() {
        assert!(Version::EMPTY < v("0"));
        assert!(Version::EMPTY < Version::LATEST);
        assert!(Version::LATEST > v("999999999999"));
        assert_eq!(Version::LATEST, v("latest"));
        assert!(Version::EMPTY.is_empty_schema());
        assert!(Version::LATEST.is_latest());
        assert_eq!(Version::LATEST.as_str(), None);
    }

    #[test]
    fn test_invalid_versions() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1..2").is_err());
        assert!(Version::parse(".1").is_err());
        assert!(Version::parse("1.2$").is_err());
    }

    #[test]
    fn test_hash_matches_equality() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(v("1.2"));
        assert!(set.contains(&v("1.2.0")));
        assert!(!set.contains(&v("1.2.1")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("1_5")).unwrap();
        assert_eq!(json, "\"1.5\"");

        let parsed: Version = serde_json::from_str("\"latest\"").unwrap();
        assert!(parsed.is_latest());

        assert!(serde_json::from_str::<Version>("\"1..x\"").is_err());
    }
}
