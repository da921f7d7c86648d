//! Structural promo code validation: length bounds and a single character class.

use serde::{Deserialize, Serialize};

/// Character class every byte of a code must belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CharClass {
    /// `A-Z`
    Uppercase,
    /// `a-z`
    Lowercase,
    /// `A-Z` or `a-z`
    Letters,
    /// `0-9`
    Digits,
    /// `A-Z`, `a-z` or `0-9`
    #[default]
    Alphanumeric,
    /// Any value not listed above. Rejects every code.
    #[serde(other)]
    Unrecognized,
}

impl CharClass {
    /// Whether `ch` belongs to this class.
    #[inline]
    pub fn matches(self, ch: u8) -> bool {
        match self {
            CharClass::Uppercase => ch.is_ascii_uppercase(),
            CharClass::Lowercase => ch.is_ascii_lowercase(),
            CharClass::Letters => ch.is_ascii_alphabetic(),
            CharClass::Digits => ch.is_ascii_digit(),
            CharClass::Alphanumeric => ch.is_ascii_alphanumeric(),
            CharClass::Unrecognized => false,
        }
    }

    /// False only for [`CharClass::Unrecognized`].
    pub fn is_recognized(self) -> bool {
        self != CharClass::Unrecognized
    }
}

/// Length and charset rules applied to every candidate code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRules {
    /// Minimum length in bytes, inclusive
    pub min_length: usize,
    /// Maximum length in bytes, inclusive
    pub max_length: usize,
    /// Allowed character class
    pub allowed_characters: CharClass,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 10,
            allowed_characters: CharClass::Alphanumeric,
        }
    }
}

impl ValidationRules {
    /// Create rules from explicit bounds and class.
    pub fn new(min_length: usize, max_length: usize, allowed_characters: CharClass) -> Self {
        Self {
            min_length,
            max_length,
            allowed_characters,
        }
    }
}

/// Decide whether `code` passes `rules`. No normalization is applied.
pub fn is_valid(code: &str, rules: &ValidationRules) -> bool {
    let len = code.len();
    if len < rules.min_length || len > rules.max_length {
        return false;
    }
    let class = rules.allowed_characters;
    code.bytes().all(|ch| class.matches(ch))
}
