use std::fmt;
use std::sync::{Arc, LazyLock};

use super::trie::TrieMap;

static RESERVED_USERNAMES: LazyLock<Arc<TrieMap<()>>> =
    LazyLock::new(|| Arc::new(parse_word_list(include_str!("reserved-usernames.txt"))));

/// Character-class checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Letter {
    HasLowercase,
    HasUppercase,
    HasDigit,
    /// At least one character that is neither a letter nor a digit.
    HasSpecialSymbol,
    /// No character is uppercase.
    AllLowercase,
}

impl Letter {
    pub fn is_satisfied_by(self, value: &str) -> bool {
        match self {
            Self::HasLowercase => value.chars().any(char::is_lowercase),
            Self::HasUppercase => value.chars().any(char::is_uppercase),
            Self::HasDigit => value.chars().any(char::is_numeric),
            Self::HasSpecialSymbol => value.chars().any(|c| !c.is_alphanumeric()),
            Self::AllLowercase => !value.chars().any(char::is_uppercase),
        }
    }
}

/// A rule a username or password must satisfy.
#[derive(Clone)]
pub enum StringRequirement {
    Letter(Letter),
    /// Every non-alphanumeric character must be one of these.
    AllowedSpecialSymbols(Vec<char>),
    /// Inclusive bounds, counted in characters.
    Length { min: usize, max: usize },
    /// The value (lowercased) must not be a word of the trie.
    Reserved(Arc<TrieMap<()>>),
}

impl StringRequirement {
    pub fn is_satisfied_by(&self, value: &str) -> bool {
        match self {
            Self::Letter(letter) => letter.is_satisfied_by(value),
            Self::AllowedSpecialSymbols(allowed) => value
                .chars()
                .filter(|c| !c.is_alphanumeric())
                .all(|c| allowed.contains(&c)),
            Self::Length { min, max } => {
                let length = value.chars().count();
                (*min..=*max).contains(&length)
            }
            Self::Reserved(words) => !words.contains(&value.to_lowercase(), false),
        }
    }
}

impl PartialEq for StringRequirement {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Letter(a), Self::Letter(b)) => a == b,
            (Self::AllowedSpecialSymbols(a), Self::AllowedSpecialSymbols(b)) => a == b,
            (Self::Length { min: a, max: b }, Self::Length { min: c, max: d }) => {
                a == c && b == d
            }
            (Self::Reserved(a), Self::Reserved(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for StringRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Letter(letter) => f.debug_tuple("Letter").field(letter).finish(),
            Self::AllowedSpecialSymbols(allowed) => f
                .debug_tuple("AllowedSpecialSymbols")
                .field(allowed)
                .finish(),
            Self::Length { min, max } => f
                .debug_struct("Length")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Reserved(_) => f.write_str("Reserved"),
        }
    }
}

impl fmt::Display for StringRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Letter(Letter::HasLowercase) => f.write_str("a lowercase letter"),
            Self::Letter(Letter::HasUppercase) => f.write_str("an uppercase letter"),
            Self::Letter(Letter::HasDigit) => f.write_str("a digit"),
            Self::Letter(Letter::HasSpecialSymbol) => f.write_str("a special symbol"),
            Self::Letter(Letter::AllLowercase) => f.write_str("no uppercase letters"),
            Self::AllowedSpecialSymbols(allowed) => {
                let allowed: String = allowed.iter().collect();
                write!(f, "only {allowed:?} as special symbols")
            }
            Self::Length { min, max } => write!(f, "between {min} and {max} characters"),
            Self::Reserved(_) => f.write_str("not a reserved name"),
        }
    }
}

/// Build a trie from a word list: one word per line, blank lines and
/// `#` comments skipped, words lowercased.
pub fn parse_word_list(text: &str) -> TrieMap<()> {
    text.lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|word| (word, ()))
        .collect()
}

/// The bundled reserved-username list, parsed once.
pub fn reserved_usernames() -> Arc<TrieMap<()>> {
    Arc::clone(&RESERVED_USERNAMES)
}

pub fn default_username_requirements() -> Vec<StringRequirement> {
    vec![
        StringRequirement::Letter(Letter::AllLowercase),
        StringRequirement::AllowedSpecialSymbols(vec!['_']),
        StringRequirement::Length { min: 3, max: 32 },
        StringRequirement::Reserved(reserved_usernames()),
    ]
}

pub fn default_password_requirements() -> Vec<StringRequirement> {
    vec![
        StringRequirement::Letter(Letter::HasLowercase),
        StringRequirement::Letter(Letter::HasUppercase),
        StringRequirement::Letter(Letter::HasDigit),
        StringRequirement::Letter(Letter::HasSpecialSymbol),
        StringRequirement::Length { min: 8, max: 64 },
    ]
}

/// The requirements `value` does not satisfy, in list order.
pub fn missing_requirements(
    requirements: &[StringRequirement],
    value: &str,
) -> Vec<StringRequirement> {
    requirements
        .iter()
        .filter(|requirement| !requirement.is_satisfied_by(value))
        .cloned()
        .collect()
}
