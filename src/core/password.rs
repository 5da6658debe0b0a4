//! Random password generation matching Secrets Manager's `GetRandomPassword`.

use crate::constants;
use crate::models::config::PasswordSection;
use rand::{rngs::OsRng, seq::SliceRandom, Rng};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswordError {
    #[error("password length {length} outside {min}..={max}")]
    LengthOutOfRange { length: usize, min: usize, max: usize },
    #[error("exclusions leave no {0} characters but each type is required")]
    EmptyCharacterClass(&'static str),
    #[error("exclusions leave no characters to draw from")]
    EmptyAlphabet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub length: usize,
    pub exclude_characters: String,
    pub exclude_punctuation: bool,
    pub require_each_included_type: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self::from(&PasswordSection::default())
    }
}

impl From<&PasswordSection> for PasswordPolicy {
    fn from(section: &PasswordSection) -> Self {
        Self {
            length: section.length,
            exclude_characters: section.exclude_characters.clone(),
            exclude_punctuation: section.exclude_punctuation,
            require_each_included_type: section.require_each_included_type,
        }
    }
}

struct CharClass {
    name: &'static str,
    chars: Vec<char>,
}

impl PasswordPolicy {
    fn classes(&self) -> Vec<CharClass> {
        let keep = |c: &char| !self.exclude_characters.contains(*c);
        let mut classes = vec![
            CharClass {
                name: "lowercase",
                chars: ('a'..='z').filter(keep).collect(),
            },
            CharClass {
                name: "uppercase",
                chars: ('A'..='Z').filter(keep).collect(),
            },
            CharClass {
                name: "digit",
                chars: ('0'..='9').filter(keep).collect(),
            },
        ];
        if !self.exclude_punctuation {
            classes.push(CharClass {
                name: "punctuation",
                chars: constants::PUNCTUATION.chars().filter(keep).collect(),
            });
        }
        classes
    }

    pub fn validate(&self) -> Result<(), PasswordError> {
        if !(constants::MIN_PASSWORD_LENGTH..=constants::MAX_PASSWORD_LENGTH).contains(&self.length)
        {
            return Err(PasswordError::LengthOutOfRange {
                length: self.length,
                min: constants::MIN_PASSWORD_LENGTH,
                max: constants::MAX_PASSWORD_LENGTH,
            });
        }
        let classes = self.classes();
        if self.require_each_included_type {
            if let Some(empty) = classes.iter().find(|c| c.chars.is_empty()) {
                return Err(PasswordError::EmptyCharacterClass(empty.name));
            }
        }
        if classes.iter().all(|c| c.chars.is_empty()) {
            return Err(PasswordError::EmptyAlphabet);
        }
        Ok(())
    }

    /// Generate a password from the OS random source.
    pub fn generate(&self) -> Result<Zeroizing<String>, PasswordError> {
        self.validate()?;
        let classes = self.classes();
        let alphabet: Vec<char> = classes.iter().flat_map(|c| c.chars.iter().copied()).collect();

        let mut rng = OsRng;
        let mut out: Zeroizing<Vec<char>> = Zeroizing::new(Vec::with_capacity(self.length));
        if self.require_each_included_type {
            for class in &classes {
                out.push(class.chars[rng.gen_range(0..class.chars.len())]);
            }
        }
        while out.len() < self.length {
            out.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        out.shuffle(&mut rng);
        Ok(Zeroizing::new(out.iter().collect()))
    }
}
