use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

use crate::parser::ParsingError;

/// Maximum length of a tube name in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// The tube every connection uses and watches when it first connects.
pub const DEFAULT_TUBE: &str = "default";

/// A validated tube name.
///
/// Names are 1 to 200 bytes of letters, digits and any of `-+/;.$_()`, and
/// may not start with a hyphen. Since every allowed byte is ASCII, the name is
/// stored as a `String`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct TubeName(String);

impl TubeName {
    pub fn new(raw: &[u8]) -> Result<Self, ParsingError> {
        fn char_is_name_safe(c: u8, is_first: bool) -> bool {
            match c {
                b'a'..=b'z' => true,
                b'A'..=b'Z' => true,
                b'0'..=b'9' => true,
                b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
                b'-' => !is_first, // - is only name safe outside first position
                _ => false,
            }
        }

        if raw.is_empty()
            || raw.len() > MAX_TUBE_NAME_LEN
            || !raw
                .iter()
                .enumerate()
                .all(|(i, c)| char_is_name_safe(*c, i == 0))
        {
            return Err(ParsingError::BadFormat);
        }

        // Every byte was checked to be ASCII above.
        Ok(Self(raw.iter().map(|&c| char::from(c)).collect()))
    }

    pub fn default_tube() -> Self {
        Self(DEFAULT_TUBE.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TubeName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TubeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for TubeName {
    type Error = ParsingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert!(TubeName::try_from("tube_name_here-098+/;.()-$").is_ok());
        assert!(TubeName::try_from("a-").is_ok());
        assert_eq!(TubeName::default_tube().as_str(), "default");

        assert_eq!(TubeName::try_from(""), Err(ParsingError::BadFormat));
        assert_eq!(TubeName::try_from("-foo"), Err(ParsingError::BadFormat));
        assert_eq!(TubeName::try_from("foo bar"), Err(ParsingError::BadFormat));
        assert_eq!(TubeName::try_from("foo#bar"), Err(ParsingError::BadFormat));
        assert_eq!(TubeName::try_from("naïve"), Err(ParsingError::BadFormat));

        let longest = "a".repeat(MAX_TUBE_NAME_LEN);
        assert!(TubeName::try_from(longest.as_str()).is_ok());
        let too_long = "a".repeat(MAX_TUBE_NAME_LEN + 1);
        assert_eq!(
            TubeName::try_from(too_long.as_str()),
            Err(ParsingError::BadFormat)
        );
    }
}
