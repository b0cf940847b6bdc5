use std::fmt;

use crate::error::CodecError;

/// Server side secret mixed into every verification hash.
///
/// Changing it invalidates the hash of every certificate minted before, so it only ever
/// arrives through configuration and is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Pepper(String);

impl Pepper {
    pub fn new(secret: impl Into<String>) -> Result<Self, CodecError> {
        let secret = secret.into();

        if secret.is_empty() {
            return Err(CodecError::EmptyPepper);
        }

        Ok(Self(secret))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pepper(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rejected() {
        assert_eq!(Pepper::new(""), Err(CodecError::EmptyPepper));
    }

    #[test]
    fn test_debug_redacted() {
        let pepper = Pepper::new("hunter2").unwrap();
        assert!(!format!("{pepper:?}").contains("hunter2"));
    }
}
