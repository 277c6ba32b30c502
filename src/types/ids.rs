//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and serialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(SessionId, uuid);
define_id!(MessageId, uuid);
define_id!(CommId, uuid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(CommId::new(), CommId::new());
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_from_string_rejects_empty() {
        assert!(SessionId::from_string(String::new()).is_err());
        let id = SessionId::from_string("abc".to_string()).unwrap();
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = CommId::from_string("comm-1".to_string()).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"comm-1\"");
        let back: CommId = serde_json::from_str("\"comm-1\"").unwrap();
        assert_eq!(back, id);
    }
}
