use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConversationId, "conv");
branded_id!(MessageId, "msg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_has_prefix() {
        let id = ConversationId::new();
        assert!(id.as_str().starts_with("conv_"), "got: {id}");
    }

    #[test]
    fn message_id_has_prefix() {
        let id = MessageId::new();
        assert!(id.as_str().starts_with("msg_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = ConversationId::new();
        let b = ConversationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ConversationId::from_raw("conv-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""conv-123""#);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = ConversationId::from_raw("external-thread-7");
        assert_eq!(id.as_str(), "external-thread-7");
        let parsed: ConversationId = "external-thread-7".parse().unwrap();
        assert_eq!(parsed, id);
    }
}
