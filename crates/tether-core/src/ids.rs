//! Branded ID newtypes.
//!
//! A local message id, a server message id and a tab id are all strings on
//! the wire; wrapping them keeps a correlation id from being compared against
//! a server id by accident.
//!
//! Fresh IDs are UUID v7 (time-ordered) generated via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Client-assigned identifier of an optimistic message.
    ///
    /// Sent to the server as `localId` and echoed back as `correlationId`.
    LocalMessageId
}

branded_id! {
    /// Server-assigned identifier of a persisted message.
    ServerMessageId
}

branded_id! {
    /// Identifier of one client context (one "tab") sharing an origin.
    TabId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        let a = LocalMessageId::new();
        let b = LocalMessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn v7_ids_sort_by_creation() {
        let first = TabId::new();
        let second = TabId::new();
        assert!(first <= second);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ServerMessageId::from("srv_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"srv_1\"");
        let back: ServerMessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_and_conversions() {
        let id = LocalMessageId::from("loc_9".to_string());
        assert_eq!(id.to_string(), "loc_9");
        assert_eq!(id.as_str(), "loc_9");
        let s: String = id.into();
        assert_eq!(s, "loc_9");
    }
}
