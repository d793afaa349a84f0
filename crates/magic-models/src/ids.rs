//! Newtype identifiers used across the control plane.
//!
//! Every entity that crosses a module boundary is referred to by a stable
//! string identifier rather than a pointer: sessions, clients, datalink
//! managers and client profiles. Cross-references (session → client context,
//! session → CDR) are resolved by id at use time.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string slice.
            pub fn new(id: &str) -> Self {
                Self(id.to_string())
            }

            /// Return the inner string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl FromStr for $name {
            type Err = Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }
    };
}

string_id! {
    /// Globally unique session identifier carried in every message
    /// (the `Session-Id` of the control protocol).
    ///
    /// # Examples
    ///
    /// ```
    /// use magic_models::SessionId;
    ///
    /// let id = SessionId::new("ife.cabin;1736640000;17");
    /// assert_eq!(id.to_string(), "ife.cabin;1736640000;17");
    /// ```
    SessionId
}

string_id! {
    /// Client identity, the `Origin-Host` of the requesting application
    /// (e.g. `"ife.cabin.aircraft"`).
    ClientId
}

string_id! {
    /// Administrative realm of a client (`Origin-Realm`), used when routing
    /// server-initiated notifications back to the client.
    Realm
}

string_id! {
    /// Identifier of a Data Link Manager, one per physical datalink
    /// (e.g. `"LINK_SATCOM"`, `"LINK_CELLULAR"`).
    DlmId
}

string_id! {
    /// Name of a client profile, the primary lookup key of the client
    /// configuration document (e.g. `"VOICE"`, `"CABIN_BULK"`).
    ProfileName
}

/// Bearer handle returned by a DLM for a reserved resource.
///
/// Zero is reserved to mean "no bearer assigned".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BearerId(pub u8);

impl BearerId {
    /// The "no bearer" sentinel.
    pub const NONE: BearerId = BearerId(0);

    /// True when a real bearer is assigned.
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for BearerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_display_and_equality() {
        let a = SessionId::new("client-a;1;1");
        let b: SessionId = "client-a;1;1".into();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "client-a;1;1");
    }

    #[test]
    fn ids_usable_in_collections() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(DlmId::new("LINK_SATCOM"));
        set.insert(DlmId::new("LINK_CELLULAR"));
        set.insert(DlmId::new("LINK_SATCOM"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn bearer_id_sentinel() {
        assert!(!BearerId::NONE.is_assigned());
        assert!(BearerId(7).is_assigned());
        assert_eq!(BearerId(7).to_string(), "7");
    }

    #[test]
    fn id_serde_roundtrip() {
        let id = ClientId::new("ife.cabin.aircraft");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ife.cabin.aircraft\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
