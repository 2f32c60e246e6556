//! Typed identifiers for telemetry records.
//!
//! All IDs are opaque String wrappers (serde-transparent). Event ids are bare
//! UUID v4 strings; session and anonymous ids carry a short prefix so they
//! are recognisable in ingest logs.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for an event; doubles as the ingest idempotency key.
    EventId
);
typed_id!(
    /// Identifier for one browsing/process session.
    SessionId
);
typed_id!(
    /// Long-lived identifier for an unauthenticated installation.
    AnonymousId
);
typed_id!(
    /// Identifier of the signed-in user, when the host knows it.
    UserId
);

impl EventId {
    /// Create a new random event id (UUID v4).
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SessionId {
    pub const PREFIX: &'static str = "sess";

    pub fn generate() -> Self {
        Self(format!("{}_{}", Self::PREFIX, uuid::Uuid::new_v4()))
    }
}

impl AnonymousId {
    pub const PREFIX: &'static str = "anon";

    pub fn generate() -> Self {
        Self(format!("{}_{}", Self::PREFIX, uuid::Uuid::new_v4()))
    }
}
