//! Identifier and revision types for pool and ledger records.
//!
//! Every key that crosses the store boundary is a newtype so a product id can never be
//! passed where an order id is expected. `Revision` is the per-record write counter that
//! optimistic transactions compare against.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an identifier from external input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

/// Defines a string-backed identifier newtype.
///
/// Generated types offer `new()` for trusted input, `FromStr` that rejects empty or
/// whitespace-only input, `Display`, `AsRef<str>` and transparent serde support.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create the identifier from application-controlled data (no validation).
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the identifier, returning the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Store-assigned key of a pool record.
    PoolItemId,
    "pool item id"
);

string_id!(
    /// Catalogue identifier of a product.
    ProductId,
    "product id"
);

string_id!(
    /// Identifier of an in-progress order.
    OrderId,
    "order id"
);

string_id!(
    /// Identifier of a staff member.
    UserId,
    "user id"
);

/// Write counter of a single store record.
///
/// Starts at [`Revision::INITIAL`] when a record is created and increases by one on every
/// committed write. Optimistic transactions read a revision, compute, and only commit if
/// the record is still at that revision.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a freshly created record.
    pub const INITIAL: Self = Self(0);

    /// Create a revision with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The revision after one more committed write.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_input() {
        assert!("".parse::<ProductId>().is_err());
        assert!("   ".parse::<OrderId>().is_err());
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn parse_accepts_non_empty_input() {
        let id: PoolItemId = "-Nx81".parse().expect("parse should succeed");
        assert_eq!(id, PoolItemId::new("-Nx81"));
        assert_eq!(id.to_string(), "-Nx81");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_error_names_the_kind() {
        let err = "".parse::<UserId>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid user id: cannot be empty");
    }

    #[test]
    fn revision_advances() {
        let r = Revision::INITIAL.next().next();
        assert_eq!(r.value(), 2);
        assert!(r > Revision::INITIAL);
        assert_eq!(format!("{r}"), "r2");
    }
}
