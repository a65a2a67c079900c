//! Fencing tokens
//!
//! A fencing token is the store revision at which a lock record was created.
//! The store's log orders every creation, so tokens for one lock name strictly
//! increase from holder to holder. No counter is kept on the client side.
//!
//! A holder passes its token along with every write to the protected
//! resource. The resource owner remembers the highest token it has seen and
//! rejects anything lower: a holder whose lease expired while it was paused
//! can no longer write once a successor has been served.

use leasehold_store::Revision;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// Proof of lock ownership at a point in the store's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(i64);

impl FencingToken {
    /// Create a token from a raw value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Derive the token from the revision that created the lock record.
    pub const fn from_revision(revision: Revision) -> Self {
        Self(revision)
    }

    /// Raw token value.
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<FencingToken> for i64 {
    fn from(token: FencingToken) -> Self {
        token.0
    }
}

/// A write carried a token older than one already accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Stale fencing token {presented} (highest accepted {highest})")]
pub struct StaleToken {
    /// Token presented with the rejected write
    pub presented: FencingToken,
    /// Highest token accepted so far
    pub highest: FencingToken,
}

/// Guard kept by the owner of a protected resource.
#[derive(Debug, Default)]
pub struct FencingValidator {
    highest: AtomicI64,
}

impl FencingValidator {
    /// Create a validator that has seen no tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest token accepted so far.
    pub fn highest(&self) -> Option<FencingToken> {
        match self.highest.load(Ordering::Acquire) {
            0 => None,
            value => Some(FencingToken(value)),
        }
    }

    /// Accept `token` if it is not older than any token already accepted.
    ///
    /// Equal tokens pass so the current holder may write repeatedly.
    pub fn validate(&self, token: FencingToken) -> Result<(), StaleToken> {
        let previous = self.highest.fetch_max(token.0, Ordering::AcqRel);
        if token.0 < previous {
            Err(StaleToken {
                presented: token,
                highest: FencingToken(previous),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ordering() {
        assert!(FencingToken::from_revision(8) > FencingToken::new(7));
        assert_eq!(i64::from(FencingToken::new(3)), 3);
        assert_eq!(FencingToken::new(12).to_string(), "12");
    }

    #[test]
    fn test_validator_rejects_stale_writer() {
        let validator = FencingValidator::new();
        assert_eq!(validator.highest(), None);

        validator.validate(FencingToken::new(5)).unwrap();
        validator.validate(FencingToken::new(5)).unwrap();
        validator.validate(FencingToken::new(9)).unwrap();

        let err = validator.validate(FencingToken::new(5)).unwrap_err();
        assert_eq!(err.presented, FencingToken::new(5));
        assert_eq!(err.highest, FencingToken::new(9));
        assert_eq!(validator.highest(), Some(FencingToken::new(9)));
    }

    #[test]
    fn test_token_serializes_as_number() {
        let json = serde_json::to_string(&FencingToken::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
