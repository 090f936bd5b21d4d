use std::fmt::{Debug, Formatter};

use crate::ChurnError;

/// Shared-secret check in front of destructive store operations.
///
/// The secret is held in plain text and compared byte-for-byte. There is no
/// hashing and no lockout after repeated failures.
#[derive(Clone)]
pub struct AccessGate {
    secret: String,
}

impl Debug for AccessGate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Proof of one successful [`AccessGate`] check; consumed by the guarded call.
#[derive(Debug)]
#[must_use]
pub struct AccessGrant {
    _private: (),
}

impl AccessGate {
    /// # Errors
    /// Returns [`ChurnError::Configuration`] for an empty secret.
    pub fn new(secret: impl Into<String>) -> Result<Self, ChurnError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ChurnError::Configuration(
                "admin secret MUST be non-empty".to_string(),
            ));
        }
        Ok(Self { secret })
    }

    /// Case-sensitive equality against the configured secret.
    #[must_use]
    pub fn check(&self, provided: &str) -> bool {
        let expected = self.secret.as_bytes();
        let provided = provided.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }

        // No early exit on the first differing byte.
        let mut diff: u8 = 0;
        for (lhs, rhs) in expected.iter().zip(provided) {
            diff |= lhs ^ rhs;
        }
        diff == 0
    }

    /// Same check as [`AccessGate::check`], returning the grant on success.
    #[must_use]
    pub fn authorize(&self, provided: &str) -> Option<AccessGrant> {
        self.check(provided).then_some(AccessGrant { _private: () })
    }
}
