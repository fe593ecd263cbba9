//! Password hashing for operator accounts.
//!
//! bcrypt with a per-hash salt; verification goes through bcrypt's own
//! constant-time path. The cost is clamped to the library's legal range.

use bcrypt::{DEFAULT_COST, hash, verify};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("hashing failed: {0}")]
    Hash(String),
}

/// Hash a password with the default cost.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    hash_password_with_cost(password, DEFAULT_COST)
}

/// Hash with an explicit cost, clamped to bcrypt's legal range (4..=31).
pub fn hash_password_with_cost(password: &str, cost: u32) -> Result<String, PasswordError> {
    let cost = cost.clamp(4, 31);
    hash(password, cost).map_err(|e| PasswordError::Hash(e.to_string()))
}

/// Verify a password against a stored hash. Malformed hashes verify false.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    verify(password, hashed).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cost 4 keeps the test suite fast; production uses DEFAULT_COST.
    const TEST_COST: u32 = 4;

    #[test]
    fn hash_verifies_original_and_rejects_other() {
        let hashed = hash_password_with_cost("s3cret", TEST_COST).unwrap();
        assert!(verify_password("s3cret", &hashed));
        assert!(!verify_password("s3cret!", &hashed));
    }

    #[test]
    fn independent_salts_produce_distinct_hashes() {
        let a = hash_password_with_cost("same-password", TEST_COST).unwrap();
        let b = hash_password_with_cost("same-password", TEST_COST).unwrap();
        assert_ne!(a, b);
        assert!(verify_password("same-password", &a));
        assert!(verify_password("same-password", &b));
    }

    #[test]
    fn out_of_range_cost_is_clamped() {
        let hashed = hash_password_with_cost("pw", 1).unwrap();
        assert!(verify_password("pw", &hashed));
    }

    #[test]
    fn malformed_hash_verifies_false() {
        assert!(!verify_password("pw", "not-a-bcrypt-hash"));
    }
}
