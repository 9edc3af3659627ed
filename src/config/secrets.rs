//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides the helpers the worker needs to
//! hand a secret to the signer without ever formatting it.

pub use secrecy::{ExposeSecret, SecretString};

/// Borrow the secret as raw key bytes for HMAC.
pub fn key_bytes(secret: &SecretString) -> &[u8] {
    secret.expose_secret().as_bytes()
}

/// Mask a non-secret identifier for display, keeping only a short prefix.
pub fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(8).collect();
    if prefix.len() < value.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_short_prefix() {
        assert_eq!(mask("abcdef0123456789"), "abcdef01...");
        assert_eq!(mask("short"), "short");
    }
}
