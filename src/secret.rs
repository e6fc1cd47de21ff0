use std::fmt::{Debug, Formatter};

use zeroize::Zeroize;

/// Holder for short-lived secret text (token material, PKCE verifiers, CSRF
/// state).
///
/// The contents never appear in `Debug` output and are overwritten in memory
/// when the holder is dropped. Equality is constant-time. The type is
/// deliberately not `Clone`; call [`SecretString::try_clone`] when a copy is
/// really needed.
pub struct SecretString(String);

impl SecretString {
    /// Create a new `SecretString`, copying the given text into protected
    /// storage.
    pub fn new<S>(s: S) -> Self
    where
        S: Into<String>,
    {
        SecretString(s.into())
    }

    /// Get the secret contained within this `SecretString`.
    ///
    /// # Security Warning
    ///
    /// Leaking this value may compromise the security of the OAuth2 flow.
    /// The borrow must not outlive the holder; do not copy the revealed text
    /// into longer-lived storage.
    pub fn reveal(&self) -> &str {
        &self.0
    }

    /// Byte view of the secret, for callers that compare or encode raw
    /// material.
    ///
    /// The same caveats as [`SecretString::reveal`] apply.
    pub fn reveal_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the holder is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constant-time comparison against `other`.
    ///
    /// Comparison time depends only on the lengths of the inputs, never on
    /// their contents.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        ring::constant_time::verify_slices_are_equal(self.0.as_bytes(), other).is_ok()
    }

    /// Explicitly duplicate the secret.
    ///
    /// Copies are intentionally loud: every clone is another buffer that must
    /// be zeroized on drop.
    pub fn try_clone(&self) -> Self {
        SecretString(self.0.clone())
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Debug for SecretString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([redacted])")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other.reveal_bytes())
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        SecretString::new(s)
    }
}
