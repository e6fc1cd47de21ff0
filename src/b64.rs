//! URL-safe base64 without padding, as used for PKCE challenges, CSRF state
//! and the protected token blob (RFC 4648 §5, trailing `=` stripped).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::{DecodeError, Engine};

/// Encode `bytes` with the `-`/`_` alphabet and no trailing padding.
pub fn encode<B>(bytes: B) -> String
where
    B: AsRef<[u8]>,
{
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a base64url string produced by [`encode`].
///
/// Input length mod 4 may be 0, 2 or 3; a remainder of 1 cannot carry a whole
/// byte and fails, as does any character outside the alphabet.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}
