//! Access tokens: construction from token responses, bearer-header
//! injection, and the protected at-rest codec.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use rand::{thread_rng, Rng};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::digest;

use crate::error::Error;
use crate::json::Value;
use crate::secret::SecretString;
use crate::types::Scope;

/// Fixed entropy mixed into the at-rest protection key.
///
/// The value is part of the persisted format: blobs written with a different
/// constant do not decode.
pub(crate) const PROTECTION_ENTROPY: [u8; 64] = [
    0x83, 0xb3, 0x15, 0xa2, 0x81, 0x57, 0x01, 0x0d, 0x8c, 0x21, 0x04, 0xd9, 0x11, 0xb3, 0xa7,
    0x32, 0xba, 0xb9, 0x8c, 0x15, 0x7b, 0x64, 0x32, 0x2b, 0x2f, 0x5f, 0x0e, 0x0d, 0xe5, 0x0a,
    0x91, 0xc4, 0x46, 0x81, 0xae, 0x72, 0xf6, 0xa7, 0x01, 0x67, 0x01, 0x91, 0x66, 0x1b, 0x5e,
    0x5a, 0x51, 0xaa, 0xbe, 0xf3, 0x23, 0x2a, 0x01, 0xc5, 0x8d, 0x01, 0x24, 0x56, 0x9b, 0xbd,
    0xa6, 0xa3, 0x87, 0x87,
];

const BLOB_MAGIC: [u8; 2] = *b"OT";
const BLOB_VERSION: u8 = 1;

const TAG_TOKEN: u8 = 1;
const TAG_REFRESH: u8 = 2;
const TAG_AUTHORIZED: u8 = 3;
const TAG_EXPIRES: u8 = 4;
const TAG_SCOPE: u8 = 5;

const NONCE_LEN: usize = 12;

/// The kind of access token issued by the authorization server.
///
/// Only bearer tokens ([RFC 6750](https://tools.ietf.org/html/rfc6750)) are
/// issued today; the tagged representation leaves room for MAC or DPoP
/// variants without changing callers that only attach headers.
#[derive(Debug)]
pub enum TokenKind {
    /// Bearer token presented via the HTTP `Authorization` header.
    Bearer { material: SecretString },
}

impl TokenKind {
    /// The raw token material.
    pub fn material(&self) -> &SecretString {
        match self {
            TokenKind::Bearer { material } => material,
        }
    }

    /// Value for the `Authorization` header of an outgoing request.
    pub fn authorization_header(&self) -> Result<HeaderValue, Error> {
        match self {
            TokenKind::Bearer { material } => {
                HeaderValue::from_str(&format!("Bearer {}", material.reveal())).map_err(|_| {
                    Error::ParameterType {
                        name: "access_token",
                        expected: "header-safe string",
                        got: "control characters",
                    }
                })
            }
        }
    }
}

/// An access token issued by the authorization server.
///
/// All fields are immutable after construction. Two tokens compare equal iff
/// their material compares equal; the remaining fields are metadata.
#[derive(Debug)]
pub struct AccessToken {
    kind: TokenKind,
    refresh: Option<SecretString>,
    /// When the user initially authorized the client; advisory. `None` means
    /// unknown.
    authorized_at: Option<DateTime<Utc>>,
    /// `None` means the token never expires.
    expires_at: Option<DateTime<Utc>>,
    scope: Option<BTreeSet<Scope>>,
}

impl AccessToken {
    /// Assemble a token from already-validated parts.
    pub fn new(
        material: SecretString,
        refresh: Option<SecretString>,
        authorized_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
        scope: Option<BTreeSet<Scope>>,
    ) -> Result<Self, Error> {
        if material.is_empty() {
            return Err(Error::ParameterType {
                name: "access_token",
                expected: "non-empty string",
                got: "empty string",
            });
        }
        if let (Some(authorized), Some(expires)) = (authorized_at, expires_at) {
            if expires < authorized {
                return Err(Error::ParameterType {
                    name: "expires_at",
                    expected: "timestamp at or after authorized_at",
                    got: "earlier timestamp",
                });
            }
        }
        Ok(AccessToken {
            kind: TokenKind::Bearer { material },
            refresh,
            authorized_at,
            expires_at,
            scope,
        })
    }

    /// Build a token from a parsed token-response object.
    ///
    /// Dispatches on `token_type` (only `bearer`, case-insensitively, is
    /// supported), then extracts `access_token`, `expires_in`,
    /// `refresh_token` and `scope`. When the response omits `scope` and the
    /// caller supplied `expected_scope`, the expected set is adopted: the
    /// server granted the requested scope implicitly.
    pub(crate) fn from_token_response(
        value: &Value,
        expected_scope: Option<&BTreeSet<Scope>>,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        if value.as_object().is_none() {
            return Err(Error::ParameterType {
                name: "token response",
                expected: "object",
                got: value.type_name(),
            });
        }

        let token_type = require_str(value, "token_type")?;
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(Error::UnsupportedTokenType(token_type.to_string()));
        }

        let material = SecretString::new(require_str(value, "access_token")?);
        let expires_at = parse_expires_in(value, now)?;
        let refresh = optional_str(value, "refresh_token")?.map(SecretString::new);
        let scope = match optional_str(value, "scope")? {
            Some(joined) => Some(
                joined
                    .split_ascii_whitespace()
                    .map(Scope::from)
                    .collect::<BTreeSet<_>>(),
            ),
            None => expected_scope.cloned(),
        };

        AccessToken::new(material, refresh, Some(now), expires_at, scope)
    }

    /// The kind of token, for callers dispatching on the authorization
    /// scheme.
    pub fn kind(&self) -> &TokenKind {
        &self.kind
    }

    /// The raw bearer material.
    pub fn material(&self) -> &SecretString {
        self.kind.material()
    }

    /// Refresh token material, when the server issued any.
    pub fn refresh_material(&self) -> Option<&SecretString> {
        self.refresh.as_ref()
    }

    /// Whether [`TokenEndpoint::refresh`](crate::TokenEndpoint::refresh)
    /// can renew this token.
    pub fn is_refreshable(&self) -> bool {
        self.refresh.is_some()
    }

    /// When the user initially authorized the client; `None` when unknown.
    pub fn authorized_at(&self) -> Option<DateTime<Utc>> {
        self.authorized_at
    }

    /// When the token expires; `None` when it never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// The scope granted to the token, when known.
    pub fn scope(&self) -> Option<&BTreeSet<Scope>> {
        self.scope.as_ref()
    }

    /// `Authorization: Bearer <material>` header value.
    pub fn bearer_header(&self) -> Result<HeaderValue, Error> {
        self.kind.authorization_header()
    }

    /// Attach the token's authorization header to an outgoing request.
    pub fn apply_to(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        let mut value = self.bearer_header()?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Carry forward refresh material from the token being replaced, when
    /// the refresh response did not rotate it.
    pub(crate) fn carry_refresh_from(&mut self, previous: &AccessToken) {
        if self.refresh.is_none() {
            self.refresh = previous.refresh.as_ref().map(SecretString::try_clone);
        }
    }

    /// Serialize to the protected at-rest blob, base64-encoded for
    /// transport.
    ///
    /// Token and refresh material are stored encrypted; timestamps and scope
    /// are plain. The inverse is [`AccessToken::from_protected_string`].
    pub fn to_protected_string(&self) -> Result<String, Error> {
        Ok(STANDARD.encode(self.to_protected_blob()?))
    }

    /// Recover a token previously written by
    /// [`AccessToken::to_protected_string`].
    pub fn from_protected_string(encoded: &str) -> Result<Self, Error> {
        let blob = STANDARD
            .decode(encoded)
            .map_err(|_| Error::InvalidProtectedBlob("not base64"))?;
        Self::from_protected_blob(&blob)
    }

    fn to_protected_blob(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(&BLOB_MAGIC);
        out.push(BLOB_VERSION);

        write_field(&mut out, TAG_TOKEN, &protect(self.material())?);
        if let Some(refresh) = &self.refresh {
            write_field(&mut out, TAG_REFRESH, &protect(refresh)?);
        }
        if let Some(authorized) = self.authorized_at {
            write_field(&mut out, TAG_AUTHORIZED, &authorized.timestamp().to_le_bytes());
        }
        if let Some(expires) = self.expires_at {
            write_field(&mut out, TAG_EXPIRES, &expires.timestamp().to_le_bytes());
        }
        if let Some(scope) = &self.scope {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(scope.len() as u32).to_le_bytes());
            // BTreeSet iteration is already sorted, which keeps the blob
            // stable across writes.
            for entry in scope {
                payload.extend_from_slice(&(entry.as_str().len() as u32).to_le_bytes());
                payload.extend_from_slice(entry.as_str().as_bytes());
            }
            write_field(&mut out, TAG_SCOPE, &payload);
        }
        Ok(out)
    }

    fn from_protected_blob(blob: &[u8]) -> Result<Self, Error> {
        let mut reader = BlobReader { data: blob, pos: 0 };
        if reader.take(2)? != BLOB_MAGIC {
            return Err(Error::InvalidProtectedBlob("bad magic"));
        }
        if reader.take(1)?[0] != BLOB_VERSION {
            return Err(Error::InvalidProtectedBlob("unsupported version"));
        }

        let mut material = None;
        let mut refresh = None;
        let mut authorized_at = None;
        let mut expires_at = None;
        let mut scope = None;

        while !reader.is_empty() {
            let tag = reader.take(1)?[0];
            let len = reader.read_u32()? as usize;
            let payload = reader.take(len)?;
            match tag {
                TAG_TOKEN => material = Some(unprotect(payload)?),
                TAG_REFRESH => refresh = Some(unprotect(payload)?),
                TAG_AUTHORIZED => authorized_at = Some(read_timestamp(payload)?),
                TAG_EXPIRES => expires_at = Some(read_timestamp(payload)?),
                TAG_SCOPE => scope = Some(read_scope(payload)?),
                _ => return Err(Error::InvalidProtectedBlob("unknown field tag")),
            }
        }

        let material = material.ok_or(Error::ParameterMissing("Token"))?;
        AccessToken::new(material, refresh, authorized_at, expires_at, scope)
    }

    /// Parse a token previously written by
    /// [`AccessToken::to_json_envelope`] (or by the sibling runtime that
    /// shares the format).
    ///
    /// As on emit, `expires_in` is an absolute unix timestamp, not a
    /// duration.
    pub fn from_json_envelope(text: &str) -> Result<Self, Error> {
        let value = Value::parse(text)?;
        let material = SecretString::new(require_str(&value, "access_token")?);
        let refresh = optional_str(&value, "refresh_token")?.map(SecretString::new);
        let expires_at = match value.get("expires_in") {
            None | Some(Value::Null) => None,
            Some(Value::Int(seconds)) => DateTime::from_timestamp(*seconds, 0),
            Some(other) => {
                return Err(Error::ParameterType {
                    name: "expires_in",
                    expected: "integer",
                    got: other.type_name(),
                });
            }
        };
        AccessToken::new(material, refresh, None, expires_at, None)
    }

    /// Unencrypted JSON envelope for interop with the sibling runtime.
    ///
    /// `expires_in` is an absolute unix timestamp of the expiry, not a
    /// duration. Only emitted on explicit request.
    pub fn to_json_envelope(&self) -> String {
        let mut envelope = serde_json::Map::new();
        envelope.insert(
            "access_token".to_string(),
            serde_json::Value::from(self.material().reveal()),
        );
        if let Some(refresh) = &self.refresh {
            envelope.insert(
                "refresh_token".to_string(),
                serde_json::Value::from(refresh.reveal()),
            );
        }
        if let Some(expires) = self.expires_at {
            envelope.insert(
                "expires_in".to_string(),
                serde_json::Value::from(expires.timestamp()),
            );
        }
        serde_json::Value::Object(envelope).to_string()
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.material().ct_eq(other.material().reveal_bytes())
    }
}

impl Eq for AccessToken {}

impl Hash for AccessToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.material().reveal_bytes().hash(state);
    }
}

fn require_str<'a>(value: &'a Value, name: &'static str) -> Result<&'a str, Error> {
    match value.get(name) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(Error::ParameterType {
            name,
            expected: "string",
            got: other.type_name(),
        }),
        None => Err(Error::ParameterMissing(name)),
    }
}

fn optional_str<'a>(value: &'a Value, name: &'static str) -> Result<Option<&'a str>, Error> {
    match value.get(name) {
        Some(Value::Str(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(Error::ParameterType {
            name,
            expected: "string",
            got: other.type_name(),
        }),
    }
}

/// `expires_in` seconds relative to `now`. Values too large to represent
/// clamp to "never expires" rather than overflowing.
fn parse_expires_in(value: &Value, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
    let wrong_type = |got| Error::ParameterType {
        name: "expires_in",
        expected: "non-negative integer",
        got,
    };
    match value.get("expires_in") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Int(seconds)) => {
            if *seconds < 0 {
                return Err(wrong_type("negative integer"));
            }
            Ok(Duration::try_seconds(*seconds).and_then(|d| now.checked_add_signed(d)))
        }
        // Lenient parsing turns out-of-range integer literals into floats;
        // an integral value beyond i64 clamps to "never expires".
        Some(Value::Float(f)) if f.fract() == 0.0 && *f >= 0.0 => {
            if *f > i64::MAX as f64 {
                return Ok(None);
            }
            Ok(Duration::try_seconds(*f as i64).and_then(|d| now.checked_add_signed(d)))
        }
        Some(Value::Float(_)) => Err(wrong_type("number")),
        Some(other) => Err(wrong_type(other.type_name())),
    }
}

fn write_field(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

fn read_timestamp(payload: &[u8]) -> Result<DateTime<Utc>, Error> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| Error::InvalidProtectedBlob("malformed timestamp"))?;
    DateTime::from_timestamp(i64::from_le_bytes(bytes), 0)
        .ok_or(Error::InvalidProtectedBlob("timestamp out of range"))
}

fn read_scope(payload: &[u8]) -> Result<BTreeSet<Scope>, Error> {
    let mut reader = BlobReader {
        data: payload,
        pos: 0,
    };
    let count = reader.read_u32()?;
    let mut scope = BTreeSet::new();
    for _ in 0..count {
        let len = reader.read_u32()? as usize;
        let raw = reader.take(len)?;
        let entry = std::str::from_utf8(raw)
            .map_err(|_| Error::InvalidProtectedBlob("scope is not UTF-8"))?;
        scope.insert(Scope::from(entry));
    }
    if !reader.is_empty() {
        return Err(Error::InvalidProtectedBlob("trailing scope bytes"));
    }
    Ok(scope)
}

struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::InvalidProtectedBlob("truncated field"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| Error::InvalidProtectedBlob("truncated field"))?;
        Ok(u32::from_le_bytes(bytes))
    }
}

fn protection_key() -> Result<LessSafeKey, Error> {
    let key_bytes = digest::digest(&digest::SHA256, &PROTECTION_ENTROPY);
    let unbound = UnboundKey::new(&aead::AES_256_GCM, key_bytes.as_ref())
        .map_err(|_| Error::InvalidProtectedBlob("cipher initialization failed"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt secret material for the blob: random nonce prefix, then
/// AES-256-GCM ciphertext of the UTF-16LE bytes.
fn protect(material: &SecretString) -> Result<Vec<u8>, Error> {
    let key = protection_key()?;
    let mut nonce = [0u8; NONCE_LEN];
    thread_rng().fill(&mut nonce[..]);

    let mut in_out: Vec<u8> = material
        .reveal()
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| Error::InvalidProtectedBlob("encryption failed"))?;

    let mut payload = nonce.to_vec();
    payload.append(&mut in_out);
    Ok(payload)
}

fn unprotect(payload: &[u8]) -> Result<SecretString, Error> {
    if payload.len() < NONCE_LEN {
        return Err(Error::InvalidProtectedBlob("truncated ciphertext"));
    }
    let key = protection_key()?;
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| Error::InvalidProtectedBlob("truncated ciphertext"))?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::InvalidProtectedBlob("decryption failed"))?;

    if plaintext.len() % 2 != 0 {
        return Err(Error::InvalidProtectedBlob("malformed UTF-16 material"));
    }
    let units: Vec<u16> = plaintext
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let text = String::from_utf16(&units)
        .map_err(|_| Error::InvalidProtectedBlob("malformed UTF-16 material"))?;
    Ok(SecretString::new(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn scope_set(entries: &[&str]) -> BTreeSet<Scope> {
        entries.iter().copied().map(Scope::from).collect()
    }

    fn parse_response(json: &str) -> Result<AccessToken, Error> {
        AccessToken::from_token_response(&Value::parse(json).unwrap(), None, Utc::now())
    }

    #[test]
    fn minimal_token_response() {
        let token = parse_response(r#"{"access_token": "12/34", "token_type": "BEARER"}"#).unwrap();
        assert_eq!(token.material().reveal(), "12/34");
        assert_eq!(token.expires_at(), None);
        assert!(!token.is_refreshable());
        assert_eq!(token.scope(), None);
        assert!(!token.is_expired(Utc::now()));
    }

    #[test]
    fn complete_token_response() {
        let before = Utc::now();
        let token = parse_response(
            r#"{
                "access_token": "12/34",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "foobar",
                "scope": "read  write"
            }"#,
        )
        .unwrap();
        assert_eq!(token.material().reveal(), "12/34");
        assert_eq!(token.refresh_material().unwrap().reveal(), "foobar");
        assert_eq!(token.scope(), Some(&scope_set(&["read", "write"])));
        let expires = token.expires_at().unwrap();
        let delta = expires - before;
        assert!(delta.num_seconds() >= 3599 && delta.num_seconds() <= 3601);
    }

    #[test]
    fn unsupported_token_type() {
        let err = parse_response(r#"{"access_token": "x", "token_type": "mac"}"#).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTokenType(name) if name == "mac"));
    }

    #[test]
    fn missing_and_mistyped_fields() {
        let err = parse_response(r#"{"token_type": "bearer"}"#).unwrap_err();
        assert!(matches!(err, Error::ParameterMissing("access_token")));

        let err = parse_response(r#"{"access_token": "x"}"#).unwrap_err();
        assert!(matches!(err, Error::ParameterMissing("token_type")));

        let err = parse_response(
            r#"{"access_token": "x", "token_type": "bearer", "expires_in": "3600"}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ParameterType {
                name: "expires_in",
                ..
            }
        ));

        let err = parse_response(r#"{"access_token": 7, "token_type": "bearer"}"#).unwrap_err();
        assert!(matches!(
            err,
            Error::ParameterType {
                name: "access_token",
                ..
            }
        ));
    }

    #[test]
    fn oversized_expires_in_clamps_to_never() {
        // 10^20 overflows i64 during lenient parsing and clamps to the
        // no-expiry sentinel.
        let token = parse_response(
            r#"{"access_token": "x", "token_type": "bearer", "expires_in": 100000000000000000000}"#,
        )
        .unwrap();
        assert_eq!(token.expires_at(), None);
    }

    #[test]
    fn negative_expires_in_fails() {
        let err = parse_response(
            r#"{"access_token": "x", "token_type": "bearer", "expires_in": -1}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ParameterType {
                name: "expires_in",
                ..
            }
        ));
    }

    #[test]
    fn expected_scope_adopted_when_response_omits_it() {
        let expected = scope_set(&["config", "admin"]);
        let value = Value::parse(r#"{"access_token": "x", "token_type": "bearer"}"#).unwrap();
        let token = AccessToken::from_token_response(&value, Some(&expected), Utc::now()).unwrap();
        assert_eq!(token.scope(), Some(&expected));

        // An explicit scope in the response wins over the expected set.
        let value = Value::parse(
            r#"{"access_token": "x", "token_type": "bearer", "scope": "other"}"#,
        )
        .unwrap();
        let token = AccessToken::from_token_response(&value, Some(&expected), Utc::now()).unwrap();
        assert_eq!(token.scope(), Some(&scope_set(&["other"])));
    }

    #[test]
    fn equality_uses_material_only() {
        let now = Utc::now();
        let a = AccessToken::new(SecretString::new("same"), None, Some(now), None, None).unwrap();
        let b = AccessToken::new(
            SecretString::new("same"),
            Some(SecretString::new("r")),
            None,
            Some(now + Duration::hours(1)),
            Some(scope_set(&["read"])),
        )
        .unwrap();
        let c = AccessToken::new(SecretString::new("other"), None, None, None, None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn bearer_header() {
        let token =
            AccessToken::new(SecretString::new("tok-123"), None, None, None, None).unwrap();
        assert_eq!(token.bearer_header().unwrap().to_str().unwrap(), "Bearer tok-123");

        let mut headers = HeaderMap::new();
        token.apply_to(&mut headers).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
    }

    #[test]
    fn invariant_violations_rejected() {
        let err = AccessToken::new(SecretString::new(""), None, None, None, None).unwrap_err();
        assert!(matches!(
            err,
            Error::ParameterType {
                name: "access_token",
                ..
            }
        ));

        let now = Utc::now();
        let err = AccessToken::new(
            SecretString::new("x"),
            None,
            Some(now),
            Some(now - Duration::seconds(1)),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ParameterType {
                name: "expires_at",
                ..
            }
        ));
    }

    #[test]
    fn protected_blob_round_trip() {
        let authorized = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let expires = DateTime::from_timestamp(1_700_003_600, 0).unwrap();
        let token = AccessToken::new(
            SecretString::new("material-\u{1f510}"),
            Some(SecretString::new("refresh-material")),
            Some(authorized),
            Some(expires),
            Some(scope_set(&["config", "admin"])),
        )
        .unwrap();

        let encoded = token.to_protected_string().unwrap();
        let restored = AccessToken::from_protected_string(&encoded).unwrap();

        assert_eq!(restored, token);
        assert_eq!(restored.expires_at(), token.expires_at());
        assert_eq!(restored.authorized_at(), token.authorized_at());
        assert_eq!(restored.scope(), token.scope());
        assert_eq!(restored.is_refreshable(), token.is_refreshable());
        assert_eq!(
            restored.refresh_material().unwrap().reveal(),
            "refresh-material"
        );
    }

    #[test]
    fn protected_blob_round_trip_minimal() {
        let token = AccessToken::new(SecretString::new("only"), None, None, None, None).unwrap();
        let restored =
            AccessToken::from_protected_string(&token.to_protected_string().unwrap()).unwrap();
        assert_eq!(restored, token);
        assert_eq!(restored.expires_at(), None);
        assert!(!restored.is_refreshable());
        assert_eq!(restored.scope(), None);
    }

    #[test]
    fn material_is_encrypted_at_rest() {
        let token = AccessToken::new(
            SecretString::new("very-secret-material"),
            None,
            None,
            None,
            None,
        )
        .unwrap();
        let encoded = token.to_protected_string().unwrap();
        let blob = STANDARD.decode(&encoded).unwrap();
        let plain_utf16: Vec<u8> = "very-secret-material"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        assert!(!blob
            .windows(plain_utf16.len())
            .any(|window| window == plain_utf16));
    }

    #[test]
    fn tampered_blob_fails() {
        let token = AccessToken::new(SecretString::new("tok"), None, None, None, None).unwrap();
        let encoded = token.to_protected_string().unwrap();
        let mut blob = STANDARD.decode(&encoded).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let err = AccessToken::from_protected_string(&STANDARD.encode(&blob)).unwrap_err();
        assert!(matches!(err, Error::InvalidProtectedBlob(_)));
    }

    #[test]
    fn blob_without_token_field_fails() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&BLOB_MAGIC);
        blob.push(BLOB_VERSION);
        let err = AccessToken::from_protected_string(&STANDARD.encode(&blob)).unwrap_err();
        assert!(matches!(err, Error::ParameterMissing("Token")));
    }

    #[test]
    fn json_envelope() {
        let expires = DateTime::from_timestamp(1_700_003_600, 0).unwrap();
        let token = AccessToken::new(
            SecretString::new("at"),
            Some(SecretString::new("rt")),
            None,
            Some(expires),
            None,
        )
        .unwrap();
        let envelope: serde_json::Value =
            serde_json::from_str(&token.to_json_envelope()).unwrap();
        assert_eq!(envelope["access_token"], "at");
        assert_eq!(envelope["refresh_token"], "rt");
        // Absolute unix timestamp, not a duration.
        assert_eq!(envelope["expires_in"], 1_700_003_600i64);
    }

    #[test]
    fn json_envelope_round_trip() {
        let expires = DateTime::from_timestamp(1_700_003_600, 0).unwrap();
        let token = AccessToken::new(
            SecretString::new("at"),
            Some(SecretString::new("rt")),
            None,
            Some(expires),
            None,
        )
        .unwrap();
        let restored = AccessToken::from_json_envelope(&token.to_json_envelope()).unwrap();
        assert_eq!(restored, token);
        assert_eq!(restored.expires_at(), Some(expires));
        assert_eq!(restored.refresh_material().unwrap().reveal(), "rt");

        let minimal = AccessToken::from_json_envelope(r#"{"access_token":"only"}"#).unwrap();
        assert_eq!(minimal.material().reveal(), "only");
        assert_eq!(minimal.expires_at(), None);
        assert!(!minimal.is_refreshable());

        let err = AccessToken::from_json_envelope(r#"{"refresh_token":"rt"}"#).unwrap_err();
        assert!(matches!(err, Error::ParameterMissing("access_token")));
    }
}
