use std::fmt::{self, Display, Formatter};

use http::StatusCode;

use crate::json::JsonError;

/// Failures surfaced by the library.
///
/// Nothing is recovered internally except listener-handler failures (which
/// are converted to HTTP error responses); every other failure reaches the
/// caller verbatim with its cause chain intact.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An expected response or JSON field was not present.
    #[error("missing parameter `{0}`")]
    ParameterMissing(&'static str),

    /// A field was present with the wrong JSON type.
    #[error("parameter `{name}` is {got}, expected {expected}")]
    ParameterType {
        name: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    /// The `state` on the redirect did not match this grant
    /// (constant-time-checked).
    #[error("authorization response state does not match this grant")]
    InvalidState,

    /// The authorization server reported an error on the redirect.
    #[error("{0}")]
    AuthorizationGrant(AuthorizationGrantError),

    /// The authorization server reported an error from the token endpoint.
    #[error("{0}")]
    AccessToken(AccessTokenError),

    /// The token response carried a `token_type` other than `bearer`.
    #[error("unsupported token type `{0}`")]
    UnsupportedTokenType(String),

    /// A network or HTTP failure that is not an authorization-server error
    /// response.
    #[error("transport failure{}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        status: Option<StatusCode>,
        /// Response body, captured best-effort.
        body: Option<String>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Lenient JSON parsing failed.
    #[error("invalid JSON: {0}")]
    JsonParse(#[from] JsonError),

    /// The protected at-rest token blob could not be produced or decoded.
    #[error("invalid protected token blob: {0}")]
    InvalidProtectedBlob(&'static str),

    /// Listener-side protocol failure (400, 404, 405, 500).
    #[error("HTTP {code}: {message}")]
    Http { code: StatusCode, message: String },

    /// A caller-provided cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// HTTP status to answer a listener connection with, when this failure
    /// occurred while handling it.
    pub(crate) fn http_status(&self) -> StatusCode {
        match self {
            Error::Http { code, .. } => *code,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error reported by the authorization endpoint on the redirect, per
/// RFC 6749 §4.1.2.1.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationGrantError {
    pub code: AuthorizationErrorCode,
    pub description: Option<String>,
    pub uri: Option<String>,
}

/// Error reported by the token endpoint, per RFC 6749 §5.2.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessTokenError {
    pub code: AccessTokenErrorCode,
    pub description: Option<String>,
    pub uri: Option<String>,
}

/// RFC 6749 §4.1.2.1 authorization error codes, with a catch-all for
/// extensions.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizationErrorCode {
    InvalidRequest,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    ServerError,
    TemporarilyUnavailable,
    Unknown(String),
}

/// RFC 6749 §5.2 token endpoint error codes, with a catch-all for
/// extensions.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessTokenErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    Unknown(String),
}

impl From<&str> for AuthorizationErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "invalid_request" => AuthorizationErrorCode::InvalidRequest,
            "unauthorized_client" => AuthorizationErrorCode::UnauthorizedClient,
            "access_denied" => AuthorizationErrorCode::AccessDenied,
            "unsupported_response_type" => AuthorizationErrorCode::UnsupportedResponseType,
            "invalid_scope" => AuthorizationErrorCode::InvalidScope,
            "server_error" => AuthorizationErrorCode::ServerError,
            "temporarily_unavailable" => AuthorizationErrorCode::TemporarilyUnavailable,
            other => AuthorizationErrorCode::Unknown(other.to_string()),
        }
    }
}

impl From<&str> for AccessTokenErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "invalid_request" => AccessTokenErrorCode::InvalidRequest,
            "invalid_client" => AccessTokenErrorCode::InvalidClient,
            "invalid_grant" => AccessTokenErrorCode::InvalidGrant,
            "unauthorized_client" => AccessTokenErrorCode::UnauthorizedClient,
            "unsupported_grant_type" => AccessTokenErrorCode::UnsupportedGrantType,
            "invalid_scope" => AccessTokenErrorCode::InvalidScope,
            other => AccessTokenErrorCode::Unknown(other.to_string()),
        }
    }
}

impl Display for AuthorizationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let code = match self {
            AuthorizationErrorCode::InvalidRequest => "invalid_request",
            AuthorizationErrorCode::UnauthorizedClient => "unauthorized_client",
            AuthorizationErrorCode::AccessDenied => "access_denied",
            AuthorizationErrorCode::UnsupportedResponseType => "unsupported_response_type",
            AuthorizationErrorCode::InvalidScope => "invalid_scope",
            AuthorizationErrorCode::ServerError => "server_error",
            AuthorizationErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
            AuthorizationErrorCode::Unknown(other) => other,
        };
        f.write_str(code)
    }
}

impl Display for AccessTokenErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let code = match self {
            AccessTokenErrorCode::InvalidRequest => "invalid_request",
            AccessTokenErrorCode::InvalidClient => "invalid_client",
            AccessTokenErrorCode::InvalidGrant => "invalid_grant",
            AccessTokenErrorCode::UnauthorizedClient => "unauthorized_client",
            AccessTokenErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            AccessTokenErrorCode::InvalidScope => "invalid_scope",
            AccessTokenErrorCode::Unknown(other) => other,
        };
        f.write_str(code)
    }
}

/// Code, then the server-provided description and URI when present, joined
/// with newlines.
fn fmt_server_error(
    f: &mut Formatter<'_>,
    code: &dyn Display,
    description: Option<&str>,
    uri: Option<&str>,
) -> fmt::Result {
    write!(f, "{code}")?;
    if let Some(description) = description {
        write!(f, "\n{description}")?;
    }
    if let Some(uri) = uri {
        write!(f, "\n{uri}")?;
    }
    Ok(())
}

impl Display for AuthorizationGrantError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt_server_error(f, &self.code, self.description.as_deref(), self.uri.as_deref())
    }
}

impl Display for AccessTokenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt_server_error(f, &self.code, self.description.as_deref(), self.uri.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [
            "invalid_request",
            "invalid_client",
            "invalid_grant",
            "unauthorized_client",
            "unsupported_grant_type",
            "invalid_scope",
        ] {
            assert_eq!(AccessTokenErrorCode::from(code).to_string(), code);
        }
        assert_eq!(
            AccessTokenErrorCode::from("slow_down"),
            AccessTokenErrorCode::Unknown("slow_down".to_string())
        );
    }

    #[test]
    fn server_error_display_joins_with_newlines() {
        let err = AccessTokenError {
            code: AccessTokenErrorCode::InvalidGrant,
            description: Some("code expired".to_string()),
            uri: Some("https://as.example/errors".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "invalid_grant\ncode expired\nhttps://as.example/errors"
        );

        let bare = AuthorizationGrantError {
            code: AuthorizationErrorCode::AccessDenied,
            description: None,
            uri: None,
        };
        assert_eq!(bare.to_string(), "access_denied");
    }

    #[test]
    fn http_status_mapping() {
        let not_found = Error::Http {
            code: StatusCode::NOT_FOUND,
            message: "no route".to_string(),
        };
        assert_eq!(not_found.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Cancelled.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
