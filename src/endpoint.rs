//! Token endpoint client: request construction, transport seam, and
//! response/error mapping.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::{form_urlencoded, Url};

use crate::error::{AccessTokenError, Error};
use crate::json::Value;
use crate::token::AccessToken;
use crate::types::{ClientCredentials, ClientId, ClientSecret, Scope, TokenUrl};

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";
pub(crate) const CONTENT_TYPE_FORMENCODED: &str = "application/x-www-form-urlencoded";

/// `User-Agent` sent on token requests.
const LIB_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An HTTP request.
///
/// Owned values throughout, so the request can safely cross task boundaries.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// URL to which the HTTP request is being made.
    pub url: Url,
    /// HTTP request method for this request.
    pub method: Method,
    /// HTTP request headers to send.
    pub headers: HeaderMap,
    /// HTTP request body (typically for POST requests only).
    pub body: Vec<u8>,
}

/// An HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// HTTP status code returned by the server.
    pub status_code: StatusCode,
    /// HTTP response headers returned by the server.
    pub headers: HeaderMap,
    /// HTTP response body returned by the server.
    pub body: Vec<u8>,
}

/// Asynchronous HTTP transport used for token endpoint requests.
///
/// A default implementation backed by `reqwest` is provided by
/// [`HttpClient`]; tests substitute closures returning canned responses.
pub trait AsyncHttpClient: Send + Sync {
    /// Error type returned by failed requests.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Perform a single HTTP request.
    fn call(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + Send + '_>>;
}

impl<E, F, Fut> AsyncHttpClient for F
where
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse, E>> + Send + 'static,
{
    type Error = E;

    fn call(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, E>> + Send + '_>> {
        Box::pin(self(request))
    }
}

/// Error type returned by the built-in `reqwest` transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    /// Error returned by the `reqwest` crate.
    #[error("request failed")]
    Reqwest(#[from] reqwest::Error),
}

/// Default HTTP transport backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build the default client. Redirects are disabled: the token endpoint
    /// must answer directly.
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            // Following redirects opens the client up to SSRF
            // vulnerabilities.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| Error::Transport {
                status: None,
                body: None,
                source: Box::new(err),
            })?;
        Ok(HttpClient { client })
    }
}

impl AsyncHttpClient for HttpClient {
    type Error = HttpClientError;

    fn call(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpClientError>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, request.url.as_str())
                .body(request.body);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            let response = self.client.execute(builder.build()?).await?;

            let status_code = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?.to_vec();
            Ok(HttpResponse {
                status_code,
                headers,
                body,
            })
        })
    }
}

/// Client for a single token endpoint URL.
pub struct TokenEndpoint {
    url: TokenUrl,
}

impl TokenEndpoint {
    /// Client for the given token endpoint URL.
    pub fn new(url: TokenUrl) -> Self {
        TokenEndpoint { url }
    }

    /// The endpoint this client targets.
    pub fn url(&self) -> &TokenUrl {
        &self.url
    }

    /// Issue a token request already built by the authorization grant and
    /// map the response to an access token.
    ///
    /// When the response omits `scope` and `expected_scope` is provided, the
    /// expected set is adopted (the server granted the requested scope
    /// implicitly).
    pub async fn request_token<C>(
        &self,
        http: &C,
        request: HttpRequest,
        expected_scope: Option<&BTreeSet<Scope>>,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, Error>
    where
        C: AsyncHttpClient,
    {
        let response = execute(http, request, cancel).await?;
        token_from_response(response, expected_scope)
    }

    /// Exchange a refresh token for a new access token
    /// ([RFC 6749 §6](https://tools.ietf.org/html/rfc6749#section-6)).
    ///
    /// The requested scope is the token's own, preserving scope continuity.
    /// When the response does not rotate the refresh token, the old refresh
    /// material is carried forward.
    pub async fn refresh<C>(
        &self,
        http: &C,
        token: &AccessToken,
        credentials: Option<&ClientCredentials>,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, Error>
    where
        C: AsyncHttpClient,
    {
        let refresh = token
            .refresh_material()
            .ok_or(Error::ParameterMissing("refresh_token"))?;

        let joined_scope = token.scope().map(join_scope);
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh.reveal()),
        ];
        if let Some(joined) = &joined_scope {
            params.push(("scope", joined.as_str()));
        }

        let request = build_token_request(
            self.url.url(),
            credentials.map(|c| (c.client_id(), c.client_secret())),
            &params,
        )?;

        debug!(url = %self.url.as_str(), "refreshing access token");
        let response = execute(http, request, cancel).await?;
        let mut refreshed = token_from_response(response, token.scope())?;
        refreshed.carry_refresh_from(token);
        Ok(refreshed)
    }
}

pub(crate) fn join_scope(scope: &BTreeSet<Scope>) -> String {
    scope
        .iter()
        .map(Scope::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a token endpoint POST: form body, JSON accept, and, when client
/// credentials are supplied, a pre-authenticating HTTP Basic header
/// (credentials go out on the first request, without waiting for a 401
/// challenge).
pub(crate) fn build_token_request(
    url: &Url,
    credentials: Option<(&ClientId, &ClientSecret)>,
    params: &[(&str, &str)],
) -> Result<HttpRequest, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_JSON));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_FORMENCODED));
    headers.insert(USER_AGENT, HeaderValue::from_static(LIB_USER_AGENT));

    if let Some((client_id, client_secret)) = credentials {
        // Section 2.3.1 of RFC 6749 requires separately url-encoding the id
        // and secret before using them as Basic auth username and password.
        let urlencoded_id: String =
            form_urlencoded::byte_serialize(client_id.as_str().as_bytes()).collect();
        let urlencoded_secret: String =
            form_urlencoded::byte_serialize(client_secret.secret().as_bytes()).collect();
        let credential = STANDARD.encode(format!("{urlencoded_id}:{urlencoded_secret}"));
        let mut value = HeaderValue::from_str(&format!("Basic {credential}")).map_err(|err| {
            Error::Transport {
                status: None,
                body: None,
                source: Box::new(err),
            }
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    let body = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
        .into_bytes();

    Ok(HttpRequest {
        url: url.to_owned(),
        method: Method::POST,
        headers,
        body,
    })
}

/// Perform the request, honoring the caller's cancellation signal at the
/// network suspension point.
async fn execute<C>(
    http: &C,
    request: HttpRequest,
    cancel: &CancellationToken,
) -> Result<HttpResponse, Error>
where
    C: AsyncHttpClient,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = http.call(request) => result.map_err(|err| Error::Transport {
            status: None,
            body: None,
            source: Box::new(err),
        }),
    }
}

/// Map a token endpoint response: 2xx bodies parse as token responses, 400
/// bodies parse as RFC 6749 §5.2 error responses, anything else surfaces as
/// a transport failure with the body captured best-effort.
pub(crate) fn token_from_response(
    response: HttpResponse,
    expected_scope: Option<&BTreeSet<Scope>>,
) -> Result<AccessToken, Error> {
    let status = response.status_code;
    let body = match std::str::from_utf8(&response.body) {
        Ok(body) => body,
        Err(err) => {
            return Err(Error::Transport {
                status: Some(status),
                body: None,
                source: Box::new(err),
            });
        }
    };

    if status == StatusCode::BAD_REQUEST {
        return Err(parse_error_response(body, status));
    }
    if !status.is_success() {
        return Err(Error::Transport {
            status: Some(status),
            body: Some(body.to_string()),
            source: format!("token endpoint returned HTTP {status}").into(),
        });
    }

    let value = Value::parse(body)?;
    AccessToken::from_token_response(&value, expected_scope, Utc::now())
}

fn parse_error_response(body: &str, status: StatusCode) -> Error {
    let value = match Value::parse(body) {
        Ok(value) => value,
        Err(err) => {
            return Error::Transport {
                status: Some(status),
                body: Some(body.to_string()),
                source: Box::new(err),
            };
        }
    };
    let code = match value.get("error").and_then(Value::as_str) {
        Some(code) => code.into(),
        None => return Error::ParameterMissing("error"),
    };
    Error::AccessToken(AccessTokenError {
        code,
        description: value
            .get("error_description")
            .and_then(Value::as_str)
            .map(str::to_string),
        uri: value
            .get("error_uri")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
