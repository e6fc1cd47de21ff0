#![warn(missing_docs)]
//! Client-side OAuth 2.0 for native desktop applications.
//!
//! This crate implements the Authorization Code Grant with PKCE
//! ([RFC 6749 §4.1](https://tools.ietf.org/html/rfc6749#section-4.1),
//! [RFC 7636](https://tools.ietf.org/html/rfc7636)) against an authorization
//! server, yields Bearer access tokens
//! ([RFC 6750](https://tools.ietf.org/html/rfc6750)) that refresh
//! transparently, persists them protected at rest, and ships the loopback
//! HTTP listener that receives the browser redirect completing an
//! authorization.
//!
//! # Flow
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use oauth2_native::{
//!     params_from_uri, AuthorizationGrant, AuthUrl, ClientId, HttpClient, RedirectListener,
//!     RedirectUrl, Scope, TokenUrl,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // Start the loopback listener that will receive the redirect.
//! let mut listener =
//!     RedirectListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
//! let redirect = RedirectUrl::new(format!("{}callback", listener.base_url()))?;
//! listener.start();
//!
//! // Build a grant: fresh anti-CSRF state and PKCE verifier, S256 by
//! // default.
//! let grant = AuthorizationGrant::new(
//!     AuthUrl::new("https://as.example.org/authorize")?,
//!     TokenUrl::new("https://as.example.org/token")?,
//!     redirect,
//!     ClientId::new("my-desktop-app".to_string()),
//! )
//! .set_scope([Scope::from("profile")]);
//!
//! // Open the authorization URL in the user's browser, then wait for the
//! // redirect to come back.
//! println!("Browse to: {}", grant.authorize_url());
//! let callback = listener.next_callback().await.expect("listener stopped");
//!
//! // Validate the redirect and exchange the code for an access token.
//! let http = HttpClient::new()?;
//! let cancel = CancellationToken::new();
//! let token = grant
//!     .exchange(&params_from_uri(&callback), &http, &cancel)
//!     .await?;
//!
//! // Use the token, persist it, refresh it later.
//! println!("Authorization: {:?}", token.bearer_header()?);
//! let at_rest = token.to_protected_string()?;
//! # let _ = at_rest;
//! # Ok(())
//! # }
//! ```
//!
//! # Pieces
//!
//! - [`AuthorizationGrant`]: one authorization attempt. PKCE and state
//!   generation, authorization-URL construction, redirect validation, code
//!   exchange. Single-use by construction.
//! - [`RedirectListener`]: minimal loopback HTTP listener accepting the
//!   browser redirect and serving a small static help surface.
//! - [`AccessToken`] / [`TokenEndpoint`]: token lifecycle. Bearer-header
//!   injection, refresh with scope continuity, protected at-rest blob and
//!   plain JSON envelope.
//! - [`SecretString`]: zeroized, constant-time-comparable secret holder
//!   used for all token and grant material.
//! - [`json::Value`]: the lenient JSON parser token responses are decoded
//!   with; its tolerance for comments, unquoted keys and case-insensitive
//!   keywords is part of this crate's contract.
//!
//! Cancellation: every operation that suspends on the network takes a
//! [`tokio_util::sync::CancellationToken`] and resolves to
//! [`Error::Cancelled`] once it fires.

pub mod b64;
mod endpoint;
mod error;
mod grant;
pub mod json;
mod listener;
mod secret;
mod token;
mod types;

pub use crate::endpoint::{
    AsyncHttpClient, HttpClient, HttpClientError, HttpRequest, HttpResponse, TokenEndpoint,
};
pub use crate::error::{
    AccessTokenError, AccessTokenErrorCode, AuthorizationErrorCode, AuthorizationGrantError,
    Error,
};
pub use crate::grant::{params_from_uri, AuthorizationGrant, CodeChallengeMethod};
pub use crate::listener::{PageResponse, RedirectListener, RequestHandler};
pub use crate::secret::SecretString;
pub use crate::token::{AccessToken, TokenKind};
pub use crate::types::{
    AuthorizationCode, AuthUrl, ClientCredentials, ClientId, ClientSecret, RedirectUrl, Scope,
    TokenUrl,
};
