//! Authorization Code Grant with PKCE
//! ([RFC 6749 §4.1](https://tools.ietf.org/html/rfc6749#section-4.1),
//! [RFC 7636](https://tools.ietf.org/html/rfc7636)).

use std::collections::{BTreeSet, HashMap};

use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::b64;
use crate::endpoint::{build_token_request, AsyncHttpClient, TokenEndpoint};
use crate::error::{AuthorizationGrantError, Error};
use crate::secret::SecretString;
use crate::token::AccessToken;
use crate::types::{
    AuthorizationCode, AuthUrl, ClientId, ClientSecret, RedirectUrl, Scope, TokenUrl,
};

/// PKCE transform applied to the code verifier
/// ([RFC 7636 §4.2](https://tools.ietf.org/html/rfc7636#section-4.2)).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    /// No PKCE parameters are sent.
    None,
    /// `code_challenge` is the verifier itself.
    Plain,
    /// `code_challenge = base64url(SHA-256(ASCII(code_verifier)))`.
    #[default]
    S256,
}

/// Query parameters managed by [`AuthorizationGrant::authorize_url`]; these
/// overwrite any same-named parameters already on the endpoint, and extra
/// parameters may not shadow them.
const MANAGED_PARAMS: [&str; 7] = [
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "state",
    "code_challenge",
    "code_challenge_method",
];

/// A single authorization attempt.
///
/// The anti-CSRF `state` and the PKCE `code_verifier` are generated from a
/// cryptographically strong RNG exactly once, at construction, and are
/// single-use: [`AuthorizationGrant::exchange`] consumes the grant, so a
/// finished (or failed) grant cannot be replayed. Build a fresh grant for
/// every authorization.
#[derive(Debug)]
pub struct AuthorizationGrant {
    authorization_endpoint: AuthUrl,
    token_endpoint: TokenUrl,
    redirect_endpoint: RedirectUrl,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
    scope: Option<Vec<Scope>>,
    challenge_method: CodeChallengeMethod,
    state: SecretString,
    code_verifier: SecretString,
    extra_params: Vec<(String, String)>,
}

impl AuthorizationGrant {
    /// Create a grant for the given endpoints and client.
    ///
    /// Defaults: PKCE S256, no scope, no client secret.
    pub fn new(
        authorization_endpoint: AuthUrl,
        token_endpoint: TokenUrl,
        redirect_endpoint: RedirectUrl,
        client_id: ClientId,
    ) -> Self {
        Self::with_state_prefix(
            authorization_endpoint,
            token_endpoint,
            redirect_endpoint,
            client_id,
            "",
        )
    }

    /// Like [`AuthorizationGrant::new`], with a caller-chosen prefix on the
    /// `state` value (useful for multiplexing several pending grants onto
    /// one redirect endpoint).
    ///
    /// The prefix never reduces entropy: 32 random bytes are appended
    /// regardless.
    pub fn with_state_prefix(
        authorization_endpoint: AuthUrl,
        token_endpoint: TokenUrl,
        redirect_endpoint: RedirectUrl,
        client_id: ClientId,
        state_prefix: &str,
    ) -> Self {
        AuthorizationGrant {
            authorization_endpoint,
            token_endpoint,
            redirect_endpoint,
            client_id,
            client_secret: None,
            scope: None,
            challenge_method: CodeChallengeMethod::default(),
            state: random_urlsafe(state_prefix.as_bytes()),
            code_verifier: random_urlsafe(&[]),
            extra_params: Vec::new(),
        }
    }

    /// Set the scope list requested from the authorization server, sent
    /// space-joined in transmission order.
    pub fn set_scope<I>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = Scope>,
    {
        self.scope = Some(scope.into_iter().collect());
        self
    }

    /// Attach a client secret; token requests then carry pre-authenticating
    /// HTTP Basic credentials.
    pub fn set_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Choose the PKCE transform. The default is S256.
    pub fn set_code_challenge_method(mut self, method: CodeChallengeMethod) -> Self {
        self.challenge_method = method;
        self
    }

    /// Append an extension query parameter to the authorization URL.
    ///
    /// Parameters managed by this grant (`state`, `code_challenge`, …)
    /// cannot be shadowed and are silently ignored here.
    pub fn add_extra_param<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let name = name.into();
        if !MANAGED_PARAMS.contains(&name.as_str()) {
            self.extra_params.push((name, value.into()));
        }
        self
    }

    /// The grant's anti-CSRF state, as sent in the `state` query parameter.
    pub fn state(&self) -> &SecretString {
        &self.state
    }

    /// The redirect endpoint this grant was built with.
    pub fn redirect_endpoint(&self) -> &RedirectUrl {
        &self.redirect_endpoint
    }

    /// Build the URL to open in the user's browser.
    ///
    /// Query parameters already present on the authorization endpoint are
    /// preserved; the grant's own parameters overwrite same-named ones.
    pub fn authorize_url(&self) -> Url {
        let mut url = self.authorization_endpoint.url().clone();

        let preserved: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !MANAGED_PARAMS.contains(&name.as_ref()))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        let joined_scope = self
            .scope
            .as_ref()
            .map(|scope| scope.iter().map(Scope::as_str).collect::<Vec<_>>().join(" "));
        let challenge = self.code_challenge();

        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(&preserved);
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", self.client_id.as_str());
            pairs.append_pair("redirect_uri", self.redirect_endpoint.as_str());
            if let Some(joined) = &joined_scope {
                pairs.append_pair("scope", joined);
            }
            pairs.append_pair("state", self.state.reveal());
            if let Some(challenge) = &challenge {
                pairs.append_pair("code_challenge_method", self.challenge_method_name());
                pairs.append_pair("code_challenge", challenge);
            }
            pairs.extend_pairs(self.extra_params.iter().map(|(n, v)| (n, v)));
        }
        url
    }

    fn challenge_method_name(&self) -> &'static str {
        match self.challenge_method {
            CodeChallengeMethod::None => "",
            CodeChallengeMethod::Plain => "plain",
            CodeChallengeMethod::S256 => "S256",
        }
    }

    fn code_challenge(&self) -> Option<String> {
        match self.challenge_method {
            CodeChallengeMethod::None => None,
            CodeChallengeMethod::Plain => Some(self.code_verifier.reveal().to_string()),
            CodeChallengeMethod::S256 => {
                let digest = Sha256::digest(self.code_verifier.reveal_bytes());
                Some(b64::encode(digest))
            }
        }
    }

    /// Validate the query parameters of a redirect response.
    ///
    /// Checks run in order: `state` present, `state` matching this grant
    /// (constant-time over the decoded bytes), no `error` reported by the
    /// server, `code` present. Never touches the network.
    pub fn validate_redirect(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<AuthorizationCode, Error> {
        let state = params
            .get("state")
            .ok_or(Error::ParameterMissing("state"))?;

        let own = Zeroizing::new(
            b64::decode(self.state.reveal()).map_err(|_| Error::InvalidState)?,
        );
        let received =
            Zeroizing::new(b64::decode(state).map_err(|_| Error::InvalidState)?);
        if ring::constant_time::verify_slices_are_equal(&own, &received).is_err() {
            return Err(Error::InvalidState);
        }

        if let Some(code) = params.get("error") {
            return Err(Error::AuthorizationGrant(AuthorizationGrantError {
                code: code.as_str().into(),
                description: params.get("error_description").cloned(),
                uri: params.get("error_uri").cloned(),
            }));
        }

        params
            .get("code")
            .map(|code| AuthorizationCode::new(code.as_str()))
            .ok_or(Error::ParameterMissing("code"))
    }

    /// Validate the redirect response and exchange its code for an access
    /// token.
    ///
    /// Consumes the grant: the state and verifier are single-use, so neither
    /// a consumed nor a failed grant can be presented again.
    pub async fn exchange<C>(
        self,
        params: &HashMap<String, String>,
        http: &C,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, Error>
    where
        C: AsyncHttpClient,
    {
        let code = self.validate_redirect(params)?;

        let mut body: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code.secret()),
            ("redirect_uri", self.redirect_endpoint.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if self.challenge_method != CodeChallengeMethod::None {
            body.push(("code_verifier", self.code_verifier.reveal()));
        }

        let credentials = self
            .client_secret
            .as_ref()
            .map(|secret| (&self.client_id, secret));
        let request = build_token_request(self.token_endpoint.url(), credentials, &body)?;

        debug!(
            token_endpoint = %self.token_endpoint.as_str(),
            "exchanging authorization code"
        );
        let expected_scope: Option<BTreeSet<Scope>> = self
            .scope
            .as_ref()
            .map(|scope| scope.iter().cloned().collect());
        TokenEndpoint::new(self.token_endpoint.clone())
            .request_token(http, request, expected_scope.as_ref(), cancel)
            .await
    }
}

/// Extract the query parameters of a redirect URI into the mapping consumed
/// by [`AuthorizationGrant::validate_redirect`].
pub fn params_from_uri(uri: &Url) -> HashMap<String, String> {
    uri.query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// base64url(no-pad) of `prefix ‖ 32 CSPRNG bytes`.
fn random_urlsafe(prefix: &[u8]) -> SecretString {
    let mut random = Zeroizing::new([0u8; 32]);
    thread_rng().fill(&mut random[..]);
    let mut raw = Zeroizing::new(Vec::with_capacity(prefix.len() + random.len()));
    raw.extend_from_slice(prefix);
    raw.extend_from_slice(&random[..]);
    SecretString::new(b64::encode(&raw[..]))
}
