use std::fmt::{Debug, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::secret::SecretString;

macro_rules! new_type {
    (
        $(#[$attr:meta])*
        $name:ident(String)
    ) => {
        $(#[$attr])*
        pub struct $name(String);
        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "` to wrap the given `String`.")]
            pub fn new(s: String) -> Self {
                $name(s)
            }

            /// Borrow the wrapped string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }
        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }
        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }
    };
}

macro_rules! new_secret_type {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        pub struct $name(SecretString);
        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "` to wrap the given secret.")]
            pub fn new<S>(s: S) -> Self
            where
                S: Into<SecretString>,
            {
                $name(s.into())
            }

            #[doc = concat!("Get the secret contained within this `", stringify!($name), "`.")]
            ///
            /// # Security Warning
            ///
            /// Leaking this value may compromise the security of the OAuth2
            /// flow.
            pub fn secret(&self) -> &str {
                self.0.reveal()
            }
        }
        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "([redacted])"))
            }
        }
    };
}

new_type![
    /// Client identifier issued to the client during the registration process
    /// described by [Section 2.2](https://tools.ietf.org/html/rfc6749#section-2.2).
    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
    ClientId(String)
];

new_type![
    /// Access token scope, as defined by the authorization server.
    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
    Scope(String)
];

/// URL of the authorization server's authorization endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUrl(Url);

/// URL of the authorization server's token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenUrl(Url);

macro_rules! url_accessors {
    ($name:ident) => {
        impl $name {
            /// Parse `url`, which must be an absolute URL.
            pub fn new<S>(url: S) -> Result<Self, url::ParseError>
            where
                S: AsRef<str>,
            {
                Ok($name(Url::parse(url.as_ref())?))
            }

            /// Wrap an already-parsed URL.
            pub fn from_url(url: Url) -> Self {
                $name(url)
            }

            /// The parsed URL.
            pub fn url(&self) -> &Url {
                &self.0
            }

            /// The URL in serialized form.
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }
    };
}

url_accessors!(AuthUrl);
url_accessors!(TokenUrl);

/// URL of the client's redirection endpoint.
///
/// The authorization server must receive exactly the registered value, and
/// the token request must echo exactly the value sent on the authorization
/// URL, so the caller's original spelling is kept alongside the parsed form
/// (URL re-serialization may normalize it).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectUrl {
    raw: String,
    url: Url,
}

impl RedirectUrl {
    /// Parse `url`, which must be absolute: a loopback `http` URL the
    /// redirect listener can receive, or a registered custom scheme.
    pub fn new<S>(url: S) -> Result<Self, url::ParseError>
    where
        S: Into<String>,
    {
        let raw = url.into();
        let url = Url::parse(&raw)?;
        Ok(RedirectUrl { raw, url })
    }

    /// The caller's original spelling, echoed bit-exact in requests.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed form, for hosts that inspect scheme or host.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

new_secret_type![
    /// Authorization code returned from the authorization endpoint.
    ///
    /// Not `Clone`: an authorization code may only be presented to the token
    /// endpoint once.
    AuthorizationCode
];

new_secret_type![
    /// Client password issued to the client during the registration process
    /// described by [Section 2.2](https://tools.ietf.org/html/rfc6749#section-2.2).
    ClientSecret
];

/// Client credentials attached to token requests via HTTP Basic
/// authentication.
#[derive(Debug)]
pub struct ClientCredentials {
    client_id: ClientId,
    client_secret: ClientSecret,
}

#[allow(missing_docs)]
impl ClientCredentials {
    pub fn new(client_id: ClientId, client_secret: ClientSecret) -> Self {
        ClientCredentials {
            client_id,
            client_secret,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn client_secret(&self) -> &ClientSecret {
        &self.client_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_url_keeps_original_spelling() {
        let redirect = RedirectUrl::new("org.example.app:/api/callback").unwrap();
        assert_eq!(redirect.as_str(), "org.example.app:/api/callback");
        assert_eq!(redirect.url().scheme(), "org.example.app");
    }

    #[test]
    fn redirect_url_rejects_relative() {
        assert!(RedirectUrl::new("/api/callback").is_err());
    }

    #[test]
    fn secret_types_redact_debug() {
        let secret = ClientSecret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "ClientSecret([redacted])");
        let code = AuthorizationCode::new("abc123");
        assert_eq!(format!("{code:?}"), "AuthorizationCode([redacted])");
        assert_eq!(code.secret(), "abc123");
    }

    #[test]
    fn scopes_sort_lexicographically() {
        let mut scopes = vec![Scope::from("write"), Scope::from("read")];
        scopes.sort();
        assert_eq!(scopes[0].as_str(), "read");
    }
}
