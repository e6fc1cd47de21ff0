//! Complete desktop authorization flow against a standard OAuth 2.0
//! authorization server.
//!
//! Configure the target server through the environment, then run the
//! example and follow the printed URL in a browser:
//!
//! ```sh
//! OAUTH_AUTH_URL=https://as.example.org/authorize \
//! OAUTH_TOKEN_URL=https://as.example.org/token \
//! OAUTH_CLIENT_ID=my-desktop-app \
//! OAUTH_SCOPE="profile email" \
//! cargo run --example desktop_flow
//! ```
//!
//! `OAUTH_CLIENT_SECRET` is optional; native applications are usually
//! public clients and rely on PKCE alone.

use std::env;
use std::net::{IpAddr, Ipv4Addr};

use oauth2_native::{
    params_from_uri, AuthUrl, AuthorizationGrant, ClientId, ClientSecret, HttpClient,
    RedirectListener, RedirectUrl, Scope, TokenUrl,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let auth_url = AuthUrl::new(env::var("OAUTH_AUTH_URL")?)?;
    let token_url = TokenUrl::new(env::var("OAUTH_TOKEN_URL")?)?;
    let client_id = ClientId::new(env::var("OAUTH_CLIENT_ID")?);

    // The listener picks a free port; the redirect URI must point at it.
    let mut listener = RedirectListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
    let redirect = RedirectUrl::new(format!("{}callback", listener.base_url()))?;
    println!("Listening for the redirect on {}", listener.local_addr());
    listener.start();

    let mut grant = AuthorizationGrant::new(auth_url, token_url, redirect, client_id);
    if let Ok(scope) = env::var("OAUTH_SCOPE") {
        grant = grant.set_scope(scope.split_whitespace().map(Scope::from));
    }
    if let Ok(secret) = env::var("OAUTH_CLIENT_SECRET") {
        grant = grant.set_client_secret(ClientSecret::new(secret));
    }

    println!("\nOpen this URL in your browser:\n\n{}\n", grant.authorize_url());

    let callback = listener.next_callback().await.ok_or("listener stopped")?;
    let token = grant
        .exchange(
            &params_from_uri(&callback),
            &HttpClient::new()?,
            &CancellationToken::new(),
        )
        .await?;
    listener.stop();

    println!("Access token obtained.");
    if let Some(expires) = token.expires_at() {
        println!("Expires at: {expires}");
    } else {
        println!("The token does not expire.");
    }
    if let Some(scope) = token.scope() {
        let names: Vec<&str> = scope.iter().map(|s| s.as_str()).collect();
        println!("Granted scope: {}", names.join(" "));
    }
    println!("Refreshable: {}", token.is_refreshable());
    println!("\nProtected at-rest form:\n{}", token.to_protected_string()?);

    Ok(())
}
