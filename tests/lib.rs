//! Socket-level tests of the redirect listener and an end-to-end run of the
//! authorization flow.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use oauth2_native::{
    params_from_uri, AuthUrl, AuthorizationGrant, ClientId, HttpRequest, HttpResponse,
    PageResponse, RedirectListener, RedirectUrl, RequestHandler, Scope, TokenUrl,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;

async fn started_listener() -> RedirectListener {
    let mut listener = RedirectListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
        .await
        .expect("bind loopback");
    listener.start();
    listener
}

/// Send a raw request and collect the whole response; the listener speaks
/// HTTP/1.0 and closes the connection after responding.
async fn send_request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw.as_bytes()).await.expect("send");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (header, value) = line.split_once(':')?;
        header
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

#[tokio::test]
async fn callback_raises_event_and_redirects() {
    let mut listener = started_listener().await;
    let addr = listener.local_addr();

    let response = send_request(
        addr,
        "POST /callback?test123 HTTP/1.1\r\nContent-Length: 23\r\n\r\nThis is a test content.",
    )
    .await;

    assert!(response.starts_with("HTTP/1.0 301 "));
    let location = header_value(&response, "Location").expect("Location header");
    assert_eq!(location, format!("{}finished", listener.base_url()));

    let event = timeout(Duration::from_secs(5), listener.next_callback())
        .await
        .expect("callback within deadline")
        .expect("listener alive");
    assert_eq!(
        event.as_str(),
        format!("http://127.0.0.1:{}/callback?test123", addr.port())
    );
}

#[tokio::test]
async fn each_callback_raises_its_own_event() {
    let mut listener = started_listener().await;
    let addr = listener.local_addr();

    send_request(addr, "GET /callback?first HTTP/1.0\r\n\r\n").await;
    send_request(addr, "GET /callback?second HTTP/1.0\r\n\r\n").await;

    let first = timeout(Duration::from_secs(5), listener.next_callback())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(5), listener.next_callback())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.query(), Some("first"));
    assert_eq!(second.query(), Some("second"));
}

#[tokio::test]
async fn static_surface_content_types() {
    let listener = started_listener().await;
    let addr = listener.local_addr();

    let finished = send_request(addr, "GET /finished HTTP/1.0\r\n\r\n").await;
    assert!(finished.starts_with("HTTP/1.0 200 "));
    assert_eq!(
        header_value(&finished, "Content-Type"),
        Some("text/html; charset=UTF-8")
    );

    let script = send_request(addr, "GET /script.js HTTP/1.0\r\n\r\n").await;
    assert_eq!(header_value(&script, "Content-Type"), Some("text/javascript"));

    let style = send_request(addr, "GET /style.css HTTP/1.0\r\n\r\n").await;
    assert_eq!(header_value(&style, "Content-Type"), Some("text/css"));

    let favicon = send_request(addr, "GET /favicon.ico HTTP/1.0\r\n\r\n").await;
    assert_eq!(header_value(&favicon, "Content-Type"), Some("image/x-icon"));
}

#[tokio::test]
async fn unknown_paths_get_404() {
    let listener = started_listener().await;
    let response = send_request(listener.local_addr(), "GET /nonexisting HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 404 "));
    assert_eq!(
        header_value(&response, "Content-Type"),
        Some("text/html; charset=UTF-8")
    );
}

#[tokio::test]
async fn unsupported_methods_get_405() {
    let listener = started_listener().await;
    let response = send_request(listener.local_addr(), "DELETE /finished HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 405 "));
}

#[tokio::test]
async fn malformed_request_line_gets_400() {
    let listener = started_listener().await;
    let response = send_request(listener.local_addr(), "GET /finished\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 400 "));
}

#[tokio::test]
async fn path_matching_is_case_insensitive() {
    let mut listener = started_listener().await;
    let addr = listener.local_addr();

    let response = send_request(addr, "GET /CallBack?x=1 HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 301 "));
    timeout(Duration::from_secs(5), listener.next_callback())
        .await
        .unwrap()
        .unwrap();

    let finished = send_request(addr, "GET /FINISHED HTTP/1.0\r\n\r\n").await;
    assert!(finished.starts_with("HTTP/1.0 200 "));
}

struct FinishedOverride;

impl RequestHandler for FinishedOverride {
    fn handle(&self, uri: &Url) -> Option<PageResponse> {
        uri.path()
            .eq_ignore_ascii_case("/finished")
            .then(|| PageResponse::html("<h1>all done, go back to the app</h1>"))
    }
}

#[tokio::test]
async fn host_handler_preempts_default_routing() {
    let mut listener = RedirectListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
        .await
        .unwrap();
    listener.set_request_handler(Arc::new(FinishedOverride));
    listener.start();
    let addr = listener.local_addr();

    let finished = send_request(addr, "GET /finished HTTP/1.0\r\n\r\n").await;
    assert!(finished.contains("go back to the app"));

    // Unhandled paths still fall through to the built-in routing.
    let style = send_request(addr, "GET /style.css HTTP/1.0\r\n\r\n").await;
    assert_eq!(header_value(&style, "Content-Type"), Some("text/css"));
}

#[tokio::test]
async fn stop_closes_the_socket() {
    let mut listener = started_listener().await;
    let addr = listener.local_addr();

    // Reachable before stop.
    send_request(addr, "GET /finished HTTP/1.0\r\n\r\n").await;

    listener.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stream) => {
            // The connection may be accepted by the OS backlog race; the
            // listener must not answer it.
            let _ = stream
                .write_all(b"GET /finished HTTP/1.0\r\n\r\n")
                .await;
            let mut buf = Vec::new();
            let read = timeout(Duration::from_secs(2), stream.read_to_end(&mut buf)).await;
            assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_)) | Err(_)));
        }
    }
}

#[tokio::test]
async fn full_authorization_flow() {
    let mut listener = started_listener().await;
    let addr = listener.local_addr();

    let grant = AuthorizationGrant::new(
        AuthUrl::new("https://as.example.org/authorize").unwrap(),
        TokenUrl::new("https://as.example.org/token").unwrap(),
        RedirectUrl::new(format!("{}callback", listener.base_url())).unwrap(),
        ClientId::new("desktop-app".to_string()),
    )
    .set_scope([Scope::from("profile")]);

    let authorize_url = grant.authorize_url();
    let state = params_from_uri(&authorize_url)
        .remove("state")
        .expect("state parameter");

    // Simulate the authorization server redirecting the user's browser back
    // to the listener.
    let redirect = format!(
        "GET /callback?code=split-code&state={state} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        addr.port()
    );
    let response = send_request(addr, &redirect).await;
    assert!(response.starts_with("HTTP/1.0 301 "));

    let callback = timeout(Duration::from_secs(5), listener.next_callback())
        .await
        .unwrap()
        .unwrap();

    let http = |request: HttpRequest| {
        let body = String::from_utf8(request.body).unwrap();
        assert!(body.contains("grant_type=authorization_code"));
        assert!(body.contains("code=split-code"));
        std::future::ready(Ok::<_, std::io::Error>(HttpResponse {
            status_code: StatusCode::OK,
            headers: HeaderMap::new(),
            body: br#"{"access_token":"issued","token_type":"bearer","expires_in":3600}"#
                .to_vec(),
        }))
    };

    let token = grant
        .exchange(&params_from_uri(&callback), &http, &CancellationToken::new())
        .await
        .expect("exchange succeeds");
    assert_eq!(token.bearer_header().unwrap().to_str().unwrap(), "Bearer issued");
    assert_eq!(
        token.scope().unwrap().iter().next().unwrap().as_str(),
        "profile"
    );

    // The token survives a protected at-rest round trip.
    let restored =
        oauth2_native::AccessToken::from_protected_string(&token.to_protected_string().unwrap())
            .unwrap();
    assert_eq!(restored, token);
}
