//! Loopback HTTP callback listener.
//!
//! A minimal HTTP/1.0 server bound to a loopback address whose job is to
//! accept the browser redirect that completes an authorization, surface it
//! to the host application as a callback event, and serve a small static
//! help surface around it. It is deliberately not a general-purpose web
//! server: one listener, short-lived connections, no TLS (the redirect
//! never leaves the device).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;

/// Upper bound on the request-line-plus-headers block; longer requests are
/// malformed or malicious and get a 400.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// In-flight connections get this long to finish after `stop`; the accept
/// loop itself stops immediately.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const CONTENT_TYPE_HTML: &str = "text/html; charset=UTF-8";
const CONTENT_TYPE_JS: &str = "text/javascript";
const CONTENT_TYPE_CSS: &str = "text/css";
const CONTENT_TYPE_ICO: &str = "image/x-icon";

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Authorization complete</title>
<link rel="stylesheet" href="/style.css">
<script src="/script.js" defer></script>
</head>
<body>
<main>
<h1>Authorization complete</h1>
<p>You have signed in successfully. You can close this window and return to the application.</p>
</main>
</body>
</html>
"#;

const REDIRECT_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Redirecting</title></head>
<body><p><a href="/finished">Continue</a></p></body>
</html>
"#;

const SCRIPT_JS: &str = r#"window.addEventListener("load", function () {
    // Give the user a moment to read the page, then try to close the tab.
    setTimeout(function () { window.close(); }, 2000);
});
"#;

const STYLE_CSS: &str = r#"body {
    font-family: system-ui, sans-serif;
    margin: 0;
    display: flex;
    justify-content: center;
}
main {
    max-width: 32rem;
    padding: 3rem 1rem;
    text-align: center;
}
h1 {
    font-size: 1.5rem;
}
"#;

/// 1x1 transparent icon, so browsers asking for /favicon.ico get a valid
/// answer instead of a 404.
const FAVICON_ICO: [u8; 70] = [
    // ICONDIR: reserved, type 1 (icon), 1 image.
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
    // ICONDIRENTRY: 1x1, 32bpp, 48-byte image at offset 22.
    0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x30, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00,
    0x00,
    // BITMAPINFOHEADER, height doubled for the AND mask.
    0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x20,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // One transparent BGRA pixel.
    0x00, 0x00, 0x00, 0x00,
    // AND mask row, padded to four bytes.
    0x00, 0x00, 0x00, 0x00,
];

/// Content injected for a request by a [`RequestHandler`].
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub struct PageResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl PageResponse {
    /// A 200 HTML page.
    pub fn html<B>(body: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        PageResponse {
            status: StatusCode::OK,
            content_type: CONTENT_TYPE_HTML.to_string(),
            body: body.into(),
        }
    }
}

/// Host hook consulted before the built-in routing.
///
/// Returning `Some` serves that response for the request (this is how a host
/// replaces the default `/finished` page or adds its own paths); `None`
/// falls through to the built-in routing. Handlers run on the connection's
/// own task, so a blocking handler stalls only that connection.
pub trait RequestHandler: Send + Sync {
    /// Decide whether to serve `uri`; `None` defers to the built-in routes.
    fn handle(&self, uri: &Url) -> Option<PageResponse>;
}

/// Loopback redirect listener.
///
/// Bound at construction; [`RedirectListener::start`] begins accepting, and
/// each `/callback` request raises one event carrying the absolute redirect
/// URI. Dropping the listener stops it.
pub struct RedirectListener {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    base_url: Url,
    handler: Option<Arc<dyn RequestHandler>>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<Url>,
    events_rx: mpsc::UnboundedReceiver<Url>,
    accept_task: Option<JoinHandle<()>>,
}

impl RedirectListener {
    /// Bind to `(address, port)`; port 0 asks the OS for a free port.
    ///
    /// `address` must be a loopback address: the listener exists so the
    /// redirect never leaves the device.
    pub async fn bind(address: IpAddr, port: u16) -> std::io::Result<Self> {
        if !address.is_loopback() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "redirect listener must bind a loopback address",
            ));
        }
        let listener = TcpListener::bind((address, port)).await?;
        let local_addr = listener.local_addr()?;
        let base_url = Url::parse(&format!("http://{local_addr}/")).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unroutable local address")
        })?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(RedirectListener {
            listener: Some(listener),
            local_addr,
            base_url,
            handler: None,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx,
            accept_task: None,
        })
    }

    /// The endpoint actually bound, with the OS-assigned port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://<loopback>:<port>/`, the base against which request targets
    /// resolve. Register `<base>callback` as the client's redirect URI.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Install the host's request hook. Takes effect for connections
    /// accepted after the next [`RedirectListener::start`].
    pub fn set_request_handler(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    /// Start the accept loop on a background task. Idempotent.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let base_url = self.base_url.clone();
        let handler = self.handler.clone();
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        debug!(addr = %self.local_addr, "redirect listener starting");
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener, base_url, handler, events_tx, cancel,
        )));
    }

    /// Next `/callback` redirect received by the listener.
    ///
    /// Each `/callback` request raises its own event; with concurrent
    /// authorizations the host matches events to grants via the `state`
    /// parameter.
    pub async fn next_callback(&mut self) -> Option<Url> {
        self.events_rx.recv().await
    }

    /// Stop accepting connections by closing the listening socket.
    /// In-flight connections finish on their own or time out.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Drop for RedirectListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    base_url: Url,
    handler: Option<Arc<dyn RequestHandler>>,
    events_tx: mpsc::UnboundedSender<Url>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("redirect listener stopped");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                let base_url = base_url.clone();
                let handler = handler.clone();
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    let served = tokio::time::timeout(
                        CONNECTION_TIMEOUT,
                        handle_connection(stream, base_url, handler, events_tx),
                    )
                    .await;
                    if served.is_err() {
                        warn!(%peer, "connection timed out");
                    }
                });
            }
            Err(err) => {
                // Transient accept failures must not take the listener
                // down; back off briefly so a persistent failure cannot
                // spin.
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    base_url: Url,
    handler: Option<Arc<dyn RequestHandler>>,
    events_tx: mpsc::UnboundedSender<Url>,
) {
    let mut reader = BufReader::new(stream);
    let response = match serve_request(&mut reader, &base_url, handler.as_deref(), &events_tx)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!(error = %err, "request failed");
            error_response(&err)
        }
    };
    // The error response is best-effort; a peer that hung up is not an
    // event worth propagating.
    if let Err(err) = write_response(reader.get_mut(), &response).await {
        debug!(error = %err, "failed to write response");
    }
    let _ = reader.get_mut().shutdown().await;
}

struct WireResponse {
    status: StatusCode,
    content_type: String,
    location: Option<String>,
    body: Vec<u8>,
}

impl From<PageResponse> for WireResponse {
    fn from(page: PageResponse) -> Self {
        WireResponse {
            status: page.status,
            content_type: page.content_type,
            location: None,
            body: page.body,
        }
    }
}

#[derive(Debug)]
struct ParsedRequest {
    target: String,
    content_length: Option<u64>,
}

async fn serve_request<R>(
    reader: &mut R,
    base_url: &Url,
    handler: Option<&dyn RequestHandler>,
    events_tx: &mpsc::UnboundedSender<Url>,
) -> Result<WireResponse, Error>
where
    R: AsyncRead + Unpin,
{
    let header_block = read_header_block(reader).await?;
    let request = parse_request(&header_block)?;

    // The body is drained and discarded; only the target matters.
    if let Some(length) = request.content_length {
        drain_body(reader, length).await?;
    }

    let uri = Url::options()
        .base_url(Some(base_url))
        .parse(&request.target)
        .map_err(|_| Error::Http {
            code: StatusCode::BAD_REQUEST,
            message: format!("unresolvable request target `{}`", request.target),
        })?;

    if let Some(handler) = handler {
        if let Some(page) = handler.handle(&uri) {
            return Ok(page.into());
        }
    }

    route(&uri, base_url, events_tx)
}

/// Read up to and including the CRLF-CRLF terminator, one byte at a time
/// with a rolling four-byte window, so the partial block never needs to be
/// rescanned.
async fn read_header_block<R>(reader: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut block = Vec::new();
    let mut tail = [0u8; 4];
    loop {
        let byte = reader.read_u8().await.map_err(|_| Error::Http {
            code: StatusCode::BAD_REQUEST,
            message: "truncated request".to_string(),
        })?;
        block.push(byte);
        if block.len() > MAX_HEADER_BYTES {
            return Err(Error::Http {
                code: StatusCode::BAD_REQUEST,
                message: "request header block too large".to_string(),
            });
        }
        tail = [tail[1], tail[2], tail[3], byte];
        if tail == *b"\r\n\r\n" {
            return Ok(block);
        }
    }
}

fn parse_request(block: &[u8]) -> Result<ParsedRequest, Error> {
    let bad_request = |message: &str| Error::Http {
        code: StatusCode::BAD_REQUEST,
        message: message.to_string(),
    };

    let text = String::from_utf8_lossy(block);
    let mut lines = text.lines().filter(|line| !line.is_empty());

    let request_line = lines.next().ok_or_else(|| bad_request("empty request"))?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(bad_request("malformed request line"));
    }
    let method = parts[0].to_ascii_uppercase();
    if method != "GET" && method != "POST" {
        return Err(Error::Http {
            code: StatusCode::METHOD_NOT_ALLOWED,
            message: format!("method {method} not allowed"),
        });
    }
    let target = parts[1].to_string();

    // Header fields: name and value split at the first colon, folded
    // continuation lines appended with a single leading space, duplicates
    // joined with a comma.
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut last_name: Option<String> = None;
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            let name = last_name
                .as_ref()
                .ok_or_else(|| bad_request("continuation before any header"))?;
            if let Some(value) = headers.get_mut(name) {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad_request("malformed header line"))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match headers.get_mut(&name) {
            Some(existing) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => {
                headers.insert(name.clone(), value.to_string());
            }
        }
        last_name = Some(name);
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.trim().parse::<u64>().ok());

    Ok(ParsedRequest {
        target,
        content_length,
    })
}

async fn drain_body<R>(reader: &mut R, length: u64) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = length;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        let read = reader.read(&mut buf[..chunk]).await.map_err(|err| Error::Transport {
            status: None,
            body: None,
            source: Box::new(err),
        })?;
        if read == 0 {
            break;
        }
        remaining -= read as u64;
    }
    Ok(())
}

/// Built-in routing. Path matching is case-insensitive.
fn route(
    uri: &Url,
    base_url: &Url,
    events_tx: &mpsc::UnboundedSender<Url>,
) -> Result<WireResponse, Error> {
    let path = uri.path();
    if path.eq_ignore_ascii_case("/callback") {
        // The redirect to /finished takes the authorization code out of the
        // URL bar, and a browser refresh cannot replay the callback.
        debug!("authorization callback received");
        let _ = events_tx.send(uri.clone());
        return Ok(WireResponse {
            status: StatusCode::MOVED_PERMANENTLY,
            content_type: CONTENT_TYPE_HTML.to_string(),
            location: Some(format!("{base_url}finished")),
            body: REDIRECT_PAGE.as_bytes().to_vec(),
        });
    }
    let asset: (&str, &[u8]) = if path.eq_ignore_ascii_case("/finished") {
        (CONTENT_TYPE_HTML, SUCCESS_PAGE.as_bytes())
    } else if path.eq_ignore_ascii_case("/script.js") {
        (CONTENT_TYPE_JS, SCRIPT_JS.as_bytes())
    } else if path.eq_ignore_ascii_case("/style.css") {
        (CONTENT_TYPE_CSS, STYLE_CSS.as_bytes())
    } else if path.eq_ignore_ascii_case("/favicon.ico") {
        (CONTENT_TYPE_ICO, &FAVICON_ICO)
    } else {
        return Err(Error::Http {
            code: StatusCode::NOT_FOUND,
            message: format!("no resource at {path}"),
        });
    };
    Ok(WireResponse {
        status: StatusCode::OK,
        content_type: asset.0.to_string(),
        location: None,
        body: asset.1.to_vec(),
    })
}

fn error_response(err: &Error) -> WireResponse {
    let status = err.http_status();
    WireResponse {
        status,
        content_type: CONTENT_TYPE_HTML.to_string(),
        location: None,
        body: error_page(status, &err.to_string()).into_bytes(),
    }
}

fn error_page(status: StatusCode, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Error {status}</title>
<link rel="stylesheet" href="/style.css">
</head>
<body>
<main>
<h1>Something went wrong</h1>
<p>{}</p>
</main>
</body>
</html>
"#,
        escape_html(message),
        status = status.as_u16(),
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

async fn write_response<W>(writer: &mut W, response: &WireResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = response.status.canonical_reason().unwrap_or("Error");
    let mut head = format!(
        "HTTP/1.0 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status.as_u16(),
        reason,
        response.content_type,
        response.body.len(),
    );
    if let Some(location) = &response.location {
        head.push_str(&format!("Location: {location}\r\n"));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await
}
