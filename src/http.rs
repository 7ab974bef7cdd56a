//! C2: HTTP server wrapper.
//!
//! Grounded on `original_source/retrowebvice/src/http.hpp` (the fuller
//! `HTTPRequest`/`HTTPServer` pair; the `viceplugins/retrojsvice/src/http.hpp`
//! variant only declares `SocketAddress`). Each request is handled on one of
//! a fixed pool of worker threads that all block in `tiny_http::Server::recv`
//! — the idiom `tiny_http` itself documents for a thread-pool server, and the
//! closest crate-ecosystem analogue to the Poco-based thread-per-connection
//! `HTTPServer` in the source. A worker thread hands the parsed request to
//! the API thread and then blocks on a one-shot `mpsc` channel for the
//! response-producing closure: a clean way to express the coroutine-like
//! control flow the source gets from Pimpl/promise gymnastics.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tiny_http::{Header, Response, StatusCode};

use crate::config::HttpAuthCredentials;
use crate::download::DownloadResponder;
use crate::image_compressor::ImageResponder;
use crate::secrets::constant_time_eq;
use crate::warning_log;

/// A destination a response can be written to. `tiny_http::Request` is the
/// only production implementor; tests substitute a capturing stand-in so
/// `Window`'s routing can be exercised without a live socket.
pub trait RawResponder: Send {
    fn respond(self: Box<Self>, status: u32, headers: Vec<(String, String)>, body: Vec<u8>);
}

struct TinyHttpResponder(tiny_http::Request);

impl RawResponder for TinyHttpResponder {
    fn respond(self: Box<Self>, status: u32, headers: Vec<(String, String)>, body: Vec<u8>) {
        write_bytes(self.0, status, headers, body);
    }
}

type ResponseWriter = Box<dyn FnOnce(Box<dyn RawResponder>) + Send>;

/// One HTTP exchange: method, path, user agent, body, and a one-shot
/// response slot. Constructed by an
/// [`HttpServer`] worker thread and handed to the API thread; the producer
/// closure built by one of the `send_*`/`respond_with_*` methods below is
/// sent back across `sender` so the original worker thread can write it to
/// the socket.
pub struct Request {
    method: String,
    path: String,
    raw_query: String,
    user_agent: String,
    content_type: Option<String>,
    body: Vec<u8>,
    form_cache: Mutex<Option<HashMap<String, String>>>,
    sender: Mutex<Option<SyncSender<ResponseWriter>>>,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Looks up a key in the request's query string (the `image` request
    /// uses `main`, `img`, `imm`, `w`, `h`, `e`, `EI`).
    pub fn get_query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.raw_query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Looks up a key in the POST body, parsed as `application/x-www-form-urlencoded`
    /// on first use and cached.
    pub fn get_form_param(&self, name: &str) -> Option<String> {
        let mut cache = self.form_cache.lock().unwrap();
        if cache.is_none() {
            let parsed: HashMap<String, String> = url::form_urlencoded::parse(&self.body)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            *cache = Some(parsed);
        }
        cache.as_ref().unwrap().get(name).cloned()
    }

    fn take_sender(&self) -> Option<SyncSender<ResponseWriter>> {
        self.sender.lock().unwrap().take()
    }

    fn respond_raw(&self, writer: ResponseWriter) {
        if let Some(tx) = self.take_sender() {
            let _ = tx.send(writer);
        }
    }

    /// Sends a plain-text response (used for the 4xx/503/500 error bodies).
    pub fn send_text_response(&self, status: u32, text: String) {
        self.send_text_response_ex(status, text, true, &[]);
    }

    pub fn send_text_response_ex(&self, status: u32, text: String, no_cache: bool, extra_headers: &[(String, String)]) {
        let headers = build_headers("text/plain; charset=UTF-8", no_cache, extra_headers);
        self.respond_raw(Box::new(move |raw| raw.respond(status, headers, text.into_bytes())));
    }

    /// Sends a rendered legacy-browser HTML page (the main page, iframe
    /// bodies, pre-prev/pre-next decoys).
    pub fn send_html_response(&self, status: u32, html: String, no_cache: bool) {
        let headers = build_headers("text/html; charset=UTF-8", no_cache, &[]);
        self.respond_raw(Box::new(move |raw| raw.respond(status, headers, html.into_bytes())));
    }

    /// Sends a `Location`-bearing redirect (e.g. the new-window flow's
    /// 303 to `path_prefix`, or the two-step prev/next protocol).
    pub fn send_redirect(&self, status: u32, location: String) {
        let headers = build_headers("text/plain; charset=UTF-8", true, &[("Location".to_string(), location)]);
        self.respond_raw(Box::new(move |raw| raw.respond(status, headers, Vec::new())));
    }

    pub fn respond_with_server_error(&self) {
        self.send_text_response(500, "ERROR: Internal server error\n".to_string());
    }
}

impl ImageResponder for Request {
    fn respond_with_image(
        &self,
        content_type: &'static str,
        content_length: u64,
        write_body: Box<dyn FnOnce(&mut dyn std::io::Write) + Send>,
    ) {
        let headers = build_headers(content_type, true, &[]);
        self.respond_raw(Box::new(move |raw| {
            let mut buf = Vec::with_capacity(content_length as usize);
            write_body(&mut buf);
            raw.respond(200, headers, buf);
        }));
    }
}

impl DownloadResponder for Request {
    fn respond_with_file(
        &self,
        content_length: u64,
        content_disposition_filename: &str,
        write_body: Box<dyn FnOnce(&mut dyn std::io::Write) + Send>,
    ) {
        let disposition = format!("attachment; filename=\"{}\"", content_disposition_filename);
        // Downloads are deliberately cacheable: no no-cache headers, working
        // around an old Internet Explorer bug with non-cacheable file
        // downloads.
        let headers = build_headers("application/octet-stream", false, &[("Content-Disposition".to_string(), disposition)]);
        self.respond_raw(Box::new(move |raw| {
            let mut buf = Vec::with_capacity(content_length as usize);
            write_body(&mut buf);
            raw.respond(200, headers, buf);
        }));
    }

    fn respond_with_server_error(&self) {
        Request::respond_with_server_error(self);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(tx) = self.take_sender() {
            warning_log!("HTTPRequest {} {} destroyed without a response; sending 500", self.method, self.path);
            let _ = tx.send(Box::new(|raw| raw.respond(500, Vec::new(), b"ERROR: No response produced\n".to_vec())));
        }
    }
}

fn build_headers(content_type: &str, no_cache: bool, extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), content_type.to_string())];
    if no_cache {
        headers.push(("Cache-Control".to_string(), "no-cache, no-store, must-revalidate".to_string()));
        headers.push(("Pragma".to_string(), "no-cache".to_string()));
        headers.push(("Expires".to_string(), "0".to_string()));
    }
    headers.extend(extra.iter().cloned());
    headers
}

fn write_bytes(raw: tiny_http::Request, status: u32, headers: Vec<(String, String)>, body: Vec<u8>) {
    let mut response = Response::from_data(body).with_status_code(StatusCode(status as u16));
    for (name, value) in headers {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response = response.with_header(header);
        }
    }
    if let Err(e) = raw.respond(response) {
        warning_log!("writing HTTP response failed: {}", e);
    }
}

/// Runs the HTTP server listener plus its fixed worker pool.
pub struct HttpServer {
    server: Arc<tiny_http::Server>,
    stopping: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpServer {
    /// Binds `listen_addr` and spawns `max_threads` worker threads, each
    /// blocking in `Server::recv`. `on_request` is invoked (from whichever
    /// worker thread accepted the connection) for every request that
    /// clears Basic Auth, if configured.
    pub fn start(
        listen_addr: SocketAddr,
        max_threads: usize,
        auth: Option<HttpAuthCredentials>,
        on_request: Arc<dyn Fn(Arc<Request>) + Send + Sync + 'static>,
    ) -> std::io::Result<Arc<HttpServer>> {
        let server = tiny_http::Server::http(listen_addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let server = Arc::new(server);
        let stopping = Arc::new(AtomicBool::new(false));
        let auth = Arc::new(auth);

        let mut workers = Vec::with_capacity(max_threads);
        for idx in 0..max_threads.max(1) {
            let server = Arc::clone(&server);
            let stopping = Arc::clone(&stopping);
            let auth = Arc::clone(&auth);
            let on_request = Arc::clone(&on_request);
            let handle = std::thread::Builder::new()
                .name(format!("retrojsvice-http-{idx}"))
                .spawn(move || worker_loop(server, stopping, auth, on_request))
                .expect("failed to spawn HTTP worker thread");
            workers.push(handle);
        }

        Ok(Arc::new(HttpServer { server, stopping, workers: Mutex::new(workers) }))
    }

    /// Stops accepting new connections and, once every worker thread has
    /// drained (spec says "up to ~1s"; this implementation waits for
    /// natural drain, which is immediate once `WindowManager::close` has
    /// flushed every parked long-poll waiter), invokes `on_complete` from a
    /// dedicated thread so the API thread is never blocked by this call.
    pub fn shutdown(self: &Arc<Self>, on_complete: impl FnOnce() + Send + 'static) {
        self.stopping.store(true, Ordering::SeqCst);
        self.server.unblock();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        std::thread::Builder::new()
            .name("retrojsvice-http-shutdown".to_string())
            .spawn(move || {
                for worker in workers {
                    worker.join().ok();
                }
                on_complete();
            })
            .expect("failed to spawn HTTP shutdown thread");
    }
}

fn worker_loop(
    server: Arc<tiny_http::Server>,
    stopping: Arc<AtomicBool>,
    auth: Arc<Option<HttpAuthCredentials>>,
    on_request: Arc<dyn Fn(Arc<Request>) + Send + Sync + 'static>,
) {
    loop {
        let raw = match server.recv() {
            Ok(raw) => raw,
            Err(_) => return,
        };
        if stopping.load(Ordering::SeqCst) {
            let _ = raw.respond(Response::from_string("ERROR: Service is shutting down\n").with_status_code(StatusCode(503)));
            continue;
        }
        handle_connection(raw, &auth, &on_request);
    }
}

fn handle_connection(
    mut raw: tiny_http::Request,
    auth: &Option<HttpAuthCredentials>,
    on_request: &Arc<dyn Fn(Arc<Request>) + Send + Sync + 'static>,
) {
    let mut user_agent = String::new();
    let mut content_type = None;
    let mut authorization = None;
    for header in raw.headers() {
        let field = header.field.as_str().as_str().to_ascii_lowercase();
        match field.as_str() {
            "user-agent" => user_agent = header.value.as_str().to_string(),
            "content-type" => content_type = Some(header.value.as_str().to_string()),
            "authorization" => authorization = Some(header.value.as_str().to_string()),
            _ => {}
        }
    }

    if let Some(creds) = auth {
        if !basic_auth_ok(authorization.as_deref(), creds) {
            let response = Response::from_string("Unauthorized\n")
                .with_status_code(StatusCode(401))
                .with_header(Header::from_bytes(&b"WWW-Authenticate"[..], b"Basic realm=\"retrojsvice\"").unwrap());
            let _ = raw.respond(response);
            return;
        }
    }

    let method = raw.method().to_string();
    let full_url = raw.url().to_string();
    let (path, raw_query) = match full_url.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (full_url, String::new()),
    };

    let mut body = Vec::new();
    if method.eq_ignore_ascii_case("POST") {
        let _ = raw.as_reader().read_to_end(&mut body);
    }

    let (tx, rx) = sync_channel::<ResponseWriter>(1);
    let request = Arc::new(Request {
        method,
        path,
        raw_query,
        user_agent,
        content_type,
        body,
        form_cache: Mutex::new(None),
        sender: Mutex::new(Some(tx)),
    });

    on_request(request);

    match rx.recv() {
        Ok(writer) => writer(Box::new(TinyHttpResponder(raw))),
        Err(_) => {
            let _ = raw.respond(Response::from_string("ERROR: Internal server error\n").with_status_code(StatusCode(500)));
        }
    }
}

/// Constant-time comparison of both the username and the password against
/// the configured credentials, regardless of which one (if any) mismatches
/// first.
fn basic_auth_ok(header: Option<&str>, creds: &HttpAuthCredentials) -> bool {
    let Some(header) = header else { return false };
    let Some(encoded) = header.strip_prefix("Basic ") else { return false };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else { return false };
    let Some(colon) = decoded.iter().position(|&b| b == b':') else { return false };
    let (user, pass) = decoded.split_at(colon);
    let pass = &pass[1..];
    constant_time_eq(user, creds.username.as_bytes()) & constant_time_eq(pass, creds.password.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_ok_accepts_matching_credentials() {
        let creds = HttpAuthCredentials { username: "alice".to_string(), password: "secret".to_string() };
        let header = format!("Basic {}", BASE64.encode(b"alice:secret"));
        assert!(basic_auth_ok(Some(&header), &creds));
    }

    #[test]
    fn basic_auth_ok_rejects_wrong_password() {
        let creds = HttpAuthCredentials { username: "alice".to_string(), password: "secret".to_string() };
        let header = format!("Basic {}", BASE64.encode(b"alice:wrong"));
        assert!(!basic_auth_ok(Some(&header), &creds));
    }

    #[test]
    fn basic_auth_ok_rejects_missing_header() {
        let creds = HttpAuthCredentials { username: "alice".to_string(), password: "secret".to_string() };
        assert!(!basic_auth_ok(None, &creds));
    }

    #[test]
    fn query_param_lookup_finds_existing_key() {
        let request = test_request("GET", "/1/abc/image", "main=2&img=3", "");
        assert_eq!(request.get_query_param("main"), Some("2".to_string()));
        assert_eq!(request.get_query_param("missing"), None);
    }

    #[test]
    fn form_param_lookup_parses_urlencoded_body_once() {
        let request = test_request("POST", "/1/abc/clipboard", "", "token=xyz&text=hello%20world");
        assert_eq!(request.get_form_param("text"), Some("hello world".to_string()));
        assert_eq!(request.get_form_param("token"), Some("xyz".to_string()));
    }

    fn test_request(method: &str, path: &str, query: &str, body: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            raw_query: query.to_string(),
            user_agent: String::new(),
            content_type: None,
            body: body.as_bytes().to_vec(),
            form_cache: Mutex::new(None),
            sender: Mutex::new(None),
        }
    }
}

/// Test-only construction of a live `Request`, wired to a real response
/// channel rather than `tiny_http`'s socket. Used by other modules'
/// `#[cfg(test)]` suites (e.g. `window.rs`) that need to drive a `Request`
/// through production code paths and observe the resulting status code.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::mpsc::Receiver;

    struct StatusCapturingResponder {
        status_tx: std::sync::mpsc::Sender<u32>,
    }

    impl RawResponder for StatusCapturingResponder {
        fn respond(self: Box<Self>, status: u32, _headers: Vec<(String, String)>, _body: Vec<u8>) {
            let _ = self.status_tx.send(status);
        }
    }

    /// Builds a `Request` for `method path` with no query string or body,
    /// plus a receiver that yields the HTTP status code once something
    /// responds to it (mirroring the `rx.recv()` a production worker thread
    /// performs in [`handle_connection`]).
    pub(crate) fn make_test_request(method: &str, path: &str) -> (Arc<Request>, Receiver<u32>) {
        let (full_path, raw_query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path.to_string(), String::new()),
        };

        let (tx, response_rx) = sync_channel::<ResponseWriter>(1);
        let request = Arc::new(Request {
            method: method.to_string(),
            path: full_path,
            raw_query,
            user_agent: String::new(),
            content_type: None,
            body: Vec::new(),
            form_cache: Mutex::new(None),
            sender: Mutex::new(Some(tx)),
        });

        let (status_tx, status_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            if let Ok(writer) = response_rx.recv() {
                writer(Box::new(StatusCapturingResponder { status_tx }));
            }
        });

        (request, status_rx)
    }
}
