//! Single-use request proxy
//!
//! A [`Handler`] owns one backend process and forwards exactly one request to
//! it. The backend's response is only relayed once the process has logged
//! the access line for it; an unignored diagnostic seen first replaces the
//! response with an error page.

use crate::config::HandlerConfig;
use crate::diagnostics::IgnoreList;
use crate::error::{error_response, timeout_response, FailureKind, LaunchError, ProxyBody};
use crate::process::{BackendProcess, EarlyExit, Launcher};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

const REUSE_MESSAGE: &str =
    "This handler has already served a request. Handlers are single-use and must be closed afterwards.";

/// Per-request settings shared by every handler of a pool
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub timeout: Duration,
    pub ignore: IgnoreList,
}

impl HandlerSettings {
    pub fn new(timeout: Duration, ignore: IgnoreList) -> Self {
        Self { timeout, ignore }
    }
}

impl From<&HandlerConfig> for HandlerSettings {
    fn from(config: &HandlerConfig) -> Self {
        Self::new(config.timeout(), config.ignore_list())
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("{0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read response body: {0}")]
    Body(hyper::Error),
}

/// Outcome of waiting on the backend's diagnostics after a response arrived
enum Verdict {
    Confirmed,
    Failed(Response<ProxyBody>),
}

/// One backend process plus the logic to proxy a single request through it
#[derive(Debug)]
pub struct Handler {
    process: BackendProcess,
    timeout: Duration,
    ignore: IgnoreList,
    used: bool,
}

impl Handler {
    /// Launch a backend and wrap it
    pub async fn start(launcher: &Launcher, settings: &HandlerSettings) -> Result<Self, LaunchError> {
        let process = launcher.launch().await?;
        Ok(Self::new(process, settings))
    }

    /// Wrap an already running backend
    pub fn new(process: BackendProcess, settings: &HandlerSettings) -> Self {
        Self {
            process,
            timeout: settings.timeout,
            ignore: settings.ignore.clone(),
            used: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.process.addr()
    }

    pub fn port(&self) -> u16 {
        self.process.port()
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    /// The backend's exit, if it has already died
    pub fn try_exit(&mut self) -> Option<&EarlyExit> {
        self.process.try_exit()
    }

    /// Proxy `req` to the backend. Only the first call reaches the backend;
    /// later calls get a programmer-error page.
    pub async fn serve<B>(&mut self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let port = self.port();
        if self.used {
            warn!(port, "Handler asked to serve a second request");
            return error_response(FailureKind::ProgrammerError, REUSE_MESSAGE);
        }
        self.used = true;

        let deadline = Instant::now() + self.timeout;
        let request_id = request_id(&req);
        debug!(port, request_id, method = %req.method(), uri = %req.uri(), "Proxying request");

        let outbound = match rewrite_request(req, self.addr(), &request_id) {
            Ok(outbound) => outbound,
            Err(e) => {
                error_log(port, &request_id, &e);
                return error_response(FailureKind::RequestError, &e.to_string());
            }
        };

        // The call runs on its own task so that a timeout abandons it rather than cancelling it
        let call = tokio::spawn(fetch(outbound));
        let fetched = match tokio::time::timeout_at(deadline, call).await {
            Err(_) => {
                warn!(port, request_id, timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                return timeout_response(self.timeout);
            }
            Ok(Err(e)) => {
                error_log(port, &request_id, &e);
                return error_response(FailureKind::RequestError, &e.to_string());
            }
            Ok(Ok(Err(e))) => {
                error_log(port, &request_id, &e);
                return error_response(FailureKind::RequestError, &e.to_string());
            }
            Ok(Ok(Ok(response))) => response,
        };

        match self.await_confirmation(deadline, &request_id).await {
            Verdict::Confirmed => relay(fetched),
            Verdict::Failed(response) => response,
        }
    }

    /// Wait for the access record that proves the request finished cleanly.
    ///
    /// Errors are polled before access records: the backend writes a
    /// request's error lines before its access line, so once the access
    /// record is visible any earlier error is already queued.
    async fn await_confirmation(&mut self, deadline: Instant, request_id: &str) -> Verdict {
        let port = self.port();
        let timeout = self.timeout;
        let ignore = &self.ignore;
        let (diagnostics, exited, exit_pending) = self.process.signals();
        let mut errors_open = true;

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;
                line = diagnostics.errors.recv(), if errors_open => match line {
                    Some(text) if ignore.suppresses(&text) => {
                        debug!(port, request_id, diagnostic = %text, "Ignoring diagnostic");
                    }
                    Some(text) => {
                        warn!(port, request_id, diagnostic = %text, "Interpreter reported an error");
                        return Verdict::Failed(error_response(FailureKind::InterpreterError, &text));
                    }
                    None => errors_open = false,
                },
                record = diagnostics.access.recv() => match record {
                    Some(text) => {
                        debug!(port, request_id, access = %text, "Request confirmed by access log");
                        return Verdict::Confirmed;
                    }
                    None => {
                        warn!(port, request_id, "Diagnostic stream closed before the request was confirmed");
                        return Verdict::Failed(error_response(
                            FailureKind::EarlyExit,
                            "The backend process closed its diagnostic stream before completing the request",
                        ));
                    }
                },
                exit = &mut *exited, if exit_pending => {
                    let (detail, status) = match exit {
                        Ok(exit) => (format!("The backend {}", exit), exit.status()),
                        Err(_) => ("The backend process stopped".to_string(), None),
                    };
                    warn!(port, request_id, ?status, "Backend exited during request");
                    return Verdict::Failed(error_response(FailureKind::EarlyExit, &detail));
                }
                _ = &mut expired => {
                    warn!(port, request_id, "No access record before the deadline");
                    return Verdict::Failed(timeout_response(timeout));
                }
            }
        }
    }

    /// Kill the backend process
    pub async fn close(self) {
        debug!(port = self.port(), used = self.used, "Closing handler");
        self.process.close().await;
    }
}

fn error_log(port: u16, request_id: &str, e: &dyn std::fmt::Display) {
    warn!(port, request_id, error = %e, "Request to backend failed");
}

/// Propagate the caller's request id or mint a new one
fn request_id<B>(req: &Request<B>) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Point the request at the backend, keeping method, path, query and headers
fn rewrite_request<B>(
    req: Request<B>,
    addr: SocketAddr,
    request_id: &str,
) -> Result<Request<B>, hyper::http::Error> {
    let uri = format!(
        "http://{}{}",
        addr,
        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }
    // HTTP/2 requests carry the authority in the URI instead
    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                builder = builder.header(HOST, value);
            }
        }
    }
    if !parts.headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            builder = builder.header(X_REQUEST_ID, value);
        }
    }

    builder.body(body)
}

/// Send the request on a fresh connection and read the whole body
async fn fetch<B>(req: Request<B>) -> Result<Response<Bytes>, FetchError>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.enforce_http(true);

    // Every backend is unique, so nothing is kept for reuse
    let client: Client<HttpConnector, B> = Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build(connector);

    let response = client.request(req).await?;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.map_err(FetchError::Body)?.to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

/// Status and headers as the backend sent them; framing is redone by the front server
fn relay(fetched: Response<Bytes>) -> Response<ProxyBody> {
    let (parts, bytes) = fetched.into_parts();

    let mut headers = parts.headers;
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);

    let mut response = Response::new(Full::new(bytes).map_err(|never| match never {}).boxed());
    *response.status_mut() = parts.status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{detached_backend, early_exit_for_tests};
    use http_body_util::Empty;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    const NOTICE: &str = "PHP Notice:  Undefined variable: abc in /srv/error.php on line 1";
    const FATAL: &str = "PHP Fatal error:  Call to undefined function flub() in /srv/fatal-error.php on line 1";

    /// Minimal stand-in for the interpreter's web server
    async fn script(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let response = match req.uri().path() {
            "/headers.php" => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("X-Golang-Is", "Awesome")
                .body(Full::new(Bytes::from_static(b"Hello from PHP\n")))
                .unwrap(),
            "/wait-too-long.php" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Response::new(Full::new(Bytes::from_static(b"late")))
            }
            "/echo.php" => {
                let id = req.headers().get(X_REQUEST_ID).cloned();
                let method = req.method().to_string();
                let query = req.uri().query().unwrap_or("").to_string();
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let mut text = format!("{} {} ", method, query).into_bytes();
                text.extend_from_slice(&body);
                let mut response = Response::new(Full::new(Bytes::from(text)));
                if let Some(id) = id {
                    response.headers_mut().insert(X_REQUEST_ID, id);
                }
                response
            }
            _ => Response::new(Full::new(Bytes::from_static(b"abc"))),
        };
        Ok(response)
    }

    async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(script))
                        .await;
                });
            }
        });
        addr
    }

    fn settings(timeout_ms: u64, ignore: &[&str]) -> HandlerSettings {
        HandlerSettings::new(
            Duration::from_millis(timeout_ms),
            IgnoreList::new(ignore.iter().map(|s| s.to_string()).collect()),
        )
    }

    fn get(path: &str) -> Request<Empty<Bytes>> {
        Request::get(path).body(Empty::new()).unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn proxy_error(response: &Response<ProxyBody>) -> Option<&str> {
        response
            .headers()
            .get("X-Proxy-Error")
            .and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_normal_request() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        senders.access.send("127.0.0.1:1 [200]: GET /abc.php".to_string()).unwrap();
        let response = handler.serve(get("/abc.php")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(proxy_error(&response).is_none());
        assert_eq!(body_string(response).await, "abc");
        assert!(handler.is_used());
    }

    #[tokio::test]
    async fn test_status_and_headers_are_relayed() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        senders.access.send("127.0.0.1:1 [404]: GET /headers.php".to_string()).unwrap();
        let response = handler.serve(get("/headers.php")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("X-Golang-Is").unwrap(), "Awesome");
        assert_eq!(body_string(response).await, "Hello from PHP\n");
    }

    #[tokio::test]
    async fn test_method_query_body_and_request_id_forwarded() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        senders.access.send("127.0.0.1:1 [200]: POST /echo.php".to_string()).unwrap();
        let req = Request::post("/echo.php?a=1")
            .header(X_REQUEST_ID, "req-42")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let response = handler.serve(req).await;

        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-42");
        assert_eq!(body_string(response).await, "POST a=1 payload");
    }

    #[tokio::test]
    async fn test_interpreter_error() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(100, &[]));

        senders.errors.send(NOTICE.to_string()).unwrap();
        senders.access.send("127.0.0.1:1 [200]: GET /error.php".to_string()).unwrap();
        let response = handler.serve(get("/error.php")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(proxy_error(&response), Some("INTERPRETER_ERROR"));
        let body = body_string(response).await;
        assert!(body.contains("PHP Notice:  Undefined variable: abc in"));
        assert!(body.contains("/error.php on line 1"));
    }

    #[tokio::test]
    async fn test_ignored_error_relays_response() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(100, &["/error.php on line 1"]));

        senders.errors.send(NOTICE.to_string()).unwrap();
        senders.access.send("127.0.0.1:1 [200]: GET /error.php".to_string()).unwrap();
        let response = handler.serve(get("/error.php")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "abc");
    }

    #[tokio::test]
    async fn test_fatal_error_is_never_ignored() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(100, &["/"]));

        senders.errors.send(FATAL.to_string()).unwrap();
        senders.access.send("127.0.0.1:1 [500]: GET /fatal-error.php".to_string()).unwrap();
        let response = handler.serve(get("/fatal-error.php")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response)
            .await
            .contains("PHP Fatal error:  Call to undefined function flub() in"));
    }

    #[tokio::test]
    async fn test_timeout_wins_over_slow_backend() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(100, &[]));

        // Even a confirmed request is a timeout if the response came too late
        senders.access.send("127.0.0.1:1 [200]: GET /wait-too-long.php".to_string()).unwrap();
        let started = std::time::Instant::now();
        let response = handler.serve(get("/wait-too-long.php")).await;

        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(proxy_error(&response), Some("TIMEOUT"));
        assert!(body_string(response).await.contains("Waited 100ms"));
    }

    #[tokio::test]
    async fn test_missing_confirmation_times_out() {
        let addr = spawn_backend().await;
        let (process, _senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(100, &[]));

        let response = handler.serve(get("/abc.php")).await;
        assert_eq!(proxy_error(&response), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn test_second_serve_is_rejected() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        senders.access.send("127.0.0.1:1 [200]: GET /abc.php".to_string()).unwrap();
        senders.access.send("127.0.0.1:1 [200]: GET /abc.php".to_string()).unwrap();
        assert_eq!(handler.serve(get("/abc.php")).await.status(), StatusCode::OK);

        let response = handler.serve(get("/abc.php")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(proxy_error(&response), Some("PROGRAMMER_ERROR"));
        assert!(body_string(response).await.contains("single-use"));
    }

    #[tokio::test]
    async fn test_early_exit() {
        let addr = spawn_backend().await;
        let (process, _senders, exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        exit.send(early_exit_for_tests()).unwrap();
        let response = handler.serve(get("/abc.php")).await;

        assert_eq!(proxy_error(&response), Some("EARLY_EXIT"));
        assert!(body_string(response).await.contains("exited early"));
    }

    #[tokio::test]
    async fn test_closed_diagnostics_count_as_early_exit() {
        let addr = spawn_backend().await;
        let (process, senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        drop(senders);
        let response = handler.serve(get("/abc.php")).await;
        assert_eq!(proxy_error(&response), Some("EARLY_EXIT"));
    }

    #[tokio::test]
    async fn test_queued_access_record_beats_exit() {
        let addr = spawn_backend().await;
        let (process, senders, exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        senders.access.send("127.0.0.1:1 [200]: GET /abc.php".to_string()).unwrap();
        exit.send(early_exit_for_tests()).unwrap();
        drop(senders);

        let response = handler.serve(get("/abc.php")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (process, _senders, _exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        let response = handler.serve(get("/abc.php")).await;
        assert_eq!(proxy_error(&response), Some("REQUEST_ERROR"));
    }

    #[test]
    fn test_rewrite_request() {
        let addr: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let req = Request::get("http://example.com/a/b.php?x=1")
            .header("Host", "example.com")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let rewritten = rewrite_request(req, addr, "id-1").unwrap();
        assert_eq!(rewritten.uri(), "http://127.0.0.1:8001/a/b.php?x=1");
        assert_eq!(rewritten.headers().get("host").unwrap(), "example.com");
        assert_eq!(rewritten.headers().get(X_REQUEST_ID).unwrap(), "id-1");
    }

    #[test]
    fn test_rewrite_request_takes_host_from_authority() {
        let addr: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let req = Request::get("https://example.com:8443/index.php")
            .version(hyper::Version::HTTP_2)
            .body(Empty::<Bytes>::new())
            .unwrap();

        let rewritten = rewrite_request(req, addr, "id-2").unwrap();
        assert_eq!(rewritten.uri(), "http://127.0.0.1:8001/index.php");
        assert_eq!(rewritten.headers().get(HOST).unwrap(), "example.com:8443");
    }

    #[test]
    fn test_rewrite_request_without_authority_leaves_host_unset() {
        let addr: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let rewritten = rewrite_request(get("/index.php"), addr, "id-3").unwrap();
        assert!(rewritten.headers().get(HOST).is_none());
    }

    #[tokio::test]
    async fn test_exit_seen_before_serve_still_ends_the_request() {
        let addr = spawn_backend().await;
        let (process, senders, exit) = detached_backend(addr);
        let mut handler = Handler::new(process, &settings(1000, &[]));

        exit.send(early_exit_for_tests()).unwrap();
        assert!(handler.try_exit().is_some());
        drop(senders);

        let response = handler.serve(get("/abc.php")).await;
        assert_eq!(proxy_error(&response), Some("EARLY_EXIT"));
    }

    #[test]
    fn test_relay_drops_hop_by_hop_headers() {
        let fetched = Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header("Location", "/")
            .header("Connection", "close")
            .header("Transfer-Encoding", "chunked")
            .body(Bytes::new())
            .unwrap();

        let response = relay(fetched);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("Location").unwrap(), "/");
        assert!(response.headers().get("Connection").is_none());
        assert!(response.headers().get("Transfer-Encoding").is_none());
    }
}
