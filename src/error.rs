//! Error types and the 500 pages rendered in place of a backend response

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;

/// Body type of every response handed back to the front server
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Errors returned while launching a backend process
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The interpreter could not be spawned at all (missing binary, permissions)
    #[error("failed to spawn interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// A requested stdio pipe was not attached to the child
    #[error("interpreter {0} pipe was not captured")]
    MissingPipe(&'static str),
    /// Every candidate port was in use or the interpreter kept exiting
    #[error("no free ports found between {from} and {to}")]
    NoFreePorts { from: u16, to: u16 },
}

/// Errors returned by the handler pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("handler pool has been shut down")]
    Closed,
}

/// Reasons a handler renders an error page instead of relaying the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No response within the configured timeout
    Timeout,
    /// The backend process died before confirming the request
    EarlyExit,
    /// The outbound call to the backend failed
    RequestError,
    /// The interpreter reported a warning, notice or fatal error
    InterpreterError,
    /// A handler was asked to serve a second request
    ProgrammerError,
}

impl FailureKind {
    /// Every failure is reported upward as a 500
    pub fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::EarlyExit => "EARLY_EXIT",
            FailureKind::RequestError => "REQUEST_ERROR",
            FailureKind::InterpreterError => "INTERPRETER_ERROR",
            FailureKind::ProgrammerError => "PROGRAMMER_ERROR",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "Timeout error",
            FailureKind::EarlyExit => "Early exit",
            FailureKind::RequestError => "Request error",
            FailureKind::InterpreterError => "Error",
            FailureKind::ProgrammerError => "Programmer error",
        }
    }
}

/// Render the page for a failure. `detail` is escaped before it is embedded.
pub fn error_response(kind: FailureKind, detail: &str) -> Response<ProxyBody> {
    let detail = escape_html(detail);
    let content = match kind {
        FailureKind::InterpreterError => format!("<pre>{}</pre>", detail),
        _ => format!("<p>{}</p>", detail),
    };
    let body = format!(
        "<!doctype html>\n<title>Error</title>\n<h1>{}</h1>\n{}\n",
        kind.title(),
        content
    );

    Response::builder()
        .status(kind.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header("X-Proxy-Error", kind.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Page shown when the backend did not answer in time
pub fn timeout_response(timeout: Duration) -> Response<ProxyBody> {
    error_response(
        FailureKind::Timeout,
        &format!("Waited {:?} and received no response", timeout),
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
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
