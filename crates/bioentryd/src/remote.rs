//! HTTP binding to the remote verification service.
//!
//! `POST {base}{verify_path}` sends a `multipart/form-data` body with the JPEG
//! capture in the `image` part and the terminal identity in `terminal_id`. The
//! API key, idempotency token and capture time travel as headers.
//! `GET {base}{probe_path}` answering 200 means the service is reachable.

use crate::config::Config;
use bioentry_core::{CaptureEvent, ResultSource, VerificationResult};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use ureq::Agent;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// Network failure, server error or unusable response. Never fatal; the capture is queued.
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote timed out")]
    Timeout,
    /// The service refused this request. Not retried.
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl VerifyError {
    /// Network-class failures route the capture to the offline store.
    pub fn is_network(&self) -> bool {
        matches!(self, VerifyError::Unreachable(_) | VerifyError::Timeout)
    }
}

/// Blocking interface to the verification service.
///
/// Implementations must forward the event's idempotency token so a
/// resubmission returns the original result.
pub trait RemoteService: Send + Sync {
    fn verify(&self, event: &CaptureEvent) -> Result<VerificationResult, VerifyError>;

    /// Cheap reachability check.
    fn probe(&self) -> Result<(), VerifyError>;
}

/// How a response status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Worth retrying later: 408, 429 and 5xx.
    Transient,
    Rejected,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Transient,
        400..=499 => StatusClass::Rejected,
        _ => StatusClass::Transient,
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Extract the server's `detail` from an error body, falling back to the status.
fn rejection_detail(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => format!("HTTP {status}"),
    }
}

/// Interpret a response from the verify endpoint.
pub fn interpret_response(status: u16, body: &str) -> Result<VerificationResult, VerifyError> {
    match classify_status(status) {
        StatusClass::Success => {
            let mut result: VerificationResult = serde_json::from_str(body)
                .map_err(|e| VerifyError::Unreachable(format!("malformed response: {e}")))?;
            result.source = ResultSource::Remote;
            Ok(result)
        }
        StatusClass::Transient => Err(VerifyError::Unreachable(format!("HTTP {status}"))),
        StatusClass::Rejected => Err(VerifyError::Rejected(rejection_detail(status, body))),
    }
}

/// Multipart body for the verify endpoint. The boundary is derived from the
/// idempotency token so it is unique per capture.
fn multipart_body(boundary: &str, terminal_id: &str, image: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(image.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"terminal_id\"\r\n\r\n\
             {terminal_id}\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"image\"; filename=\"capture.jpg\"\r\n\
             Content-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(image);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn boundary_for(token: &str) -> String {
    let safe: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    format!("bioentry-{safe}")
}

fn transport_error(err: ureq::Error) -> VerifyError {
    match err {
        ureq::Error::Timeout(_) => VerifyError::Timeout,
        ureq::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => VerifyError::Timeout,
        other => VerifyError::Unreachable(other.to_string()),
    }
}

/// [`RemoteService`] over HTTP using `ureq`.
pub struct HttpRemote {
    verify_url: String,
    probe_url: String,
    terminal_id: String,
    api_key: String,
    agent: Agent,
    probe_agent: Agent,
}

impl HttpRemote {
    pub fn new(config: &Config) -> Self {
        let base = config.remote.base_url.trim_end_matches('/');
        Self {
            verify_url: format!("{base}{}", config.remote.verify_path),
            probe_url: format!("{base}{}", config.remote.probe_path),
            terminal_id: config.terminal.id.clone(),
            api_key: config.terminal.api_key.clone(),
            agent: build_agent(config.request_timeout()),
            probe_agent: build_agent(config.probe_timeout()),
        }
    }
}

fn build_agent(timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .user_agent(concat!("bioentryd/", env!("CARGO_PKG_VERSION")))
        .build()
        .new_agent()
}

impl RemoteService for HttpRemote {
    fn verify(&self, event: &CaptureEvent) -> Result<VerificationResult, VerifyError> {
        let boundary = boundary_for(event.token().as_str());
        let body = multipart_body(&boundary, &self.terminal_id, event.image());
        let mut response = self
            .agent
            .post(&self.verify_url)
            .header("X-API-Key", &self.api_key)
            .header("X-Terminal-Id", &self.terminal_id)
            .header("Idempotency-Key", event.token().as_str())
            .header("X-Captured-At", event.captured_at().to_rfc3339())
            .content_type(format!("multipart/form-data; boundary={boundary}"))
            .send(&body[..])
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(transport_error)?;

        tracing::debug!(token = %event.token(), status, "verify response");
        interpret_response(status, &body)
    }

    fn probe(&self) -> Result<(), VerifyError> {
        let response = self
            .probe_agent
            .get(&self.probe_url)
            .call()
            .map_err(transport_error)?;
        match response.status().as_u16() {
            200 => Ok(()),
            status => Err(VerifyError::Unreachable(format!("probe HTTP {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(201), StatusClass::Success);
        assert_eq!(classify_status(400), StatusClass::Rejected);
        assert_eq!(classify_status(401), StatusClass::Rejected);
        assert_eq!(classify_status(404), StatusClass::Rejected);
        assert_eq!(classify_status(408), StatusClass::Transient);
        assert_eq!(classify_status(429), StatusClass::Transient);
        assert_eq!(classify_status(500), StatusClass::Transient);
        assert_eq!(classify_status(503), StatusClass::Transient);
    }

    #[test]
    fn test_success_body_is_remote_result() {
        let body = r#"{"verified": true, "subject_id": "1712", "score": 0.22,
                       "event_type": "exit", "timestamp": "2024-05-01T17:30:00Z",
                       "message": "Goodbye", "source": "local_fallback"}"#;
        let result = interpret_response(200, body).unwrap();
        assert!(result.verified);
        assert_eq!(result.source, ResultSource::Remote);
        assert_eq!(result.subject_id.as_deref(), Some("1712"));
    }

    #[test]
    fn test_success_body_accepts_mensaje() {
        let body = r#"{"verified": true, "mensaje": "Bienvenido, Ana"}"#;
        let result = interpret_response(200, body).unwrap();
        assert!(result.verified);
        assert_eq!(result.message, "Bienvenido, Ana");
        assert_eq!(result.subject_id, None);
    }

    #[test]
    fn test_multipart_body_layout() {
        let image = [0xFF, 0xD8, 0x00, 0xFF, 0xD9];
        let boundary = boundary_for("6f1c-42");
        assert_eq!(boundary, "bioentry-6f1c-42");

        let body = multipart_body(&boundary, "GATE-1", &image);
        let head = b"--bioentry-6f1c-42\r\n\
            Content-Disposition: form-data; name=\"terminal_id\"\r\n\r\n\
            GATE-1\r\n\
            --bioentry-6f1c-42\r\n\
            Content-Disposition: form-data; name=\"image\"; filename=\"capture.jpg\"\r\n\
            Content-Type: image/jpeg\r\n\r\n";
        assert!(body.starts_with(head));
        assert_eq!(&body[head.len()..head.len() + image.len()], &image);
        assert!(body.ends_with(b"\r\n--bioentry-6f1c-42--\r\n"));
    }

    #[test]
    fn test_boundary_strips_header_breaking_chars() {
        assert_eq!(boundary_for("a\r\nb; c"), "bioentry-abc");
    }

    #[test]
    fn test_malformed_success_is_unreachable() {
        let err = interpret_response(200, "<html>proxy error</html>").unwrap_err();
        assert!(matches!(err, VerifyError::Unreachable(_)));
        assert!(err.is_network());
    }

    #[test]
    fn test_rejection_carries_detail() {
        let err = interpret_response(403, r#"{"detail": "terminal disabled"}"#).unwrap_err();
        assert_eq!(err, VerifyError::Rejected("terminal disabled".into()));
        assert!(!err.is_network());
    }

    #[test]
    fn test_rejection_without_detail() {
        let err = interpret_response(422, "").unwrap_err();
        assert_eq!(err, VerifyError::Rejected("HTTP 422".into()));

        let err = interpret_response(422, r#"{"detail": [{"loc": ["image"]}]}"#).unwrap_err();
        assert!(matches!(err, VerifyError::Rejected(d) if d.contains("image")));
    }

    #[test]
    fn test_server_error_is_unreachable() {
        let err = interpret_response(502, r#"{"detail": "bad gateway"}"#).unwrap_err();
        assert!(matches!(err, VerifyError::Unreachable(_)));
    }

    #[test]
    fn test_urls_join_without_double_slash() {
        let mut config = Config::default();
        config.remote.base_url = "http://api.local:8000/".into();
        let remote = HttpRemote::new(&config);
        assert_eq!(remote.verify_url, "http://api.local:8000/verify-terminal/auto");
        assert_eq!(remote.probe_url, "http://api.local:8000/version");
    }

    #[test]
    fn test_probe_unreachable_host() {
        let mut config = Config::default();
        // port 9 (discard) on localhost is closed in test environments
        config.remote.base_url = "http://127.0.0.1:9".into();
        let remote = HttpRemote::new(&config);
        assert!(remote.probe().unwrap_err().is_network());
    }
}
