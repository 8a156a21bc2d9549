use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use url::Url;

use proxywoman_core::Flow;
use proxywoman_rules::InterceptedRequest;

use crate::client;
use crate::error::ProxyError;

const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers the replayer owns itself and never copies from the template.
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "connection"];

const VALID_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Shallow overlay applied to a recorded flow before resending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayOverlay {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub status_code: u16,
    pub status: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resends requests as a first-class tool: straight to the origin, no
/// pipeline re-entry, no new flow, no redirect following.
#[derive(Debug, Clone)]
pub struct ReplayManager {
    timeout: Duration,
    max_head_bytes: usize,
}

impl Default for ReplayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayManager {
    pub fn new() -> Self {
        Self {
            timeout: REPLAY_TIMEOUT,
            max_head_bytes: 64 * 1024,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn replay_flow(&self, flow: &Flow) -> ReplayResponse {
        self.send(&ReplayRequest {
            method: flow.request.method.clone(),
            url: flow.request.url.clone(),
            headers: flow.request.headers.clone(),
            body: String::from_utf8_lossy(&flow.request.body).into_owned(),
        })
        .await
    }

    pub async fn replay_with_overlay(&self, flow: &Flow, overlay: ReplayOverlay) -> ReplayResponse {
        let mut template = ReplayRequest {
            method: flow.request.method.clone(),
            url: flow.request.url.clone(),
            headers: flow.request.headers.clone(),
            body: String::from_utf8_lossy(&flow.request.body).into_owned(),
        };
        if let Some(method) = overlay.method {
            template.method = method;
        }
        if let Some(url) = overlay.url {
            template.url = url;
        }
        if let Some(headers) = overlay.headers {
            for (name, value) in headers {
                template.headers.insert(name, value);
            }
        }
        if let Some(body) = overlay.body {
            template.body = body;
        }
        self.send(&template).await
    }

    /// Transport failures come back inside the response record, not as an
    /// error; the caller is an operator looking at a result pane.
    pub async fn send(&self, request: &ReplayRequest) -> ReplayResponse {
        let started = Instant::now();
        let url: Url = match request.url.parse() {
            Ok(url) => url,
            Err(error) => {
                return ReplayResponse {
                    error: Some(format!("invalid URL: {error}")),
                    ..ReplayResponse::default()
                }
            }
        };

        let mut headers = HashMap::new();
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS
                .iter()
                .any(|skipped| name.eq_ignore_ascii_case(skipped))
            {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        let outbound = InterceptedRequest::new(
            request.method.clone(),
            url,
            headers,
            request.body.clone().into_bytes(),
        );
        match client::send_request(&outbound, self.timeout, self.max_head_bytes).await {
            Ok(response) => ReplayResponse {
                status_code: response.status_code,
                status: response.status,
                headers: response.headers,
                body: String::from_utf8_lossy(&response.body).into_owned(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Err(error) => ReplayResponse {
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(format!("request failed: {error}")),
                ..ReplayResponse::default()
            },
        }
    }

    pub fn validate(&self, request: &ReplayRequest) -> Result<(), ProxyError> {
        if !VALID_METHODS
            .iter()
            .any(|method| method.eq_ignore_ascii_case(&request.method))
        {
            return Err(ProxyError::InvalidRequest(format!(
                "invalid HTTP method: {}",
                request.method
            )));
        }
        request
            .url
            .parse::<Url>()
            .map_err(|error| ProxyError::InvalidRequest(format!("invalid URL: {error}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn send_skips_hop_level_headers_and_measures_duration() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0_u8; 4096];
            let read = stream.read(&mut buffer).await.expect("read");
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            assert!(request.contains("X-Custom: yes\r\n"), "{request}");
            assert!(!request.contains("Host: stale.test"), "{request}");
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .expect("respond");
        });

        let manager = ReplayManager::new();
        let response = manager
            .send(&ReplayRequest {
                method: "GET".to_string(),
                url: format!("http://{addr}/replayed"),
                headers: HashMap::from([
                    ("Host".to_string(), "stale.test".to_string()),
                    ("Connection".to_string(), "close".to_string()),
                    ("X-Custom".to_string(), "yes".to_string()),
                ]),
                body: String::new(),
            })
            .await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "ok");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_reported_inline() {
        let manager = ReplayManager::new().with_timeout(Duration::from_secs(2));
        let response = manager
            .send(&ReplayRequest {
                method: "GET".to_string(),
                url: "http://127.0.0.1:1/".to_string(),
                headers: HashMap::new(),
                body: String::new(),
            })
            .await;
        assert_eq!(response.status_code, 0);
        assert!(response.error.expect("error").contains("request failed"));
    }

    #[test]
    fn validate_checks_method_and_url() {
        let manager = ReplayManager::new();
        assert!(manager
            .validate(&ReplayRequest {
                method: "GET".to_string(),
                url: "http://x.test/".to_string(),
                headers: HashMap::new(),
                body: String::new(),
            })
            .is_ok());
        assert!(manager
            .validate(&ReplayRequest {
                method: "YEET".to_string(),
                url: "http://x.test/".to_string(),
                headers: HashMap::new(),
                body: String::new(),
            })
            .is_err());
        assert!(manager
            .validate(&ReplayRequest {
                method: "GET".to_string(),
                url: "not a url".to_string(),
                headers: HashMap::new(),
                body: String::new(),
            })
            .is_err());
    }
}
