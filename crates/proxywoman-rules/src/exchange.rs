use std::collections::HashMap;

use url::Url;

/// The outbound request as the pipeline shapes it. Stages mutate it in
/// place; the engine dials whatever is left when the chain finishes.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: String,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Parent proxy selected by the upstream stage, if any.
    pub upstream: Option<UpstreamRoute>,
    /// Headers stamped onto the response before it is written back.
    pub response_markers: Vec<(String, String)>,
}

impl InterceptedRequest {
    pub fn new(method: String, url: Url, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            method,
            url,
            headers,
            body,
            upstream: None,
            response_markers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replaces a header regardless of the stored name casing.
    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value);
    }
}

/// A response travelling back toward the client, synthetic or forwarded.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status_code: u16,
    pub status: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl InterceptedResponse {
    pub fn new(status_code: u16, status: impl Into<String>) -> Self {
        Self {
            status_code,
            status: status.into(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value);
    }
}

/// Parent-proxy route resolved by the upstream stage.
#[derive(Debug, Clone)]
pub struct UpstreamRoute {
    pub rule_name: String,
    pub proxy_url: Url,
    /// Prebuilt `Proxy-Authorization` value when credentials are configured.
    pub authorization: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_header_replaces_case_insensitively() {
        let url: Url = "http://example.test/".parse().expect("url");
        let mut request =
            InterceptedRequest::new("GET".to_string(), url, HashMap::new(), Vec::new());
        request.set_header("X-Token", "a".to_string());
        request.set_header("x-token", "b".to_string());
        assert_eq!(request.header("X-TOKEN"), Some("b"));
        assert_eq!(request.headers.len(), 1);
    }
}
