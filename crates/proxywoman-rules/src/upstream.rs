use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use proxywoman_core::{url_matches, Flow};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse, UpstreamRoute};
use crate::pipeline::RequestInterceptor;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamProxy {
    pub id: String,
    pub name: String,
    /// Parent proxy address, e.g. `http://proxy.corp:3128`.
    #[serde(rename = "proxyUrl")]
    pub proxy_url: String,
    pub url_pattern: String,
    pub enabled: bool,
    pub is_regex: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default)]
pub struct UpstreamManager {
    proxies: RwLock<HashMap<String, UpstreamProxy>>,
}

impl UpstreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proxy(&self, proxy: UpstreamProxy) -> Result<(), RuleError> {
        Url::parse(&proxy.proxy_url)
            .map_err(|error| RuleError::InvalidRule(format!("invalid proxy URL: {error}")))?;
        self.proxies
            .write()
            .expect("upstream proxies lock poisoned")
            .insert(proxy.id.clone(), proxy);
        Ok(())
    }

    pub fn remove_proxy(&self, id: &str) {
        self.proxies
            .write()
            .expect("upstream proxies lock poisoned")
            .remove(id);
    }

    pub fn update_proxy(&self, proxy: UpstreamProxy) -> Result<(), RuleError> {
        let mut proxies = self.proxies.write().expect("upstream proxies lock poisoned");
        if !proxies.contains_key(&proxy.id) {
            return Err(RuleError::RuleNotFound(proxy.id));
        }
        Url::parse(&proxy.proxy_url)
            .map_err(|error| RuleError::InvalidRule(format!("invalid proxy URL: {error}")))?;
        proxies.insert(proxy.id.clone(), proxy);
        Ok(())
    }

    pub fn proxies(&self) -> Vec<UpstreamProxy> {
        self.proxies
            .read()
            .expect("upstream proxies lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn match_proxy(&self, url: &str) -> Option<UpstreamProxy> {
        self.proxies
            .read()
            .expect("upstream proxies lock poisoned")
            .values()
            .find(|proxy| proxy.enabled && url_matches(&proxy.url_pattern, proxy.is_regex, url))
            .cloned()
    }

    /// Resolves the route the engine should dial for this proxy entry.
    pub fn route_for(&self, proxy: &UpstreamProxy) -> Result<UpstreamRoute, RuleError> {
        let proxy_url = Url::parse(&proxy.proxy_url)
            .map_err(|error| RuleError::InvalidRule(format!("invalid proxy URL: {error}")))?;
        let authorization = if !proxy.username.is_empty() && !proxy.password.is_empty() {
            let credentials = format!("{}:{}", proxy.username, proxy.password);
            Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            ))
        } else {
            None
        };
        Ok(UpstreamRoute {
            rule_name: proxy.name.clone(),
            proxy_url,
            authorization,
        })
    }

    /// Short-timeout liveness probe: one GET for `test_url` sent through the
    /// configured parent in absolute form.
    pub async fn test_upstream(&self, id: &str, test_url: Option<&str>) -> Result<(), RuleError> {
        let proxy = self
            .proxies
            .read()
            .expect("upstream proxies lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| RuleError::RuleNotFound(id.to_string()))?;
        let route = self.route_for(&proxy)?;
        let test_url = test_url.unwrap_or(DEFAULT_TEST_URL);

        tokio::time::timeout(TEST_TIMEOUT, probe_through_proxy(&route, test_url))
            .await
            .map_err(|_| RuleError::UpstreamTest("probe timed out".to_string()))?
    }
}

async fn probe_through_proxy(route: &UpstreamRoute, test_url: &str) -> Result<(), RuleError> {
    let host = route
        .proxy_url
        .host_str()
        .ok_or_else(|| RuleError::InvalidRule("proxy URL has no host".to_string()))?;
    let port = route.proxy_url.port_or_known_default().unwrap_or(8080);

    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|error| RuleError::UpstreamTest(format!("connect failed: {error}")))?;

    let parsed: Url = test_url
        .parse()
        .map_err(|error| RuleError::InvalidRule(format!("invalid test URL: {error}")))?;
    let target_host = parsed.host_str().unwrap_or_default();
    let mut request = format!(
        "GET {test_url} HTTP/1.1\r\nHost: {target_host}\r\nConnection: close\r\n"
    );
    if let Some(authorization) = &route.authorization {
        request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|error| RuleError::UpstreamTest(format!("write failed: {error}")))?;

    let mut head = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !head.windows(2).any(|window| window == b"\r\n") {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|error| RuleError::UpstreamTest(format!("read failed: {error}")))?;
        if read == 0 {
            return Err(RuleError::UpstreamTest(
                "proxy closed before responding".to_string(),
            ));
        }
        head.extend_from_slice(&chunk[..read]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| RuleError::UpstreamTest("malformed proxy response".to_string()))?;
    if status >= 500 {
        return Err(RuleError::UpstreamTest(format!(
            "proxy returned status {status}"
        )));
    }
    Ok(())
}

#[async_trait]
impl RequestInterceptor for UpstreamManager {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        let Some(proxy) = self.match_proxy(request.url.as_str()) else {
            return Ok(None);
        };

        let route = self.route_for(&proxy)?;
        flow.add_tag("upstream-proxy");
        flow.add_tag(format!("upstream-{}", proxy.name));
        request
            .response_markers
            .push(("X-ProxyWoman-Upstream".to_string(), proxy.name.clone()));
        request.upstream = Some(route);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(pattern: &str, username: &str, password: &str) -> UpstreamProxy {
        UpstreamProxy {
            id: "up-1".to_string(),
            name: "corp".to_string(),
            proxy_url: "http://parent.test:3128".to_string(),
            url_pattern: pattern.to_string(),
            enabled: true,
            is_regex: false,
            username: username.to_string(),
            password: password.to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn match_annotates_route_without_short_circuit() {
        let manager = UpstreamManager::new();
        manager.add_proxy(proxy("internal.test", "", "")).expect("add");

        let url: Url = "http://internal.test/api".parse().expect("url");
        let mut flow = Flow::new(
            "flow_1".to_string(),
            "GET".to_string(),
            url.to_string(),
            "http".to_string(),
            "internal.test".to_string(),
            "/api".to_string(),
            "127.0.0.1:1".to_string(),
            Default::default(),
        );
        let mut request =
            InterceptedRequest::new("GET".to_string(), url, Default::default(), Vec::new());

        let handled = manager
            .intercept_request(&mut flow, &mut request)
            .await
            .expect("intercept");
        assert!(handled.is_none());

        let route = request.upstream.expect("route selected");
        assert_eq!(route.proxy_url.as_str(), "http://parent.test:3128/");
        assert!(route.authorization.is_none());
        assert!(flow.tags.contains(&"upstream-proxy".to_string()));
        assert!(flow.tags.contains(&"upstream-corp".to_string()));
    }

    #[test]
    fn credentials_become_basic_authorization() {
        let manager = UpstreamManager::new();
        let route = manager
            .route_for(&proxy("*", "user", "secret"))
            .expect("route");
        assert_eq!(
            route.authorization.as_deref(),
            Some("Basic dXNlcjpzZWNyZXQ=")
        );
    }

    #[test]
    fn invalid_proxy_url_is_rejected() {
        let manager = UpstreamManager::new();
        let mut bad = proxy("*", "", "");
        bad.proxy_url = "not a url".to_string();
        assert!(matches!(
            manager.add_proxy(bad),
            Err(RuleError::InvalidRule(_))
        ));
    }

    #[tokio::test]
    async fn test_upstream_against_stub_parent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = [0_u8; 2048];
            let _ = stream.read(&mut buffer).await;
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .expect("respond");
        });

        let manager = UpstreamManager::new();
        let mut entry = proxy("*", "", "");
        entry.proxy_url = format!("http://{addr}");
        manager.add_proxy(entry).expect("add");

        manager
            .test_upstream("up-1", Some("http://liveness.test/generate_204"))
            .await
            .expect("probe succeeds");
    }
}
