use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use proxywoman_core::{url_matches, Flow};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::pipeline::RequestInterceptor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapLocalRule {
    pub id: String,
    pub name: String,
    pub url_pattern: String,
    pub local_path: String,
    /// Empty means infer from the file extension.
    #[serde(default)]
    pub content_type: String,
    pub enabled: bool,
    pub is_regex: bool,
}

#[derive(Debug, Default)]
pub struct MapLocalManager {
    rules: RwLock<HashMap<String, MapLocalRule>>,
}

impl MapLocalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: MapLocalRule) {
        self.rules
            .write()
            .expect("map-local rules lock poisoned")
            .insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, id: &str) {
        self.rules
            .write()
            .expect("map-local rules lock poisoned")
            .remove(id);
    }

    pub fn update_rule(&self, rule: MapLocalRule) -> Result<(), RuleError> {
        let mut rules = self.rules.write().expect("map-local rules lock poisoned");
        if !rules.contains_key(&rule.id) {
            return Err(RuleError::RuleNotFound(rule.id));
        }
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn rules(&self) -> Vec<MapLocalRule> {
        self.rules
            .read()
            .expect("map-local rules lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn match_rule(&self, url: &str) -> Option<MapLocalRule> {
        self.rules
            .read()
            .expect("map-local rules lock poisoned")
            .values()
            .find(|rule| rule.enabled && url_matches(&rule.url_pattern, rule.is_regex, url))
            .cloned()
    }
}

/// Standard MIME for the extensions the UI cares about; anything else omits
/// the Content-Type header.
pub fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => Some("text/html; charset=utf-8"),
        "css" => Some("text/css; charset=utf-8"),
        "js" => Some("application/javascript; charset=utf-8"),
        "json" => Some("application/json; charset=utf-8"),
        "xml" => Some("application/xml; charset=utf-8"),
        "txt" => Some("text/plain; charset=utf-8"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "ico" => Some("image/x-icon"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

fn resolve_content_type(rule: &MapLocalRule) -> Option<String> {
    if !rule.content_type.is_empty() {
        return Some(rule.content_type.clone());
    }
    Path::new(&rule.local_path)
        .extension()
        .and_then(|extension| extension.to_str())
        .and_then(content_type_for_extension)
        .map(str::to_string)
}

#[async_trait]
impl RequestInterceptor for MapLocalManager {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        let Some(rule) = self.match_rule(request.url.as_str()) else {
            return Ok(None);
        };

        let body = match tokio::fs::read(&rule.local_path).await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(
                    rule = %rule.name,
                    path = %rule.local_path,
                    %error,
                    "map-local file unreadable"
                );
                flow.add_tag("map-local-error");
                return Err(RuleError::LocalFileMissing(rule.local_path.clone()));
            }
        };

        let mut response = InterceptedResponse::new(200, "OK")
            .with_header("X-ProxyWoman-MapLocal", "true")
            .with_header("X-ProxyWoman-Rule-ID", rule.id.clone())
            .with_body(body);
        if let Some(content_type) = resolve_content_type(&rule) {
            response.set_header("Content-Type", content_type);
        }

        flow.add_tag("map-local");
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn rule_for(path: &str, content_type: &str) -> MapLocalRule {
        MapLocalRule {
            id: "ml-1".to_string(),
            name: "app-js".to_string(),
            url_pattern: "/app.js".to_string(),
            local_path: path.to_string(),
            content_type: content_type.to_string(),
            enabled: true,
            is_regex: false,
        }
    }

    fn flow_and_request(url: &str) -> (Flow, InterceptedRequest) {
        let url: url::Url = url.parse().expect("url");
        let flow = Flow::new(
            "flow_1".to_string(),
            "GET".to_string(),
            url.to_string(),
            "http".to_string(),
            url.host_str().unwrap_or_default().to_string(),
            url.path().to_string(),
            "127.0.0.1:1".to_string(),
            Default::default(),
        );
        let request =
            InterceptedRequest::new("GET".to_string(), url, Default::default(), Vec::new());
        (flow, request)
    }

    #[tokio::test]
    async fn serves_file_with_inferred_mime() {
        let mut file = tempfile::Builder::new()
            .suffix(".js")
            .tempfile()
            .expect("tempfile");
        file.write_all(b"export const v=1;").expect("write");

        let manager = MapLocalManager::new();
        manager.add_rule(rule_for(file.path().to_str().expect("utf8 path"), ""));

        let (mut flow, mut request) = flow_and_request("http://x.test/app.js");
        let response = manager
            .intercept_request(&mut flow, &mut request)
            .await
            .expect("intercept")
            .expect("mapped response");

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"export const v=1;");
        assert_eq!(
            response.header("Content-Type"),
            Some("application/javascript; charset=utf-8")
        );
        assert_eq!(response.header("X-ProxyWoman-MapLocal"), Some("true"));
        assert!(flow.tags.contains(&"map-local".to_string()));
    }

    #[tokio::test]
    async fn explicit_content_type_wins() {
        let mut file = tempfile::Builder::new()
            .suffix(".bin")
            .tempfile()
            .expect("tempfile");
        file.write_all(b"{}").expect("write");

        let manager = MapLocalManager::new();
        manager.add_rule(rule_for(
            file.path().to_str().expect("utf8 path"),
            "application/json",
        ));

        let (mut flow, mut request) = flow_and_request("http://x.test/app.js");
        let response = manager
            .intercept_request(&mut flow, &mut request)
            .await
            .expect("intercept")
            .expect("mapped response");
        assert_eq!(response.header("Content-Type"), Some("application/json"));
    }

    #[tokio::test]
    async fn missing_file_tags_and_errors() {
        let manager = MapLocalManager::new();
        manager.add_rule(rule_for("/definitely/not/here.js", ""));

        let (mut flow, mut request) = flow_and_request("http://x.test/app.js");
        let error = manager
            .intercept_request(&mut flow, &mut request)
            .await
            .expect_err("missing file");
        assert!(matches!(error, RuleError::LocalFileMissing(_)));
        assert!(flow.tags.contains(&"map-local-error".to_string()));
    }

    #[tokio::test]
    async fn no_match_passes_through() {
        let manager = MapLocalManager::new();
        let (mut flow, mut request) = flow_and_request("http://x.test/other");
        let response = manager
            .intercept_request(&mut flow, &mut request)
            .await
            .expect("intercept");
        assert!(response.is_none());
        assert!(flow.tags.is_empty());
    }
}
