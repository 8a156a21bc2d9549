use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use proxywoman_core::{url_matches, Flow};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::pipeline::RequestInterceptor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseProxyRule {
    pub id: String,
    pub name: String,
    /// Path prefix (or regex over the path) this rule listens on.
    pub listen_path: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    pub enabled: bool,
    pub is_regex: bool,
    pub strip_path: bool,
    #[serde(default)]
    pub add_headers: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default)]
pub struct ReverseProxyManager {
    rules: RwLock<HashMap<String, ReverseProxyRule>>,
}

impl ReverseProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: ReverseProxyRule) -> Result<(), RuleError> {
        Url::parse(&rule.target_url)
            .map_err(|error| RuleError::InvalidRule(format!("invalid target URL: {error}")))?;
        self.rules
            .write()
            .expect("reverse-proxy rules lock poisoned")
            .insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) {
        self.rules
            .write()
            .expect("reverse-proxy rules lock poisoned")
            .remove(id);
    }

    pub fn update_rule(&self, rule: ReverseProxyRule) -> Result<(), RuleError> {
        let mut rules = self
            .rules
            .write()
            .expect("reverse-proxy rules lock poisoned");
        if !rules.contains_key(&rule.id) {
            return Err(RuleError::RuleNotFound(rule.id));
        }
        Url::parse(&rule.target_url)
            .map_err(|error| RuleError::InvalidRule(format!("invalid target URL: {error}")))?;
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn rules(&self) -> Vec<ReverseProxyRule> {
        self.rules
            .read()
            .expect("reverse-proxy rules lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Matching is on the request path only.
    pub fn match_rule(&self, path: &str) -> Option<ReverseProxyRule> {
        self.rules
            .read()
            .expect("reverse-proxy rules lock poisoned")
            .values()
            .find(|rule| {
                rule.enabled
                    && if rule.is_regex {
                        url_matches(&rule.listen_path, true, path)
                    } else {
                        path.starts_with(&rule.listen_path)
                    }
            })
            .cloned()
    }
}

/// Rebases `request` onto the rule's target origin, optionally stripping the
/// listen prefix from the path.
fn rewrite_request(request: &mut InterceptedRequest, rule: &ReverseProxyRule) -> Result<(), RuleError> {
    let target = Url::parse(&rule.target_url)
        .map_err(|error| RuleError::InvalidRule(format!("invalid target URL: {error}")))?;

    let mut path = request.url.path().to_string();
    if rule.strip_path && rule.listen_path != "/" && !rule.is_regex {
        if let Some(stripped) = path.strip_prefix(&rule.listen_path) {
            path = stripped.to_string();
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
        }
    }
    let target_base = target.path().trim_end_matches('/');
    if !target_base.is_empty() {
        path = format!("{target_base}{path}");
    }

    let query = request.url.query().map(str::to_string);
    let mut rewritten = target;
    rewritten.set_path(&path);
    rewritten.set_query(query.as_deref());
    request.url = rewritten;

    let host = request
        .url
        .host_str()
        .ok_or_else(|| RuleError::InvalidRule("target URL has no host".to_string()))?
        .to_string();
    let host_header = match request.url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };
    request.set_header("Host", host_header);

    for (name, value) in &rule.add_headers {
        request.set_header(name, value.clone());
    }
    Ok(())
}

#[async_trait]
impl RequestInterceptor for ReverseProxyManager {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        let Some(rule) = self.match_rule(request.url.path()) else {
            return Ok(None);
        };

        rewrite_request(request, &rule)?;
        flow.add_tag("reverse-proxy");
        flow.add_tag(format!("reverse-proxy-{}", rule.name));
        request
            .response_markers
            .push(("X-ProxyWoman-ReverseProxy".to_string(), "true".to_string()));
        request
            .response_markers
            .push(("X-ProxyWoman-Rule".to_string(), rule.name.clone()));
        Ok(None)
    }
}
