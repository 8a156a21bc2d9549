use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use proxywoman_core::{method_matches, url_matches, Flow};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::pipeline::RequestInterceptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowBlockAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowBlockMode {
    /// Only requests matching an allow rule pass.
    Whitelist,
    /// Requests matching a block rule are blocked, everything else passes.
    Blacklist,
    /// Block matches win, then allow matches, default pass.
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowBlockRule {
    pub id: String,
    pub name: String,
    pub url_pattern: String,
    #[serde(default)]
    pub method: String,
    #[serde(rename = "type")]
    pub action: AllowBlockAction,
    pub enabled: bool,
    pub is_regex: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug)]
pub struct AllowBlockManager {
    rules: RwLock<HashMap<String, AllowBlockRule>>,
    mode: RwLock<AllowBlockMode>,
}

impl Default for AllowBlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AllowBlockManager {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            mode: RwLock::new(AllowBlockMode::Mixed),
        }
    }

    pub fn set_mode(&self, mode: AllowBlockMode) {
        *self.mode.write().expect("allow/block mode lock poisoned") = mode;
    }

    pub fn mode(&self) -> AllowBlockMode {
        *self.mode.read().expect("allow/block mode lock poisoned")
    }

    pub fn add_rule(&self, rule: AllowBlockRule) {
        self.rules
            .write()
            .expect("allow/block rules lock poisoned")
            .insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, id: &str) {
        self.rules
            .write()
            .expect("allow/block rules lock poisoned")
            .remove(id);
    }

    pub fn update_rule(&self, rule: AllowBlockRule) -> Result<(), RuleError> {
        let mut rules = self.rules.write().expect("allow/block rules lock poisoned");
        if !rules.contains_key(&rule.id) {
            return Err(RuleError::RuleNotFound(rule.id));
        }
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn rules(&self) -> Vec<AllowBlockRule> {
        self.rules
            .read()
            .expect("allow/block rules lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Classifies the request against the rule set and the active mode.
    /// Returns whether it may proceed and the rule that decided that.
    pub fn check_request(&self, method: &str, url: &str) -> (bool, Option<AllowBlockRule>) {
        let rules = self.rules.read().expect("allow/block rules lock poisoned");

        let mut allow_match: Option<&AllowBlockRule> = None;
        let mut block_match: Option<&AllowBlockRule> = None;
        for rule in rules.values() {
            if !rule.enabled
                || !method_matches(&rule.method, method)
                || !url_matches(&rule.url_pattern, rule.is_regex, url)
            {
                continue;
            }
            match rule.action {
                AllowBlockAction::Allow => allow_match = allow_match.or(Some(rule)),
                AllowBlockAction::Block => block_match = block_match.or(Some(rule)),
            }
        }

        match self.mode() {
            AllowBlockMode::Whitelist => match allow_match {
                Some(rule) => (true, Some(rule.clone())),
                None => (false, None),
            },
            AllowBlockMode::Blacklist => match block_match {
                Some(rule) => (false, Some(rule.clone())),
                None => (true, None),
            },
            AllowBlockMode::Mixed => {
                if let Some(rule) = block_match {
                    (false, Some(rule.clone()))
                } else if let Some(rule) = allow_match {
                    (true, Some(rule.clone()))
                } else {
                    (true, None)
                }
            }
        }
    }
}

fn blocked_page(url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Request Blocked - ProxyWoman</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; background: #f5f5f5; }}
        .container {{ background: white; padding: 30px; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }}
        .error {{ color: #d32f2f; }}
        .url {{ background: #f0f0f0; padding: 10px; border-radius: 4px; word-break: break-all; }}
    </style>
</head>
<body>
    <div class="container">
        <h1 class="error">Request Blocked</h1>
        <p>This request has been blocked by ProxyWoman.</p>
        <div class="url">{url}</div>
        <p><small>ProxyWoman - Network Debugging Proxy</small></p>
    </div>
</body>
</html>"#
    )
}

#[async_trait]
impl RequestInterceptor for AllowBlockManager {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        let (allowed, rule) = self.check_request(&request.method, request.url.as_str());

        if allowed {
            if let Some(rule) = rule {
                flow.add_tag(format!("allowed-by-{}", rule.name));
            }
            return Ok(None);
        }

        flow.is_blocked = true;
        let mut response = InterceptedResponse::new(403, "Forbidden")
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_header("X-ProxyWoman-Blocked", "true")
            .with_body(blocked_page(request.url.as_str()).into_bytes());
        match &rule {
            Some(rule) => {
                flow.add_tag(format!("blocked-by-{}", rule.name));
                response.set_header("X-ProxyWoman-Rule", rule.name.clone());
            }
            None => flow.add_tag("blocked"),
        }
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, action: AllowBlockAction, pattern: &str) -> AllowBlockRule {
        AllowBlockRule {
            id: id.to_string(),
            name: id.to_string(),
            url_pattern: pattern.to_string(),
            method: String::new(),
            action,
            enabled: true,
            is_regex: false,
            description: String::new(),
        }
    }

    #[test]
    fn mixed_mode_block_wins_over_allow() {
        let manager = AllowBlockManager::new();
        manager.add_rule(rule("allow-all", AllowBlockAction::Allow, "x.test"));
        manager.add_rule(rule("block-ads", AllowBlockAction::Block, "/ads/"));

        let (allowed, matched) = manager.check_request("GET", "http://x.test/ads/banner");
        assert!(!allowed);
        assert_eq!(matched.expect("rule").id, "block-ads");

        let (allowed, matched) = manager.check_request("GET", "http://x.test/news");
        assert!(allowed);
        assert_eq!(matched.expect("rule").id, "allow-all");
    }

    #[test]
    fn mixed_mode_defaults_to_pass() {
        let manager = AllowBlockManager::new();
        let (allowed, matched) = manager.check_request("GET", "http://anything.test/");
        assert!(allowed);
        assert!(matched.is_none());
    }

    #[test]
    fn whitelist_blocks_unmatched() {
        let manager = AllowBlockManager::new();
        manager.set_mode(AllowBlockMode::Whitelist);
        manager.add_rule(rule("allow-api", AllowBlockAction::Allow, "/api/"));

        assert!(manager.check_request("GET", "http://x.test/api/users").0);
        assert!(!manager.check_request("GET", "http://x.test/other").0);
    }

    #[test]
    fn blacklist_passes_unmatched() {
        let manager = AllowBlockManager::new();
        manager.set_mode(AllowBlockMode::Blacklist);
        manager.add_rule(rule("block-ads", AllowBlockAction::Block, "/ads/"));

        assert!(!manager.check_request("GET", "http://x.test/ads/1").0);
        assert!(manager.check_request("GET", "http://x.test/other").0);
    }

    #[test]
    fn disabled_and_method_mismatched_rules_are_ignored() {
        let manager = AllowBlockManager::new();
        let mut disabled = rule("off", AllowBlockAction::Block, "/ads/");
        disabled.enabled = false;
        manager.add_rule(disabled);
        let mut post_only = rule("post-only", AllowBlockAction::Block, "/ads/");
        post_only.method = "POST".to_string();
        manager.add_rule(post_only);

        assert!(manager.check_request("GET", "http://x.test/ads/1").0);
        assert!(!manager.check_request("POST", "http://x.test/ads/1").0);
    }

    #[tokio::test]
    async fn block_produces_marked_403() {
        let manager = AllowBlockManager::new();
        manager.add_rule(rule("block-ads", AllowBlockAction::Block, "/ads/"));

        let url: url::Url = "http://x.test/ads/banner".parse().expect("url");
        let mut flow = Flow::new(
            "flow_1".to_string(),
            "GET".to_string(),
            url.to_string(),
            "http".to_string(),
            "x.test".to_string(),
            "/ads/banner".to_string(),
            "127.0.0.1:1".to_string(),
            Default::default(),
        );
        let mut request =
            InterceptedRequest::new("GET".to_string(), url, Default::default(), Vec::new());

        let response = manager
            .intercept_request(&mut flow, &mut request)
            .await
            .expect("intercept")
            .expect("blocked response");
        assert_eq!(response.status_code, 403);
        assert_eq!(response.header("X-ProxyWoman-Blocked"), Some("true"));
        assert_eq!(response.header("X-ProxyWoman-Rule"), Some("block-ads"));
        assert!(flow.is_blocked);
        assert!(flow.tags.contains(&"blocked-by-block-ads".to_string()));
    }
}
