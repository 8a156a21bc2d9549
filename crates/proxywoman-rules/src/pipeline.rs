use std::sync::Arc;

use async_trait::async_trait;
use proxywoman_core::Flow;

use crate::allowblock::AllowBlockManager;
use crate::breakpoint::BreakpointManager;
use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::maplocal::MapLocalManager;
use crate::reverseproxy::ReverseProxyManager;
use crate::scripting::ScriptManager;
use crate::storage::{BreakpointRuleStore, ScriptStore};
use crate::upstream::UpstreamManager;

/// Request-phase hook. Returning a response short-circuits the chain: later
/// stages and the outbound hop are skipped and that response goes to the
/// client.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError>;
}

/// Response-phase hook. Stages transform in place and never short-circuit.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn intercept_response(
        &self,
        flow: &mut Flow,
        response: &mut InterceptedResponse,
    ) -> Result<(), RuleError>;
}

/// Every feature manager, wired once per proxy instance.
pub struct FeatureSet {
    pub allow_block: Arc<AllowBlockManager>,
    pub reverse_proxy: Arc<ReverseProxyManager>,
    pub upstream: Arc<UpstreamManager>,
    pub map_local: Arc<MapLocalManager>,
    pub breakpoint: Arc<BreakpointManager>,
    pub scripting: Arc<ScriptManager>,
}

impl FeatureSet {
    pub fn new(
        breakpoint_storage: Option<Arc<dyn BreakpointRuleStore>>,
        script_storage: Option<Arc<dyn ScriptStore>>,
    ) -> Self {
        Self {
            allow_block: Arc::new(AllowBlockManager::new()),
            reverse_proxy: Arc::new(ReverseProxyManager::new()),
            upstream: Arc::new(UpstreamManager::new()),
            map_local: Arc::new(MapLocalManager::new()),
            breakpoint: Arc::new(BreakpointManager::new(breakpoint_storage)),
            scripting: Arc::new(ScriptManager::new(script_storage)),
        }
    }
}

/// The ordered interceptor chains. The request order is load-bearing:
/// denials before any other work, origin rewrites before transport
/// selection, local short-circuits before an operator gets interrupted,
/// scripts last so they see the final outbound shape.
pub struct InterceptPipeline {
    request_stages: Vec<Arc<dyn RequestInterceptor>>,
    response_stages: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptPipeline {
    pub fn from_features(features: &FeatureSet) -> Self {
        Self {
            request_stages: vec![
                Arc::clone(&features.allow_block) as Arc<dyn RequestInterceptor>,
                Arc::clone(&features.reverse_proxy) as Arc<dyn RequestInterceptor>,
                Arc::clone(&features.upstream) as Arc<dyn RequestInterceptor>,
                Arc::clone(&features.map_local) as Arc<dyn RequestInterceptor>,
                Arc::clone(&features.breakpoint) as Arc<dyn RequestInterceptor>,
                Arc::clone(&features.scripting) as Arc<dyn RequestInterceptor>,
            ],
            response_stages: vec![
                Arc::clone(&features.breakpoint) as Arc<dyn ResponseInterceptor>,
                Arc::clone(&features.scripting) as Arc<dyn ResponseInterceptor>,
            ],
        }
    }

    pub async fn run_request_chain(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        for stage in &self.request_stages {
            if let Some(response) = stage.intercept_request(flow, request).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    pub async fn run_response_chain(
        &self,
        flow: &mut Flow,
        response: &mut InterceptedResponse,
    ) -> Result<(), RuleError> {
        for stage in &self.response_stages {
            stage.intercept_response(flow, response).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;
    use crate::allowblock::{AllowBlockAction, AllowBlockRule};
    use crate::maplocal::MapLocalRule;
    use crate::reverseproxy::ReverseProxyRule;
    use crate::upstream::UpstreamProxy;

    struct Recording {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl RequestInterceptor for Recording {
        async fn intercept_request(
            &self,
            _flow: &mut Flow,
            _request: &mut InterceptedRequest,
        ) -> Result<Option<InterceptedResponse>, RuleError> {
            self.order.lock().expect("order lock").push(self.label);
            if self.short_circuit {
                Ok(Some(InterceptedResponse::new(204, "No Content")))
            } else {
                Ok(None)
            }
        }
    }

    fn flow_and_request(url: &str) -> (Flow, InterceptedRequest) {
        let url: url::Url = url.parse().expect("url");
        let flow = Flow::new(
            proxywoman_core::next_flow_id(),
            "GET".to_string(),
            url.to_string(),
            "http".to_string(),
            url.host_str().unwrap_or_default().to_string(),
            url.path().to_string(),
            "127.0.0.1:1".to_string(),
            HashMap::new(),
        );
        let request =
            InterceptedRequest::new("GET".to_string(), url, HashMap::new(), Vec::new());
        (flow, request)
    }

    #[tokio::test]
    async fn first_handler_short_circuits_the_chain() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = InterceptPipeline {
            request_stages: vec![
                Arc::new(Recording {
                    label: "first",
                    order: Arc::clone(&order),
                    short_circuit: false,
                }),
                Arc::new(Recording {
                    label: "second",
                    order: Arc::clone(&order),
                    short_circuit: true,
                }),
                Arc::new(Recording {
                    label: "third",
                    order: Arc::clone(&order),
                    short_circuit: false,
                }),
            ],
            response_stages: Vec::new(),
        };

        let (mut flow, mut request) = flow_and_request("http://x.test/");
        let handled = pipeline
            .run_request_chain(&mut flow, &mut request)
            .await
            .expect("chain");
        assert_eq!(handled.expect("short circuit").status_code, 204);
        assert_eq!(*order.lock().expect("order lock"), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn feature_tags_accumulate_in_stage_order() {
        let features = FeatureSet::new(None, None);
        features.allow_block.add_rule(AllowBlockRule {
            id: "ab".to_string(),
            name: "dev-hosts".to_string(),
            url_pattern: "backend.test".to_string(),
            method: String::new(),
            action: AllowBlockAction::Allow,
            enabled: true,
            is_regex: false,
            description: String::new(),
        });
        features
            .reverse_proxy
            .add_rule(ReverseProxyRule {
                id: "rp".to_string(),
                name: "to-backend".to_string(),
                listen_path: "/app".to_string(),
                target_url: "http://backend.test".to_string(),
                enabled: true,
                is_regex: false,
                strip_path: true,
                add_headers: HashMap::new(),
                description: String::new(),
            })
            .expect("reverse rule");
        features
            .upstream
            .add_proxy(UpstreamProxy {
                id: "up".to_string(),
                name: "corp".to_string(),
                proxy_url: "http://parent.test:3128".to_string(),
                url_pattern: "backend.test".to_string(),
                enabled: true,
                is_regex: false,
                username: String::new(),
                password: String::new(),
                description: String::new(),
            })
            .expect("upstream rule");

        let mut mapped = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("tempfile");
        mapped.write_all(b"{}").expect("write");
        features.map_local.add_rule(MapLocalRule {
            id: "ml".to_string(),
            name: "stub".to_string(),
            url_pattern: "backend.test".to_string(),
            local_path: mapped.path().to_str().expect("utf8").to_string(),
            content_type: String::new(),
            enabled: true,
            is_regex: false,
        });

        let pipeline = InterceptPipeline::from_features(&features);
        // The allow rule matches only after the reverse-proxy stage rebases
        // the URL onto backend.test, so the allow tag must not appear; the
        // rest accumulate in stage order and map-local short-circuits.
        let (mut flow, mut request) = flow_and_request("http://frontend.test/app/config");
        let handled = pipeline
            .run_request_chain(&mut flow, &mut request)
            .await
            .expect("chain");

        assert!(handled.is_some(), "map-local should short-circuit");
        assert_eq!(
            flow.tags,
            vec![
                "reverse-proxy",
                "reverse-proxy-to-backend",
                "upstream-proxy",
                "upstream-corp",
                "map-local"
            ]
        );
    }
}
