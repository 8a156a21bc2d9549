use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proxywoman_core::{method_matches, next_session_id, url_matches, Flow};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::pipeline::{RequestInterceptor, ResponseInterceptor};
use crate::storage::BreakpointRuleStore;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointPhase {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRule {
    pub id: String,
    pub name: String,
    pub url_pattern: String,
    #[serde(default)]
    pub method: String,
    pub enabled: bool,
    pub is_regex: bool,
    pub break_on_request: bool,
    pub break_on_response: bool,
}

/// Operator edits carried by a resume. Absent fields leave the live value
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestEdit {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseEdit {
    pub status_code: Option<u16>,
    pub status: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumePayload {
    pub request: Option<RequestEdit>,
    pub response: Option<ResponseEdit>,
}

/// Snapshot surfaced to the UI when a session opens.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointSessionInfo {
    pub id: String,
    pub flow: Flow,
    pub rule: BreakpointRule,
    pub phase: BreakpointPhase,
    pub started_at: DateTime<Utc>,
}

/// Outbound breakpoint-event callback.
pub trait BreakpointSink: Send + Sync {
    fn on_breakpoint(&self, session: &BreakpointSessionInfo);
}

#[derive(Debug, Default)]
pub struct NoopBreakpointSink;

impl BreakpointSink for NoopBreakpointSink {
    fn on_breakpoint(&self, _session: &BreakpointSessionInfo) {}
}

struct PendingSession {
    info: BreakpointSessionInfo,
    resume_tx: oneshot::Sender<ResumePayload>,
    cancel_tx: oneshot::Sender<()>,
}

/// Handle held by the suspended exchange while the operator decides.
pub struct SessionWaiter {
    session_id: String,
    resume_rx: oneshot::Receiver<ResumePayload>,
    cancel_rx: oneshot::Receiver<()>,
}

pub struct BreakpointManager {
    rules: RwLock<HashMap<String, BreakpointRule>>,
    sessions: Mutex<HashMap<String, PendingSession>>,
    sink: RwLock<Arc<dyn BreakpointSink>>,
    storage: Option<Arc<dyn BreakpointRuleStore>>,
    wait_timeout: Duration,
}

impl BreakpointManager {
    pub fn new(storage: Option<Arc<dyn BreakpointRuleStore>>) -> Self {
        let manager = Self {
            rules: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            sink: RwLock::new(Arc::new(NoopBreakpointSink)),
            storage,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        };
        manager.load_rules_from_storage();
        manager
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    fn load_rules_from_storage(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.load_rules() {
            Ok(rules) => {
                let mut table = self.rules.write().expect("breakpoint rules lock poisoned");
                for rule in rules {
                    table.insert(rule.id.clone(), rule);
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to load breakpoint rules from storage");
            }
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn BreakpointSink>) {
        *self.sink.write().expect("breakpoint sink lock poisoned") = sink;
    }

    pub fn add_rule(&self, rule: BreakpointRule) -> Result<(), RuleError> {
        if let Some(storage) = &self.storage {
            storage.save_rule(&rule)?;
        }
        self.rules
            .write()
            .expect("breakpoint rules lock poisoned")
            .insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> Result<(), RuleError> {
        if let Some(storage) = &self.storage {
            storage.delete_rule(id)?;
        }
        self.rules
            .write()
            .expect("breakpoint rules lock poisoned")
            .remove(id);
        Ok(())
    }

    pub fn update_rule_status(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut rules = self.rules.write().expect("breakpoint rules lock poisoned");
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RuleError::RuleNotFound(id.to_string()))?;
        if let Some(storage) = &self.storage {
            storage.update_rule_status(id, enabled)?;
        }
        rule.enabled = enabled;
        Ok(())
    }

    pub fn rules(&self) -> Vec<BreakpointRule> {
        self.rules
            .read()
            .expect("breakpoint rules lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Opens a session for the first enabled rule matching this phase,
    /// method, and URL. The caller must then `wait` on the returned handle.
    pub fn check_breakpoint(&self, flow: &Flow, phase: BreakpointPhase) -> Option<SessionWaiter> {
        let rule = {
            let rules = self.rules.read().expect("breakpoint rules lock poisoned");
            rules
                .values()
                .find(|rule| {
                    rule.enabled
                        && match phase {
                            BreakpointPhase::Request => rule.break_on_request,
                            BreakpointPhase::Response => rule.break_on_response,
                        }
                        && method_matches(&rule.method, &flow.method)
                        && url_matches(&rule.url_pattern, rule.is_regex, &flow.url)
                })
                .cloned()?
        };

        let (resume_tx, resume_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let info = BreakpointSessionInfo {
            id: next_session_id(),
            flow: flow.clone(),
            rule,
            phase,
            started_at: Utc::now(),
        };
        let waiter = SessionWaiter {
            session_id: info.id.clone(),
            resume_rx,
            cancel_rx,
        };

        // Register before surfacing the session, so a fast operator cannot
        // resume an id the table does not know yet.
        self.sessions
            .lock()
            .expect("breakpoint sessions lock poisoned")
            .insert(
                info.id.clone(),
                PendingSession {
                    info: info.clone(),
                    resume_tx,
                    cancel_tx,
                },
            );
        let sink = Arc::clone(&self.sink.read().expect("breakpoint sink lock poisoned"));
        sink.on_breakpoint(&info);
        Some(waiter)
    }

    /// Blocks the exchange until the operator acts or the deadline passes.
    /// Timeout is not an error: the exchange continues unedited.
    pub async fn wait(&self, waiter: SessionWaiter) -> Result<Option<ResumePayload>, RuleError> {
        let SessionWaiter {
            session_id,
            mut resume_rx,
            mut cancel_rx,
        } = waiter;

        // Biased polling checks resume first: a resume stores its payload
        // before the session (and with it the cancel sender) is dropped, so
        // the payload is never lost to the cancel branch.
        tokio::select! {
            biased;
            resumed = &mut resume_rx => match resumed {
                Ok(payload) => Ok(Some(payload)),
                Err(_) => Err(RuleError::BreakpointCancelled),
            },
            _ = &mut cancel_rx => Err(RuleError::BreakpointCancelled),
            _ = tokio::time::sleep(self.wait_timeout) => {
                self.sessions
                    .lock()
                    .expect("breakpoint sessions lock poisoned")
                    .remove(&session_id);
                Ok(None)
            }
        }
    }

    pub fn resume(&self, session_id: &str, payload: ResumePayload) -> Result<(), RuleError> {
        let session = self
            .sessions
            .lock()
            .expect("breakpoint sessions lock poisoned")
            .remove(session_id)
            .ok_or_else(|| RuleError::SessionNotFound(session_id.to_string()))?;
        // A lost receiver means the waiter already timed out; nothing to do.
        let _ = session.resume_tx.send(payload);
        Ok(())
    }

    pub fn cancel(&self, session_id: &str) -> Result<(), RuleError> {
        let session = self
            .sessions
            .lock()
            .expect("breakpoint sessions lock poisoned")
            .remove(session_id)
            .ok_or_else(|| RuleError::SessionNotFound(session_id.to_string()))?;
        let _ = session.cancel_tx.send(());
        Ok(())
    }

    /// Cancels every outstanding session; used at shutdown.
    pub fn cancel_all(&self) {
        let sessions: Vec<PendingSession> = self
            .sessions
            .lock()
            .expect("breakpoint sessions lock poisoned")
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            let _ = session.cancel_tx.send(());
        }
    }

    pub fn active_sessions(&self) -> Vec<BreakpointSessionInfo> {
        self.sessions
            .lock()
            .expect("breakpoint sessions lock poisoned")
            .values()
            .map(|session| session.info.clone())
            .collect()
    }
}

impl RequestEdit {
    pub fn apply(&self, request: &mut InterceptedRequest) {
        if let Some(method) = &self.method {
            request.method = method.clone();
        }
        if let Some(url) = &self.url {
            match url.parse() {
                Ok(parsed) => request.url = parsed,
                Err(error) => tracing::warn!(%url, %error, "ignoring unparseable edited URL"),
            }
        }
        if let Some(headers) = &self.headers {
            request.headers = headers.clone();
        }
        if let Some(body) = &self.body {
            request.body = body.clone();
        }
    }
}

impl ResponseEdit {
    pub fn apply(&self, response: &mut InterceptedResponse) {
        if let Some(status_code) = self.status_code {
            response.status_code = status_code;
        }
        if let Some(status) = &self.status {
            response.status = status.clone();
        }
        if let Some(headers) = &self.headers {
            response.headers = headers.clone();
        }
        if let Some(body) = &self.body {
            response.body = body.clone();
        }
    }
}

#[async_trait]
impl RequestInterceptor for BreakpointManager {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        let Some(waiter) = self.check_breakpoint(flow, BreakpointPhase::Request) else {
            return Ok(None);
        };

        flow.add_tag("breakpoint-request");
        if let Some(payload) = self.wait(waiter).await? {
            if let Some(edit) = payload.request {
                edit.apply(request);
                flow.request.method = request.method.clone();
                flow.request.url = request.url.to_string();
                flow.request.headers = request.headers.clone();
                flow.request.body = request.body.clone();
                flow.method = request.method.clone();
                flow.url = request.url.to_string();
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ResponseInterceptor for BreakpointManager {
    async fn intercept_response(
        &self,
        flow: &mut Flow,
        response: &mut InterceptedResponse,
    ) -> Result<(), RuleError> {
        let Some(waiter) = self.check_breakpoint(flow, BreakpointPhase::Response) else {
            return Ok(());
        };

        flow.add_tag("breakpoint-response");
        if let Some(payload) = self.wait(waiter).await? {
            if let Some(edit) = payload.response {
                edit.apply(response);
            }
        }
        Ok(())
    }
}
