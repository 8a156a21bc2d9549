use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use proxywoman_core::{Flow, ScriptExecution};
use rhai::{Dynamic, Engine, Map, Scope};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::pipeline::{RequestInterceptor, ResponseInterceptor};
use crate::storage::ScriptStore;

pub const DEFAULT_SCRIPT_BUDGET: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Request,
    Response,
    Both,
}

impl ScriptType {
    fn applies_to(self, phase: ScriptPhase) -> bool {
        match (self, phase) {
            (Self::Both, _) => true,
            (Self::Request, ScriptPhase::Request) => true,
            (Self::Response, ScriptPhase::Response) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    Request,
    Response,
}

impl ScriptPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }

    fn hook_names(self) -> [&'static str; 2] {
        match self {
            Self::Request => ["on_request", "onRequest"],
            Self::Response => ["on_response", "onResponse"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    pub name: String,
    pub content: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub script_type: ScriptType,
    #[serde(default)]
    pub description: String,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Snapshot of the mutable request surface a script sees.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestView {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResponseView {
    status_code: u16,
    status: String,
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Clone)]
struct ConsoleLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ConsoleLog {
    fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, line: String) {
        self.lines.lock().expect("console lock poisoned").push(line);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().expect("console lock poisoned"))
    }
}

pub struct ScriptManager {
    scripts: RwLock<HashMap<String, Script>>,
    storage: Option<Arc<dyn ScriptStore>>,
    budget: Duration,
}

impl ScriptManager {
    pub fn new(storage: Option<Arc<dyn ScriptStore>>) -> Self {
        let manager = Self {
            scripts: RwLock::new(HashMap::new()),
            storage,
            budget: DEFAULT_SCRIPT_BUDGET,
        };
        manager.load_scripts_from_storage();
        manager
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    fn load_scripts_from_storage(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.load_scripts() {
            Ok(scripts) => {
                let mut table = self.scripts.write().expect("scripts lock poisoned");
                for script in scripts {
                    table.insert(script.id.clone(), script);
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to load scripts from storage");
            }
        }
    }

    pub fn add_script(&self, mut script: Script) -> Result<(), RuleError> {
        let now = Utc::now();
        script.created_at = now;
        script.updated_at = now;
        if let Some(storage) = &self.storage {
            storage.save_script(&script)?;
        }
        self.scripts
            .write()
            .expect("scripts lock poisoned")
            .insert(script.id.clone(), script);
        Ok(())
    }

    pub fn update_script(&self, mut script: Script) -> Result<(), RuleError> {
        let mut scripts = self.scripts.write().expect("scripts lock poisoned");
        if !scripts.contains_key(&script.id) {
            return Err(RuleError::RuleNotFound(script.id));
        }
        script.updated_at = Utc::now();
        if let Some(storage) = &self.storage {
            storage.save_script(&script)?;
        }
        scripts.insert(script.id.clone(), script);
        Ok(())
    }

    pub fn remove_script(&self, id: &str) -> Result<(), RuleError> {
        if let Some(storage) = &self.storage {
            storage.delete_script(id)?;
        }
        self.scripts
            .write()
            .expect("scripts lock poisoned")
            .remove(id);
        Ok(())
    }

    pub fn update_script_status(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut scripts = self.scripts.write().expect("scripts lock poisoned");
        let script = scripts
            .get_mut(id)
            .ok_or_else(|| RuleError::RuleNotFound(id.to_string()))?;
        if let Some(storage) = &self.storage {
            storage.update_script_status(id, enabled)?;
        }
        script.enabled = enabled;
        script.updated_at = Utc::now();
        Ok(())
    }

    pub fn scripts(&self) -> Vec<Script> {
        self.scripts
            .read()
            .expect("scripts lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Compile-only syntax check; nothing is executed.
    pub fn validate(&self, content: &str) -> Result<(), RuleError> {
        Engine::new()
            .compile(content)
            .map(|_| ())
            .map_err(|error| RuleError::InvalidRule(format!("script compile error: {error}")))
    }

    fn applicable_scripts(&self, phase: ScriptPhase) -> Vec<Script> {
        let mut scripts: Vec<Script> = self
            .scripts
            .read()
            .expect("scripts lock poisoned")
            .values()
            .filter(|script| script.enabled && script.script_type.applies_to(phase))
            .cloned()
            .collect();
        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        scripts
    }

    pub fn run_request_phase(&self, flow: &mut Flow, request: &mut InterceptedRequest) {
        let scripts = self.applicable_scripts(ScriptPhase::Request);
        if scripts.is_empty() {
            return;
        }

        let mut any_succeeded = false;
        let mut any_modified = false;
        for script in scripts {
            let before = RequestView {
                method: request.method.clone(),
                url: request.url.to_string(),
                headers: request.headers.clone(),
                body: String::from_utf8_lossy(&request.body).into_owned(),
            };
            let (outcome, logs) =
                self.execute(&script, ScriptPhase::Request, Some(&before), None);

            let mut execution = ScriptExecution {
                script_id: script.id.clone(),
                script_name: script.name.clone(),
                phase: ScriptPhase::Request.as_str().to_string(),
                success: false,
                error: None,
                logs,
                executed_at: Utc::now(),
            };
            match outcome {
                Ok((mutated_request, _)) => {
                    execution.success = true;
                    any_succeeded = true;
                    if let Some(after) = mutated_request {
                        if after != before {
                            apply_request_view(&after, request);
                            any_modified = true;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(script = %script.name, %error, "request script failed");
                    execution.error = Some(error);
                }
            }
            flow.add_script_execution(execution);
        }

        if any_modified {
            flow.request.method = request.method.clone();
            flow.request.url = request.url.to_string();
            flow.request.headers = request.headers.clone();
            flow.request.body = request.body.clone();
            flow.method = request.method.clone();
            flow.url = request.url.to_string();
            flow.add_tag("script-modified-request");
        }
        if any_succeeded {
            flow.add_tag("script-processed");
        }
    }

    pub fn run_response_phase(&self, flow: &mut Flow, response: &mut InterceptedResponse) {
        let scripts = self.applicable_scripts(ScriptPhase::Response);
        if scripts.is_empty() {
            return;
        }

        let request_view = RequestView {
            method: flow.request.method.clone(),
            url: flow.request.url.clone(),
            headers: flow.request.headers.clone(),
            body: String::from_utf8_lossy(&flow.request.body).into_owned(),
        };

        let mut any_succeeded = false;
        let mut any_modified = false;
        for script in scripts {
            let before = ResponseView {
                status_code: response.status_code,
                status: response.status.clone(),
                headers: response.headers.clone(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            };
            let (outcome, logs) = self.execute(
                &script,
                ScriptPhase::Response,
                Some(&request_view),
                Some(&before),
            );

            let mut execution = ScriptExecution {
                script_id: script.id.clone(),
                script_name: script.name.clone(),
                phase: ScriptPhase::Response.as_str().to_string(),
                success: false,
                error: None,
                logs,
                executed_at: Utc::now(),
            };
            match outcome {
                Ok((_, mutated_response)) => {
                    execution.success = true;
                    any_succeeded = true;
                    if let Some(after) = mutated_response {
                        if after != before {
                            apply_response_view(&after, response);
                            any_modified = true;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(script = %script.name, %error, "response script failed");
                    execution.error = Some(error);
                }
            }
            flow.add_script_execution(execution);
        }

        if any_modified {
            flow.add_tag("script-modified-response");
        }
        if any_succeeded {
            flow.add_tag("script-processed");
        }
    }

    /// Runs one script in a fresh engine and scope, returning the mutated
    /// context views and the captured console output.
    #[allow(clippy::type_complexity)]
    fn execute(
        &self,
        script: &Script,
        phase: ScriptPhase,
        request: Option<&RequestView>,
        response: Option<&ResponseView>,
    ) -> (
        Result<(Option<RequestView>, Option<ResponseView>), String>,
        Vec<String>,
    ) {
        let console = ConsoleLog::new();
        let result = run_script(
            &script.content,
            phase,
            request,
            response,
            console.clone(),
            self.budget,
        );
        (result, console.take())
    }
}

fn run_script(
    content: &str,
    phase: ScriptPhase,
    request: Option<&RequestView>,
    response: Option<&ResponseView>,
    console: ConsoleLog,
    budget: Duration,
) -> Result<(Option<RequestView>, Option<ResponseView>), String> {
    let mut engine = Engine::new();
    register_console(&mut engine);
    let start = Instant::now();
    engine.on_progress(move |_| {
        if start.elapsed() > budget {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let ast = engine
        .compile(content)
        .map_err(|error| format!("script compile error: {error}"))?;

    let mut context = Map::new();
    if let Some(request) = request {
        context.insert("request".into(), Dynamic::from_map(request_map(request)));
    }
    if let Some(response) = response {
        context.insert("response".into(), Dynamic::from_map(response_map(response)));
    }
    let context_dyn = Dynamic::from_map(context).into_shared();

    let mut scope = Scope::new();
    scope.push("console", console);
    scope.push_dynamic("context", context_dyn.clone());

    engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(map_eval_error(budget))?;

    for hook in phase.hook_names() {
        if ast
            .iter_functions()
            .any(|function| function.name == hook && function.params.len() == 1)
        {
            // The top-level statements already ran; only invoke the hook.
            let options = rhai::CallFnOptions::new().eval_ast(false);
            engine
                .call_fn_with_options::<Dynamic>(
                    options,
                    &mut scope,
                    &ast,
                    hook,
                    (context_dyn.clone(),),
                )
                .map_err(map_eval_error(budget))?;
            break;
        }
    }

    let context = context_dyn
        .read_lock::<Map>()
        .ok_or_else(|| "context was replaced with a non-map value".to_string())?;
    let mutated_request = context
        .get("request")
        .and_then(|value| value.read_lock::<Map>().map(|map| request_view(&map)))
        .or_else(|| {
            context
                .get("request")
                .and_then(|value| value.clone().try_cast::<Map>())
                .map(|map| request_view(&map))
        });
    let mutated_response = context
        .get("response")
        .and_then(|value| value.read_lock::<Map>().map(|map| response_view(&map)))
        .or_else(|| {
            context
                .get("response")
                .and_then(|value| value.clone().try_cast::<Map>())
                .map(|map| response_view(&map))
        });
    Ok((mutated_request, mutated_response))
}

fn map_eval_error(budget: Duration) -> impl Fn(Box<rhai::EvalAltResult>) -> String {
    move |error| {
        if matches!(*error, rhai::EvalAltResult::ErrorTerminated(..)) {
            format!("script timed out after {}ms", budget.as_millis())
        } else {
            format!("script execution failed: {error}")
        }
    }
}

fn register_console(engine: &mut Engine) {
    engine.register_type::<ConsoleLog>();
    engine.register_fn("log", |console: &mut ConsoleLog, message: Dynamic| {
        console.push(message.to_string());
    });
    engine.register_fn(
        "log",
        |console: &mut ConsoleLog, first: Dynamic, second: Dynamic| {
            console.push(format!("{first} {second}"));
        },
    );
    engine.register_fn(
        "log",
        |console: &mut ConsoleLog, first: Dynamic, second: Dynamic, third: Dynamic| {
            console.push(format!("{first} {second} {third}"));
        },
    );
}

fn request_map(view: &RequestView) -> Map {
    let mut map = Map::new();
    map.insert("method".into(), view.method.clone().into());
    map.insert("url".into(), view.url.clone().into());
    map.insert("headers".into(), Dynamic::from_map(headers_map(&view.headers)));
    map.insert("body".into(), view.body.clone().into());
    map
}

fn response_map(view: &ResponseView) -> Map {
    let mut map = Map::new();
    map.insert("statusCode".into(), Dynamic::from(view.status_code as i64));
    map.insert("status".into(), view.status.clone().into());
    map.insert("headers".into(), Dynamic::from_map(headers_map(&view.headers)));
    map.insert("body".into(), view.body.clone().into());
    map
}

fn headers_map(headers: &HashMap<String, String>) -> Map {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(name.as_str().into(), value.clone().into());
    }
    map
}

fn map_headers(map: &Map) -> HashMap<String, String> {
    map.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn string_field(map: &Map, field: &str) -> String {
    map.get(field)
        .map(|value| value.to_string())
        .unwrap_or_default()
}

fn headers_field(map: &Map, field: &str) -> HashMap<String, String> {
    map.get(field)
        .and_then(|value| {
            value
                .read_lock::<Map>()
                .map(|inner| map_headers(&inner))
                .or_else(|| value.clone().try_cast::<Map>().map(|inner| map_headers(&inner)))
        })
        .unwrap_or_default()
}

fn request_view(map: &Map) -> RequestView {
    RequestView {
        method: string_field(map, "method"),
        url: string_field(map, "url"),
        headers: headers_field(map, "headers"),
        body: string_field(map, "body"),
    }
}

fn response_view(map: &Map) -> ResponseView {
    ResponseView {
        status_code: map
            .get("statusCode")
            .and_then(|value| value.as_int().ok())
            .map(|code| code as u16)
            .unwrap_or_default(),
        status: string_field(map, "status"),
        headers: headers_field(map, "headers"),
        body: string_field(map, "body"),
    }
}

fn apply_request_view(view: &RequestView, request: &mut InterceptedRequest) {
    if !view.method.is_empty() {
        request.method = view.method.clone();
    }
    if !view.url.is_empty() && view.url != request.url.to_string() {
        match view.url.parse() {
            Ok(parsed) => request.url = parsed,
            Err(error) => {
                tracing::warn!(url = %view.url, %error, "ignoring unparseable scripted URL");
            }
        }
    }
    request.headers = view.headers.clone();
    request.body = view.body.clone().into_bytes();
}

fn apply_response_view(view: &ResponseView, response: &mut InterceptedResponse) {
    if view.status_code != 0 {
        response.status_code = view.status_code;
    }
    if !view.status.is_empty() {
        response.status = view.status.clone();
    }
    response.headers = view.headers.clone();
    response.body = view.body.clone().into_bytes();
}

#[async_trait]
impl RequestInterceptor for ScriptManager {
    async fn intercept_request(
        &self,
        flow: &mut Flow,
        request: &mut InterceptedRequest,
    ) -> Result<Option<InterceptedResponse>, RuleError> {
        // Script problems are recorded on the flow, never surfaced to the
        // client.
        self.run_request_phase(flow, request);
        Ok(None)
    }
}

#[async_trait]
impl ResponseInterceptor for ScriptManager {
    async fn intercept_response(
        &self,
        flow: &mut Flow,
        response: &mut InterceptedResponse,
    ) -> Result<(), RuleError> {
        self.run_response_phase(flow, response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(id: &str, script_type: ScriptType, content: &str) -> Script {
        Script {
            id: id.to_string(),
            name: id.to_string(),
            content: content.to_string(),
            enabled: true,
            script_type,
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request() -> InterceptedRequest {
        InterceptedRequest::new(
            "GET".to_string(),
            "http://x.test/api".parse().expect("url"),
            HashMap::from([("Accept".to_string(), "*/*".to_string())]),
            b"{\"user\":\"a\"}".to_vec(),
        )
    }

    fn response() -> InterceptedResponse {
        InterceptedResponse::new(200, "OK").with_body(b"payload".to_vec())
    }

    fn flow() -> Flow {
        Flow::new(
            proxywoman_core::next_flow_id(),
            "GET".to_string(),
            "http://x.test/api".to_string(),
            "http".to_string(),
            "x.test".to_string(),
            "/api".to_string(),
            "127.0.0.1:1".to_string(),
            Default::default(),
        )
    }

    #[test]
    fn hook_function_mutates_response_header() {
        let manager = ScriptManager::new(None);
        manager
            .add_script(script(
                "s1",
                ScriptType::Response,
                r#"fn on_response(c) { c.response.headers["X-Test"] = "1"; }"#,
            ))
            .expect("add script");

        let mut flow = flow();
        let mut response = response();
        manager.run_response_phase(&mut flow, &mut response);

        assert_eq!(response.header("X-Test"), Some("1"));
        assert!(flow.tags.contains(&"script-processed".to_string()));
        assert!(flow.tags.contains(&"script-modified-response".to_string()));
        assert_eq!(flow.script_executions.len(), 1);
        assert!(flow.script_executions[0].success);
    }

    #[test]
    fn top_level_script_mutates_request_body() {
        let manager = ScriptManager::new(None);
        manager
            .add_script(script(
                "s1",
                ScriptType::Request,
                r#"context.request.body = "{\"user\":\"b\"}";"#,
            ))
            .expect("add script");

        let mut flow = flow();
        let mut request = request();
        manager.run_request_phase(&mut flow, &mut request);

        assert_eq!(request.body, b"{\"user\":\"b\"}");
        assert_eq!(flow.request.body, b"{\"user\":\"b\"}");
        assert!(flow.tags.contains(&"script-modified-request".to_string()));
    }

    #[test]
    fn console_log_lines_are_captured() {
        let manager = ScriptManager::new(None);
        manager
            .add_script(script(
                "s1",
                ScriptType::Request,
                r#"console.log("seen", context.request.method);"#,
            ))
            .expect("add script");

        let mut flow = flow();
        let mut request = request();
        manager.run_request_phase(&mut flow, &mut request);

        assert_eq!(flow.script_executions[0].logs, vec!["seen GET"]);
        assert!(!flow.tags.contains(&"script-modified-request".to_string()));
    }

    #[test]
    fn runaway_script_times_out_and_later_scripts_still_run() {
        let manager = ScriptManager::new(None).with_budget(Duration::from_millis(50));
        manager
            .add_script(script("a-loop", ScriptType::Request, "while true { }"))
            .expect("add script");
        manager
            .add_script(script(
                "b-after",
                ScriptType::Request,
                r#"context.request.headers["X-After"] = "ran";"#,
            ))
            .expect("add script");

        let started = Instant::now();
        let mut flow = flow();
        let mut request = request();
        manager.run_request_phase(&mut flow, &mut request);

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(flow.script_executions.len(), 2);
        let timed_out = &flow.script_executions[0];
        assert!(!timed_out.success);
        assert!(timed_out
            .error
            .as_deref()
            .expect("timeout error")
            .contains("timed out"));
        assert!(flow.script_executions[1].success);
        assert_eq!(request.header("X-After"), Some("ran"));
    }

    #[test]
    fn script_error_is_recorded_not_propagated() {
        let manager = ScriptManager::new(None);
        manager
            .add_script(script("bad", ScriptType::Request, "undefined_fn();"))
            .expect("add script");

        let mut flow = flow();
        let mut request = request();
        manager.run_request_phase(&mut flow, &mut request);

        assert!(!flow.script_executions[0].success);
        assert!(flow.script_executions[0].error.is_some());
        assert!(!flow.tags.contains(&"script-processed".to_string()));
    }

    #[test]
    fn validate_rejects_bad_syntax_without_running() {
        let manager = ScriptManager::new(None);
        assert!(manager.validate("let x = 1;").is_ok());
        assert!(manager.validate("fn {{{").is_err());
        // Validation must not execute: a runaway body still validates fine.
        assert!(manager.validate("while true { }").is_ok());
    }

    #[test]
    fn disabled_and_wrong_phase_scripts_are_skipped() {
        let manager = ScriptManager::new(None);
        let mut off = script("off", ScriptType::Request, r#"context.request.method = "PUT";"#);
        off.enabled = false;
        manager.add_script(off).expect("add script");
        manager
            .add_script(script(
                "resp-only",
                ScriptType::Response,
                r#"context.request.method = "PUT";"#,
            ))
            .expect("add script");

        let mut flow = flow();
        let mut request = request();
        manager.run_request_phase(&mut flow, &mut request);
        assert_eq!(request.method, "GET");
        assert!(flow.script_executions.is_empty());
    }
}
