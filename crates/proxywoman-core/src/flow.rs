use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One script run against a flow, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecution {
    pub script_id: String,
    pub script_name: String,
    pub phase: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub executed_at: DateTime<Utc>,
}

/// Request half of a flow: the outbound shape after any pipeline mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Response half of a flow. `body` holds the raw wire bytes; the decoder
/// fills in the derived views.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResponse {
    pub status_code: u16,
    pub status: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub decoded_body: Vec<u8>,
    pub encoding: String,
    pub content_type: String,
    pub is_text: bool,
    pub is_binary: bool,
    pub is_document: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex_view: Option<String>,
}

/// The unit of observation: one request/response exchange plus everything the
/// pipeline learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub client: String,
    pub domain: String,
    pub path: String,
    pub scheme: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub request_size: u64,
    pub response_size: u64,
    pub request: FlowRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<FlowResponse>,
    pub is_pinned: bool,
    pub is_blocked: bool,
    pub content_type: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub script_executions: Vec<ScriptExecution>,
}

impl Flow {
    pub fn new(
        id: String,
        method: String,
        url: String,
        scheme: String,
        domain: String,
        path: String,
        client: String,
        headers: HashMap<String, String>,
    ) -> Self {
        let content_type = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        let now = Utc::now();

        Self {
            id,
            url: url.clone(),
            method: method.clone(),
            status_code: 0,
            client,
            domain,
            path,
            scheme,
            start_time: now,
            end_time: now,
            duration_ms: 0,
            request_size: 0,
            response_size: 0,
            request: FlowRequest {
                method,
                url,
                headers,
                body: Vec::new(),
            },
            response: None,
            is_pinned: false,
            is_blocked: false,
            content_type,
            tags: Vec::new(),
            script_executions: Vec::new(),
        }
    }

    pub fn set_request_body(&mut self, body: Vec<u8>) {
        self.request_size = body.len() as u64;
        self.request.body = body;
    }

    /// Stamps the response and end time. The derived views on the response
    /// are left for the decoder.
    pub fn set_response(&mut self, response: FlowResponse) {
        self.end_time = Utc::now();
        self.duration_ms = (self.end_time - self.start_time).num_milliseconds();
        self.status_code = response.status_code;
        self.response_size = response.body.len() as u64;
        if self.content_type.is_empty() {
            if let Some(value) = response
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .map(|(_, value)| value.clone())
            {
                self.content_type = value;
            }
        }
        self.response = Some(response);
    }

    /// Tags form an ordered set; re-adding an existing tag is a no-op.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn remove_tag(&mut self, tag: &str) {
        self.tags.retain(|existing| existing != tag);
    }

    pub fn add_script_execution(&mut self, execution: ScriptExecution) {
        self.script_executions.push(execution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_flow() -> Flow {
        Flow::new(
            "flow_1".to_string(),
            "GET".to_string(),
            "http://example.test/ping".to_string(),
            "http".to_string(),
            "example.test".to_string(),
            "/ping".to_string(),
            "127.0.0.1:50000".to_string(),
            HashMap::new(),
        )
    }

    #[test]
    fn tags_stay_unique_and_ordered() {
        let mut flow = sample_flow();
        flow.add_tag("blocked-by-ads");
        flow.add_tag("map-local");
        flow.add_tag("blocked-by-ads");
        assert_eq!(flow.tags, vec!["blocked-by-ads", "map-local"]);

        flow.remove_tag("blocked-by-ads");
        assert_eq!(flow.tags, vec!["map-local"]);
    }

    #[test]
    fn set_response_stamps_timing_and_size() {
        let mut flow = sample_flow();
        let response = FlowResponse {
            status_code: 200,
            status: "200 OK".to_string(),
            body: b"hello".to_vec(),
            ..FlowResponse::default()
        };
        flow.set_response(response);

        assert_eq!(flow.status_code, 200);
        assert_eq!(flow.response_size, 5);
        assert!(flow.end_time >= flow.start_time);
        assert_eq!(
            flow.duration_ms,
            (flow.end_time - flow.start_time).num_milliseconds()
        );
    }

    #[test]
    fn content_type_falls_back_to_response_header() {
        let mut flow = sample_flow();
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        flow.set_response(FlowResponse {
            status_code: 200,
            headers,
            ..FlowResponse::default()
        });
        assert_eq!(flow.content_type, "application/json");
    }
}
