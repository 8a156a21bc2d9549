use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::CoreError;
use crate::flow::Flow;

/// In-memory table of completed flows. Flows are inserted once, after the
/// response has been written, so readers never see a half-built record.
#[derive(Debug, Default)]
pub struct FlowStore {
    flows: RwLock<HashMap<String, Flow>>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: Flow) {
        self.flows
            .write()
            .expect("flow store lock poisoned")
            .insert(flow.id.clone(), flow);
    }

    pub fn get(&self, id: &str) -> Option<Flow> {
        self.flows
            .read()
            .expect("flow store lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Flow> {
        self.flows
            .read()
            .expect("flow store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.flows
            .write()
            .expect("flow store lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.flows.read().expect("flow store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flips the pin state and returns the new value.
    pub fn toggle_pin(&self, id: &str) -> Result<bool, CoreError> {
        let mut flows = self.flows.write().expect("flow store lock poisoned");
        let flow = flows
            .get_mut(id)
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))?;
        flow.is_pinned = !flow.is_pinned;
        Ok(flow.is_pinned)
    }

    pub fn pinned(&self) -> Vec<Flow> {
        self.filter(|flow| flow.is_pinned)
    }

    pub fn filter(&self, predicate: impl Fn(&Flow) -> bool) -> Vec<Flow> {
        self.flows
            .read()
            .expect("flow store lock poisoned")
            .values()
            .filter(|flow| predicate(flow))
            .cloned()
            .collect()
    }
}
