use std::sync::{Arc, Mutex};

use crate::flow::Flow;

/// Outbound flow-event callback. Invoked at most once per flow, after the
/// response has been written back (or the synthetic response produced).
pub trait FlowSink: Send + Sync {
    fn on_flow(&self, flow: &Flow);
}

#[derive(Debug, Default)]
pub struct NoopFlowSink;

impl FlowSink for NoopFlowSink {
    fn on_flow(&self, _flow: &Flow) {}
}

/// Collecting sink for tests and embedders that want a snapshot view.
#[derive(Debug, Default, Clone)]
pub struct VecFlowSink {
    flows: Arc<Mutex<Vec<Flow>>>,
}

impl VecFlowSink {
    pub fn snapshot(&self) -> Vec<Flow> {
        self.flows.lock().expect("flow sink lock poisoned").clone()
    }
}

impl FlowSink for VecFlowSink {
    fn on_flow(&self, flow: &Flow) {
        self.flows
            .lock()
            .expect("flow sink lock poisoned")
            .push(flow.clone());
    }
}

/// Host OS proxy configuration hook. The engine works unchanged when these
/// are no-ops; real implementations live in platform shims.
pub trait SystemProxy: Send + Sync {
    fn set_system_proxy(&self, port: u16) -> Result<(), String>;
    fn disable_system_proxy(&self) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn set_system_proxy(&self, _port: u16) -> Result<(), String> {
        Ok(())
    }

    fn disable_system_proxy(&self) -> Result<(), String> {
        Ok(())
    }
}
