//! Shared core for the ProxyWoman interception engine: the flow record and
//! its store, response body decoding, event sinks, configuration, and the
//! rule matcher every feature shares.

mod config;
mod decoder;
mod error;
mod events;
mod flow;
mod matcher;
mod store;

pub use config::{AppConfig, CONFIG_FILE};
pub use decoder::decode_response;
pub use error::CoreError;
pub use events::{FlowSink, NoopFlowSink, NoopSystemProxy, SystemProxy, VecFlowSink};
pub use flow::{Flow, FlowRequest, FlowResponse, ScriptExecution};
pub use matcher::{method_matches, url_matches};
pub use store::FlowStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_FLOW_NANOS: AtomicU64 = AtomicU64::new(0);

/// Process-unique flow id from a monotonic-ish nanosecond clock.
pub fn next_flow_id() -> String {
    format!("flow_{}", next_unix_nanos())
}

/// Session ids share the clock so they sort alongside flow ids.
pub fn next_session_id() -> String {
    format!("bp_{}", next_unix_nanos())
}

fn next_unix_nanos() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    // Two calls inside one clock tick must still produce distinct ids.
    let mut last = LAST_FLOW_NANOS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_FLOW_NANOS.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(observed) => last = observed,
        }
    }
}
