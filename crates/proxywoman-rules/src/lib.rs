//! Interception features for the ProxyWoman core. Each feature owns its own
//! rule table; the engine composes them into the fixed pipeline order via
//! [`InterceptPipeline`].

mod allowblock;
mod breakpoint;
mod error;
mod exchange;
mod maplocal;
mod pipeline;
mod reverseproxy;
mod scripting;
mod storage;
mod upstream;

pub use allowblock::{AllowBlockAction, AllowBlockManager, AllowBlockMode, AllowBlockRule};
pub use breakpoint::{
    BreakpointManager, BreakpointPhase, BreakpointRule, BreakpointSessionInfo, BreakpointSink,
    NoopBreakpointSink, RequestEdit, ResponseEdit, ResumePayload, DEFAULT_WAIT_TIMEOUT,
};
pub use error::RuleError;
pub use exchange::{InterceptedRequest, InterceptedResponse, UpstreamRoute};
pub use maplocal::{content_type_for_extension, MapLocalManager, MapLocalRule};
pub use pipeline::{FeatureSet, InterceptPipeline, RequestInterceptor, ResponseInterceptor};
pub use reverseproxy::{ReverseProxyManager, ReverseProxyRule};
pub use scripting::{Script, ScriptManager, ScriptType, DEFAULT_SCRIPT_BUDGET};
pub use storage::{BreakpointRuleStore, MemoryStore, ScriptStore};
pub use upstream::{UpstreamManager, UpstreamProxy};
