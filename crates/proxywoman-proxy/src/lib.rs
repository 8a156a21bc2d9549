//! The ProxyWoman proxy engine: a forward HTTP/1.1 proxy for cleartext
//! traffic, a CONNECT splice that terminates TLS with dynamically minted
//! leaves, and the interception pipeline between the two faces.

mod client;
mod engine;
mod error;
mod http1;
mod replay;

pub use engine::{EngineConfig, ProxyServer};
pub use error::ProxyError;
pub use replay::{ReplayManager, ReplayOverlay, ReplayRequest, ReplayResponse};
