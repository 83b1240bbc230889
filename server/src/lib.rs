pub mod config;
pub mod http;
pub mod sink;

pub use config::{RelayConfig, ServerConfig, StoreBackend};
pub use http::server::{EngineServer, EngineServerState, RelayEngine};
pub use sink::DispatchSink;
