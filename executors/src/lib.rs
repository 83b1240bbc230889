pub mod engine;
pub mod events;
pub mod indexer;
pub mod metrics;
pub mod nonce_manager;
pub mod options;
pub mod shutdown;
pub mod store;
pub mod webhook;
pub mod worker;
