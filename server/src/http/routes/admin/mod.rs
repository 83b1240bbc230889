pub mod indexers;
pub mod metrics;
