pub mod chain;
pub mod error;
pub mod signer;
pub mod transaction;
