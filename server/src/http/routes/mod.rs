pub mod admin;
pub mod transaction;
