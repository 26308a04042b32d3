pub mod allocation;
pub mod analyzer;
pub mod config;
pub mod profiles;
pub mod redis;
pub mod store;
pub mod types;
