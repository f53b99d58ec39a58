pub mod agent;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod oauth;
pub mod scheduler;
pub mod vault;
