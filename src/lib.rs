pub mod config;
pub mod core;
pub mod logging;
pub mod platform;
pub mod tools;
