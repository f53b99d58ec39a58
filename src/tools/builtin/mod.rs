//! Tool types compiled into the runtime.

pub mod gmail;
pub mod http_fetch;
pub mod notes;
