//! HTTP middleware: request logging and environment-gated transport
//! security.

pub mod logging;
pub mod security;

pub use logging::request_logging;
pub use security::{build_cors_layer, https_redirect};
