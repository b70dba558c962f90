//! Source implementations.

/// HTTP push source implementation.
pub mod http_push;
pub use self::http_push::{HttpPushConfiguration, HttpPushSource};
