//! axum HTTP surface for the router.

mod http;

pub use http::{router, run_http, GatewayState};
