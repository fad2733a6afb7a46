//! Gateway: HTTP + WebSocket front end for the browser UI.
//!
//! Single port serves the page, its banner, a health check, the shutdown control and the
//! WebSocket over which questions go in and live answers come out.

mod protocol;
mod server;

pub use protocol::{QueryParams, WsEvent, WsRequest, WsResponse};
pub use server::{run_gateway, serve, GatewayHandler, GatewayState};
