//! Gateway: HTTP + WebSocket connection relay.
//!
//! Single port serves a health endpoint and the `/ws` upgrade. Connections
//! authenticate via `token`/`auth_type` query params, bind one chat session
//! per user, and relay messages to the upstream prediction service.

mod connection;
mod protocol;
mod server;

pub use protocol::{
    ErrorFrame, InboundFrame, MessageFrame, TokenRefreshFrame, UserInfoFrame, CLOSE_AUTH_ERROR,
    CLOSE_RATE_LIMITED,
};
pub use server::{router, run_gateway, ConnectQuery, GatewayState};
