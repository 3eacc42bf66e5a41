//! Relay core library: connection gateway, token verification, rate
//! limiting, session storage, and the upstream proxy client used by the CLI.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod gateway;
pub mod ratelimit;
pub mod store;
pub mod upstream;
pub mod users;
