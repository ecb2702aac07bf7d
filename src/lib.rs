//! Reverse-tunnel metrics proxy: clients behind NAT dial out and hold an
//! authenticated, encrypted, multiplexed tunnel through which the proxy
//! brokers Prometheus-style scrapes to their local HTTP endpoints.

pub mod auth;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod message;
pub mod metrics;
pub mod modifier;
pub mod parse;
pub mod server;
