//! Webhook ingestion with signature verification, idempotent receipt,
//! durable recording, live WebSocket fan-out and a query/replay API.

pub mod classify;
pub mod config;
pub mod dedup;
pub mod error;
pub mod hooks;
pub mod http_server;
pub mod hub;
pub mod localtime;
pub mod pipeline;
pub mod replay;
pub mod retention;
pub mod store;
pub mod types;
pub mod verification;
pub mod ws;
