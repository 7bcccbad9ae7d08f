//! streamrelay server: webhook ingestion, subscription reconciliation, clip
//! polling and chat delivery.

pub mod app_state;
pub mod chat;
pub mod db;
mod handlers;
pub mod http;
mod middleware;
pub mod platform;
mod routes;
pub mod server;
pub mod services;
mod tracer;

#[cfg(test)]
mod test_support;
