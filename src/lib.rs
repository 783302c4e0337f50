//! Client-side ingestion and matching orchestration for shoppable videos:
//! find a reachable processing backend, drive upload, detection and matching
//! to a terminal state, and fall back to a local simulation when offline.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod matching;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;
