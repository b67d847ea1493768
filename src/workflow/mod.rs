//! Risk-assessment workflow engine.
//!
//! - [`db`]: SQLite execution store with compare-and-set commits and leases
//! - [`executors`] / [`research`]: stage seams and the HTTP stage service
//! - [`orchestrator`]: the status state machine
//! - [`runner`]: in-process background advances
//! - [`sweeper`]: periodic retry, escalation and stall recovery
//! - [`identity`]: anonymous-to-registered ownership transfer
//! - [`events`] / [`bridge`]: per-run event fan-out and client streams
//! - [`service`] / [`api`] / [`server`]: the produced surface over HTTP

pub mod api;
pub mod bridge;
pub mod clock;
pub mod db;
pub mod events;
pub mod executors;
pub mod identity;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod research;
pub mod runner;
pub mod server;
pub mod service;
pub mod sweeper;

#[cfg(test)]
pub mod testing;
