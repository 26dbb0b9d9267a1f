//! Video generation relay
//!
//! Submits prompts to a remote, rate-limited video generation service under a
//! pool of API credentials, follows each job to a terminal state and records
//! the outcome in a local task ledger.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
