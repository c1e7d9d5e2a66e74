//! # fm-core
//!
//! Core types and utilities for the facility-management client.
//!
//! This crate provides the building blocks shared by the other crates:
//! - Backend error types
//! - Entity references (tickets, inspection reports)
//! - Client configuration
//! - Tracing setup

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use error::*;
pub use types::*;
