//! Real-time DDoS defense engine.
//!
//! The library holds the whole pipeline; `src/main.rs` is a thin driver that
//! loads configuration, builds a [`core::DefenseContext`] and exposes the HTTP
//! control surface.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
