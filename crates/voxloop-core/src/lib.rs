//! Core types, config, errors, and artifact cache for voxloop.

pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod types;
