//! LUMEN chat server - Library exports for testing

pub mod api;
pub mod config;
pub mod core;
pub mod infrastructure;
