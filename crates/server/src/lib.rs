//! Clogs server: configuration and HTTP surface over the core engine

pub mod api;
pub mod config;
