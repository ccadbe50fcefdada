//! Common utilities and types shared across Mesh Rooms components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for the hub wire protocol (client and server events)
pub mod protocol;
