//! Shared types for the Coedit collaborative editing backend.
//!
//! This crate contains the foundational pieces every other crate depends on:
//! the error taxonomy, the WebSocket wire envelope, document info types,
//! configuration options and small utilities (id and color generation).
//! Extracting these into a separate crate lets the feature crates compile in
//! parallel with the server binary.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod message;
pub mod prelude;
pub mod types;
pub mod utils;

pub use error::{CoResult, Error};

// vim: ts=4
