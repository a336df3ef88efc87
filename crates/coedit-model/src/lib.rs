//! CRDT-backed document model
//!
//! One [`model::DocumentModel`] owns one Loro document whose canonical state
//! is a tree container named `lexical`. The [`converter`] maps between
//! Lexical editor JSON and that tree, the [`mapper`] keeps the bidirectional
//! lexical-key/tree-id tables, and the model layer serializes mutations,
//! detects changes and emits events for the hub and the command interface.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod converter;
pub mod event;
pub mod mapper;
pub mod model;
pub mod value;

mod prelude;

pub use event::ModelEvent;
pub use model::{DocumentModel, HandleOutcome};

// vim: ts=4
