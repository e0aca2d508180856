//! fleet control plane library.
//!
//! The crate ships the `control-plane` binary; the library surface exists so
//! the reconciler can be driven from integration tests against in-memory
//! collaborators.

pub mod api;
pub mod config;
pub mod db;
pub mod dockerfile;
pub mod engine;
pub mod image_build;
pub mod model;
pub mod node_client;
pub mod nodes;
pub mod registry;
pub mod state;
pub mod store;
