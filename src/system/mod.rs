//! System integration
//!
//! Host resource checks run before a model is loaded.

pub mod resources;
