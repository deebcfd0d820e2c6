//! Configuration types and loaders for ILX extensions.
//!
//! This crate owns the on-disk `plugin.toml` schema so the extension binary
//! and the host runtime read the same source of truth.

pub mod manifest;

pub use manifest::{ExtensionCompatibility, ExtensionManifest, ExtensionMethods, ExtensionRuntime};
