//! Host channel for ILX extensions.
//!
//! This crate defines the line-delimited JSON-RPC contract spoken between an
//! ILX host and its extension processes, the extension-side server that
//! answers host-dispatched calls, and the host-side runtime that spawns
//! extensions and calls their exported methods.

pub mod host;
pub mod permissions;
pub mod protocol;
pub mod server;
