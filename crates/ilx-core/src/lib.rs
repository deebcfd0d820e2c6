//! Core infrastructure for ILX extensions.
//!
//! This crate provides the pieces shared by the stdio server and every
//! extension module: the method handler contract, the dispatch table that maps
//! remote method names to handlers, and the logging subsystem.

pub mod dispatch;
pub mod logging;
pub mod method;
