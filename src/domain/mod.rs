//! Domain Module
//!
//! Core domain types and ports (traits) for the resource graph engine.

pub mod ports;

pub use ports::*;
