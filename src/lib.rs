//! Discovery and transfer orchestration for LAN dump devices.
//!
//! Devices announce themselves over a UDP beacon and expose a small HTTP
//! surface. This crate finds them, keeps a registry of who is alive, and drives
//! the request -> poll -> download workflow that yields a local payload.

pub mod adapters;
pub mod config;
pub mod context;
pub mod core;
pub mod logging;

pub use crate::core::error::{Error, Result};
