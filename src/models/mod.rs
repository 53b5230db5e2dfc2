//! Core data models for the transfer gateway.
//!
//! These types describe accounts, upload geometry, the archive tree and the
//! upload control-channel protocol. They carry no I/O.

pub mod account;
pub mod archive;
pub mod messages;
pub mod upload;
