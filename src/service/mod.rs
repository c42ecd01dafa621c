//! # Endpoints
//!
//! The client and server built on top of the protocol core.
//!
//! ## Components
//! - **endpoint**: per-connection `Peer` handle and read loop
//! - **registry**: server-side connection table keyed by connection key
//! - **client**: single-connection client endpoint
//! - **server**: listening endpoint with targeted send and broadcast

pub mod client;
pub mod endpoint;
pub mod registry;
pub mod server;

pub use client::Client;
pub use endpoint::{ConnectionState, Peer};
pub use registry::BroadcastReport;
pub use server::{Server, Target};
