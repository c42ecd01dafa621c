//! # Messaging Protocol
//!
//! Everything between a decoded frame and application code.
//!
//! ## Components
//! - **message**: the `{id, code, data}` envelope
//! - **dispatcher**: fan-out of inbound messages to handlers by code, plus `"ALL"`
//! - **correlation**: pending request table matching replies to requests by id
//! - **handshake**: connection key announcement and accept/reject answer

pub mod correlation;
pub mod dispatcher;
pub mod handshake;
pub mod message;
