//! # Core Wire Components
//!
//! Framing and message serialization.
//!
//! ## Components
//! - **FrameCodec**: Tokio codec delimiting frames over byte streams
//! - **MessageCodec**: Message <-> frame payload encoding (JSON by default)
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Limits
//! - Maximum frame payload: 16MB by default (prevents memory exhaustion)
//! - Magic bytes prevent accidental misinterpretation
//! - Length validation before allocation

pub mod codec;
pub mod serialization;
