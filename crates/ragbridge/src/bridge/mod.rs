//! Wire-level pieces of the worker bridge.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Command/Envelope out, Response in)
//! - **codec**: newline-framed JSON codec for AsyncRead/AsyncWrite
//! - **correlation**: pending-request table matching responses to callers
//! - **diagnostics**: stderr forwarding into tracing

pub mod codec;
pub mod correlation;
pub mod diagnostics;
pub mod protocol;
