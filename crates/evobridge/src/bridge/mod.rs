//! Wire layer for the client-worker channel.
//!
//! The worker speaks newline-delimited JSON over its standard streams:
//! requests go down stdin, responses and events come back up stdout.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, Event) and decode rules
//! - **codec**: Line framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
