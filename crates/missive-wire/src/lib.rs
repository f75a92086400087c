#![deny(unsafe_code)]

//! Wire-level types and framing for the missive protocol.
//!
//! Every frame on the wire is the UTF-8 JSON encoding of a [`Message`]
//! followed by a single `\n`. [`FramedStream`] turns any duplex byte stream
//! into a message transport; [`Message`] and friends model the frames.

mod framing;
mod message;

pub use framing::{decode_line, encode, DecodeError, FramedStream, RecvError};
pub use message::{Header, Message, MessageError, MessageKind, SchemaError};
