#![deny(unsafe_code)]

//! missive - multiplexed streaming correspondences over any duplex byte
//! transport.
//!
//! This crate provides a unified API for the missive protocol. Users should
//! depend on this crate rather than the individual component crates.
//!
//! Frames are newline-terminated JSON objects; each belongs to a named
//! correspondence carrying zero or more data frames followed by a `fin` or
//! `err` terminator. A [`Peer`] speaks the protocol on one stream; a
//! [`Server`] hosts peers and routes inbound correspondences to handlers by
//! subject.
//!
//! ```no_run
//! use std::sync::Arc;
//! use missive::{Correspondence, Server};
//!
//! # async fn demo(stream: tokio::io::DuplexStream) {
//! let server = Server::new();
//! server.handle("echo", |corr: Arc<Correspondence>| async move {
//!     let request = corr.next().await?;
//!     corr.finish(request.into_item()).await?;
//!     Ok(())
//! });
//! server.connect(stream).await;
//! # }
//! ```

// Wire-level types and framing.
pub use missive_wire::{
    decode_line, encode, DecodeError, FramedStream, Header, Message, MessageError, MessageKind,
    RecvError, SchemaError,
};

// The correspondence/peer runtime.
pub use missive_peer::{
    Chunks, Correspondence, CorrespondenceError, Next, Peer, PeerConfig, PeerError, PeerEvent,
    ReadContext, ReadHook,
};

// Serving and dispatch.
pub use missive_server::{
    DefaultExceptionHandler, ExceptionHandler, Fault, Handler, Server, ServerConfig, ServerError,
    ServerEvent, UnknownSubjectHandler, WritableCorrespondence,
};
