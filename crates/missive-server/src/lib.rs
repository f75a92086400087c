#![deny(unsafe_code)]

//! Subject routing and correspondence handling.
//!
//! A [`Server`] hosts any number of peers, dispatches each newly observed
//! inbound correspondence to the handler registered for its subject, and
//! runs an exception pipeline when a handler fails. Handlers own the
//! correspondences they are given: returning without terminating one is a
//! contract breach the server reports as an
//! [`UnfinishedCorrespondence`](ServerError::UnfinishedCorrespondence)
//! error.

mod fault;
mod handler;
mod server;
mod view;

pub use fault::Fault;
pub use handler::{DefaultExceptionHandler, ExceptionHandler, Handler, UnknownSubjectHandler};
pub use server::{Server, ServerConfig, ServerError, ServerEvent};
pub use view::WritableCorrespondence;

pub use missive_peer::{
    Chunks, Correspondence, CorrespondenceError, Header, Message, MessageError, MessageKind, Next,
    Peer, PeerError, PeerEvent,
};
