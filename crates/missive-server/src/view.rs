//! Write-only capability view of a correspondence.

use std::sync::Arc;

use serde_json::Value;

use missive_peer::{Correspondence, CorrespondenceError};
use missive_wire::{Header, MessageError};

/// A capability-restricted reference to a [`Correspondence`] exposing only
/// the write side. Handed to exception handlers, which should respond but
/// have no business consuming the read stream.
///
/// Shares state with the underlying correspondence: terminating the view
/// terminates the correspondence.
#[derive(Clone, Debug)]
pub struct WritableCorrespondence {
    inner: Arc<Correspondence>,
}

impl WritableCorrespondence {
    pub(crate) fn new(inner: Arc<Correspondence>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn subject(&self) -> String {
        self.inner.subject()
    }

    pub fn header(&self) -> Header {
        self.inner.header()
    }

    pub fn writable(&self) -> bool {
        self.inner.writable()
    }

    /// Send a `data` frame.
    pub async fn write(&self, body: Value) -> Result<(), CorrespondenceError> {
        self.inner.write(body).await
    }

    /// Send a `fin` frame and close the write side.
    pub async fn finish(&self, body: Option<Value>) -> Result<(), CorrespondenceError> {
        self.inner.finish(body).await
    }

    /// Send an `err` frame and close the write side.
    pub async fn error(&self, error: MessageError) -> Result<(), CorrespondenceError> {
        self.inner.error(error).await
    }
}
