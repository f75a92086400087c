//! A correspondence: one named, ordered, bidirectional exchange.
//!
//! The read side is a single bounded channel fed by the peer's driver task.
//! Whoever holds the channel lock is the exclusive waiter: chunks, the end
//! signal, and error signals go only to it, never to some side channel. The
//! write side goes back out through the driver's command queue, so frames
//! written by concurrent tasks interleave at frame granularity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use missive_wire::{Header, Message, MessageError};

use crate::driver::Command;
use crate::errors::CorrespondenceError;
use crate::peer::PeerShared;

/// Per-read scratch space, reset to empty at each read operation. Read
/// handlers may stash whatever they like in it.
pub type ReadContext = HashMap<String, Value>;

/// A read handler: runs against each incoming chunk before `next` returns
/// it, receiving the chunk body, the header it arrived with, and the
/// per-read context. An error here propagates out of `next`.
pub type ReadHook =
    Box<dyn FnMut(&Value, &Header, &mut ReadContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// What `next` resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    /// A data chunk (from a `data` frame, or the body of a `fin` frame).
    Item(Value),
    /// The correspondence finished without a further body.
    End,
}

impl Next {
    /// The chunk value, or `None` for [`Next::End`].
    pub fn into_item(self) -> Option<Value> {
        match self {
            Next::Item(value) => Some(value),
            Next::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Next::End)
    }
}

/// Read-side event published by the driver.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    Chunk { body: Value, header: Header },
    End,
    Error(MessageError),
}

/// A stateful bidirectional conduit identified by a correspondence id.
///
/// Created by the owning [`Peer`](crate::Peer), either on local initiation
/// (`send`/`correspond`) or when a frame arrives bearing an untracked id.
/// Both halves close independently: the read side on an incoming `fin`/`err`
/// frame, the write side on a local [`finish`](Self::finish) or
/// [`error`](Self::error). Once both are closed the peer releases its record
/// and the id may be reused by a future correspondence.
pub struct Correspondence {
    id: String,
    /// Replaced on every inbound frame, so late authorization rotations and
    /// custom header fields are visible to handlers.
    header: StdMutex<Header>,
    readable: AtomicBool,
    writable: AtomicBool,
    read_rx: Mutex<mpsc::Receiver<ReadEvent>>,
    /// Serializes write-side state transitions and keeps frame order equal
    /// to call order.
    write_lock: Mutex<()>,
    shared: Arc<PeerShared>,
}

impl Correspondence {
    pub(crate) fn new(
        header: Header,
        shared: Arc<PeerShared>,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Sender<ReadEvent>) {
        let (ingest_tx, read_rx) = mpsc::channel(buffer);
        let correspondence = Arc::new(Self {
            id: header.correspondence_id.clone(),
            header: StdMutex::new(header),
            readable: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            read_rx: Mutex::new(read_rx),
            write_lock: Mutex::new(()),
            shared,
        });
        (correspondence, ingest_tx)
    }

    /// The correspondence id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The subject this correspondence was initiated under.
    pub fn subject(&self) -> String {
        self.header.lock().expect("header lock poisoned").subject.clone()
    }

    /// Snapshot of the current header (as of the most recent inbound frame).
    pub fn header(&self) -> Header {
        self.header.lock().expect("header lock poisoned").clone()
    }

    /// Whether the read side is still open.
    pub fn readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    /// Whether the write side is still open.
    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_header(&self, header: Header) {
        *self.header.lock().expect("header lock poisoned") = header;
    }

    pub(crate) fn mark_unreadable(&self) {
        self.readable.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_unwritable(&self) {
        self.writable.store(false, Ordering::SeqCst);
    }

    fn outbound_header(&self) -> Header {
        self.header.lock().expect("header lock poisoned").clone()
    }

    fn enqueue(&self, message: Message) -> Result<(), CorrespondenceError> {
        self.shared
            .send(Command::Frame { message })
            .map_err(|_| CorrespondenceError::Disconnected)
    }

    /// Send a `data` frame.
    pub async fn write(&self, body: Value) -> Result<(), CorrespondenceError> {
        let _guard = self.write_lock.lock().await;
        self.check_writable()?;
        self.enqueue(Message::data(self.outbound_header(), body))
    }

    /// Send a `fin` frame, optionally carrying a final body, and close the
    /// write side. A body here produces exactly one wire frame.
    pub async fn finish(&self, body: Option<Value>) -> Result<(), CorrespondenceError> {
        let _guard = self.write_lock.lock().await;
        self.check_writable()?;
        self.writable.store(false, Ordering::SeqCst);
        self.enqueue(Message::finish(self.outbound_header(), body))
    }

    /// Send an `err` frame and close the write side.
    pub async fn error(&self, error: MessageError) -> Result<(), CorrespondenceError> {
        let _guard = self.write_lock.lock().await;
        self.check_writable()?;
        self.writable.store(false, Ordering::SeqCst);
        self.enqueue(Message::error(self.outbound_header(), error))
    }

    fn check_writable(&self) -> Result<(), CorrespondenceError> {
        if self.shared.is_disconnected() {
            return Err(CorrespondenceError::Disconnected);
        }
        if !self.writable.load(Ordering::SeqCst) {
            return Err(CorrespondenceError::Unwritable);
        }
        Ok(())
    }

    /// Wait for the next data chunk.
    ///
    /// Returns [`Next::End`] when the correspondence finishes without a
    /// further body; fails with the remote [`MessageError`] when an `err`
    /// frame arrives, and with [`CorrespondenceError::Unreadable`] once the
    /// terminated stream is drained.
    pub async fn next(&self) -> Result<Next, CorrespondenceError> {
        self.next_with(&mut []).await
    }

    /// Like [`next`](Self::next), running each read handler in order against
    /// the chunk before returning it. The per-read context starts empty on
    /// every call.
    pub async fn next_with(&self, hooks: &mut [ReadHook]) -> Result<Next, CorrespondenceError> {
        if self.shared.is_disconnected() {
            return Err(CorrespondenceError::Disconnected);
        }

        // Holding the receiver lock makes this call the exclusive waiter.
        let mut read_rx = tokio::select! {
            guard = self.read_rx.lock() => guard,
            _ = self.shared.cancelled() => return self.cancelled(),
        };
        let event = tokio::select! {
            event = read_rx.recv() => event,
            _ = self.shared.cancelled() => return self.cancelled(),
        };

        match event {
            Some(ReadEvent::Chunk { body, header }) => {
                let mut context = ReadContext::new();
                for hook in hooks.iter_mut() {
                    hook(&body, &header, &mut context).map_err(CorrespondenceError::Hook)?;
                }
                Ok(Next::Item(body))
            }
            Some(ReadEvent::End) => Ok(Next::End),
            Some(ReadEvent::Error(error)) => Err(CorrespondenceError::Remote(error)),
            None => {
                if self.shared.is_disconnected() {
                    Err(CorrespondenceError::Disconnected)
                } else {
                    Err(CorrespondenceError::Unreadable)
                }
            }
        }
    }

    fn cancelled(&self) -> Result<Next, CorrespondenceError> {
        self.mark_unreadable();
        Err(CorrespondenceError::Cancelled)
    }

    /// The remaining chunks as a lazy sequence. Terminates when the
    /// correspondence finishes; propagates errors from the underlying reads.
    pub fn all(&self) -> Chunks<'_> {
        self.all_with(Vec::new())
    }

    /// Like [`all`](Self::all), with read handlers applied to every chunk.
    pub fn all_with(&self, hooks: Vec<ReadHook>) -> Chunks<'_> {
        Chunks {
            correspondence: self,
            hooks,
            done: false,
        }
    }
}

impl std::fmt::Debug for Correspondence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correspondence")
            .field("id", &self.id)
            .field("readable", &self.readable())
            .field("writable", &self.writable())
            .finish_non_exhaustive()
    }
}

/// Lazy finite sequence of chunks, as produced by
/// [`Correspondence::all`]. Yields `None` after the end signal; an error
/// also ends the sequence.
pub struct Chunks<'a> {
    correspondence: &'a Correspondence,
    hooks: Vec<ReadHook>,
    done: bool,
}

impl Chunks<'_> {
    /// The next chunk, `None` once the correspondence has finished.
    pub async fn next(&mut self) -> Option<Result<Value, CorrespondenceError>> {
        if self.done {
            return None;
        }
        match self.correspondence.next_with(&mut self.hooks).await {
            Ok(Next::Item(value)) => Some(Ok(value)),
            Ok(Next::End) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    /// Drain the sequence into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>, CorrespondenceError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }
}
