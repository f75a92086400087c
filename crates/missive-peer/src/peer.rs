//! The peer handle: one endpoint of the protocol bound to a single stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use missive_wire::{FramedStream, Header, Message};

use crate::correspondence::Correspondence;
use crate::driver::{Command, Driver};
use crate::errors::PeerError;

/// Events a peer surfaces to whoever consumes it (an embedding server, or
/// user code via [`Peer::next_event`]).
#[derive(Debug)]
pub enum PeerEvent {
    /// A remote-initiated correspondence became known. Emitted before its
    /// first frame is ingested, so the consumer can start reading in time to
    /// observe chunk one.
    Correspondence(Arc<Correspondence>),
    /// A protocol or transport error. The connection stays up unless a
    /// `Disconnect` follows.
    Error(PeerError),
    /// The peer disconnected; no further events follow.
    Disconnect,
}

/// Peer tuning knobs.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Cancellation token propagated to every read wait on this peer.
    /// Cancelling it disconnects the peer.
    pub cancel: CancellationToken,
    /// Per-correspondence inbound chunk buffer. A full buffer stalls the
    /// ingestion task, which backpressures the transport.
    pub read_buffer: usize,
    /// Peer event buffer.
    pub event_buffer: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            read_buffer: 64,
            event_buffer: 1024,
        }
    }
}

/// State shared between the peer handle, its correspondences, and the
/// driver task.
pub(crate) struct PeerShared {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    disconnected: AtomicBool,
    cancel: CancellationToken,
}

impl PeerShared {
    pub(crate) fn send(&self, command: Command) -> Result<(), ()> {
        self.commands.send(command).map_err(|_| ())
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

/// One endpoint of the protocol, bound to a single duplex byte stream.
///
/// Symmetric: either side may initiate correspondences. The transport
/// contract is any `AsyncRead + AsyncWrite` pair; end of stream is the
/// closed signal. The peer never closes the stream itself, it only stops
/// using it; whoever created the stream owns its release.
pub struct Peer {
    shared: Arc<PeerShared>,
    events: Mutex<mpsc::Receiver<PeerEvent>>,
}

impl Peer {
    /// Bind a stream with default configuration.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(stream, PeerConfig::default())
    }

    /// Bind a stream. Spawns the driver task that owns it.
    pub fn with_config<S>(stream: S, config: PeerConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let shared = Arc::new(PeerShared {
            id: ulid::Ulid::new().to_string(),
            commands: commands_tx,
            disconnected: AtomicBool::new(false),
            cancel: config.cancel,
        });

        let driver = Driver::new(
            FramedStream::new(stream),
            Arc::clone(&shared),
            commands_rx,
            events_tx,
            config.read_buffer,
        );
        tokio::spawn(driver.run());

        Self {
            shared,
            events: Mutex::new(events_rx),
        }
    }

    /// Opaque peer id, for logging.
    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.is_disconnected()
    }

    /// Initiate a correspondence by sending one frame.
    ///
    /// A generated id is filled in when `header.correspondence_id` is empty.
    /// The returned correspondence is registered before this resolves, so
    /// the remote's response frames cannot race past it.
    pub async fn send(&self, message: Message) -> Result<Arc<Correspondence>, PeerError> {
        self.request(|reply| Command::Initiate { message, reply }).await
    }

    /// Create a correspondence without sending a frame. The remote side
    /// learns about it from whatever frame local code writes first.
    pub async fn correspond(&self, header: Header) -> Result<Arc<Correspondence>, PeerError> {
        self.request(|reply| Command::Open { header, reply }).await
    }

    async fn request<F>(&self, command: F) -> Result<Arc<Correspondence>, PeerError>
    where
        F: FnOnce(oneshot::Sender<Result<Arc<Correspondence>, PeerError>>) -> Command,
    {
        if self.shared.is_disconnected() {
            return Err(PeerError::Disconnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .send(command(reply_tx))
            .map_err(|_| PeerError::Disconnected)?;
        reply_rx.await.map_err(|_| PeerError::Disconnected)?
    }

    /// Wait for the next remote-initiated correspondence.
    ///
    /// Protocol errors observed while waiting are logged and skipped; a
    /// disconnect resolves with [`PeerError::Disconnected`].
    pub async fn receive(&self) -> Result<Arc<Correspondence>, PeerError> {
        let mut events = self.events.lock().await;
        loop {
            match events.recv().await {
                Some(PeerEvent::Correspondence(correspondence)) => return Ok(correspondence),
                Some(PeerEvent::Error(error)) => {
                    tracing::debug!(peer = %self.shared.id, %error, "protocol error while awaiting correspondence");
                }
                Some(PeerEvent::Disconnect) | None => return Err(PeerError::Disconnected),
            }
        }
    }

    /// The peer's event stream: new correspondences, protocol errors, and
    /// the final disconnect. `None` after disconnect.
    pub async fn next_event(&self) -> Option<PeerEvent> {
        self.events.lock().await.recv().await
    }

    /// Stop using the stream.
    ///
    /// Every live correspondence is marked unreadable and unwritable,
    /// pending waiters fail with a disconnected error, and a final
    /// [`PeerEvent::Disconnect`] is emitted. Idempotent. The underlying
    /// stream is not closed here.
    pub fn disconnect(&self) {
        self.shared.mark_disconnected();
        let _ = self.shared.send(Command::Disconnect);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.shared.id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
