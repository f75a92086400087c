//! The server: peers in, correspondences out to subject handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use missive_peer::{Correspondence, Peer, PeerConfig, PeerError, PeerEvent};
use missive_wire::MessageError;

use crate::fault::Fault;
use crate::handler::{DefaultExceptionHandler, ExceptionHandler, Handler, UnknownSubjectHandler};
use crate::view::WritableCorrespondence;

/// Events a server surfaces to embedding code.
#[derive(Debug)]
pub enum ServerEvent {
    /// A stream was connected and is now served by this peer.
    Connect(Arc<Peer>),
    /// The peer disconnected and was released.
    Disconnect(Arc<Peer>),
    Error(ServerError),
}

/// Errors surfaced as server events.
#[derive(Debug)]
pub enum ServerError {
    /// A handler returned while its correspondence was still writable.
    /// Handlers must terminate the correspondences they own; the server does
    /// not finish on their behalf.
    UnfinishedCorrespondence(Arc<Correspondence>),
    /// A protocol or transport error on one of the hosted peers.
    Peer(PeerError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::UnfinishedCorrespondence(correspondence) => {
                write!(f, "correspondence unfinished: {}", correspondence.id())
            }
            ServerError::Peer(e) => write!(f, "peer error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cancelling this token shuts down dispatch and every hosted peer.
    pub cancel: CancellationToken,
    /// Server event buffer.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            event_buffer: 1024,
        }
    }
}

struct ServerState {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    default_handler: RwLock<Arc<dyn Handler>>,
    /// Head is the most recently registered handler; the built-in default
    /// sits permanently at the tail.
    exception_chain: RwLock<Vec<Arc<dyn ExceptionHandler>>>,
    peers: StdMutex<HashMap<String, Arc<Peer>>>,
    events_tx: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
}

/// Hosts peers and routes their inbound correspondences by subject.
///
/// Registration (`handle`, `default_handler`, `handle_exception`) is meant
/// for setup time; dispatch reads the maps concurrently through read-mostly
/// locks.
pub struct Server {
    state: Arc<ServerState>,
    events_rx: StdMutex<Option<mpsc::Receiver<ServerEvent>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        Self {
            state: Arc::new(ServerState {
                handlers: RwLock::new(HashMap::new()),
                default_handler: RwLock::new(Arc::new(UnknownSubjectHandler)),
                exception_chain: RwLock::new(vec![Arc::new(DefaultExceptionHandler)]),
                peers: StdMutex::new(HashMap::new()),
                events_tx,
                cancel: config.cancel,
            }),
            events_rx: StdMutex::new(Some(events_rx)),
        }
    }

    /// Register the handler for a subject. One handler per subject: a
    /// duplicate registration logs a warning and replaces the previous one.
    pub fn handle(&self, subject: impl Into<String>, handler: impl Handler) -> &Self {
        let subject = subject.into();
        let previous = self
            .state
            .handlers
            .write()
            .expect("handler map lock poisoned")
            .insert(subject.clone(), Arc::new(handler));
        if previous.is_some() {
            warn!(%subject, "replacing previously registered handler");
        }
        self
    }

    /// Replace the built-in unknown-subject responder.
    pub fn default_handler(&self, handler: impl Handler) -> &Self {
        *self
            .state
            .default_handler
            .write()
            .expect("default handler lock poisoned") = Arc::new(handler);
        self
    }

    /// Prepend an exception handler: the most recently registered one runs
    /// first. The built-in default stays pinned at the tail.
    pub fn handle_exception(&self, handler: impl ExceptionHandler) -> &Self {
        self.state
            .exception_chain
            .write()
            .expect("exception chain lock poisoned")
            .insert(0, Arc::new(handler));
        self
    }

    /// Apply a bundle of registrations.
    pub fn configure(&self, configure: impl FnOnce(&Self)) -> &Self {
        configure(self);
        self
    }

    /// Bind a stream: construct a peer for it, serve its correspondences,
    /// and surface its errors as server events.
    pub async fn connect<S>(&self, stream: S) -> Arc<Peer>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = Arc::new(Peer::with_config(
            stream,
            PeerConfig {
                cancel: self.state.cancel.child_token(),
                ..PeerConfig::default()
            },
        ));
        self.state
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .insert(peer.id().to_string(), Arc::clone(&peer));
        debug!(peer = %peer.id(), "peer connected");
        let _ = self
            .state
            .events_tx
            .send(ServerEvent::Connect(Arc::clone(&peer)))
            .await;

        spawn_peer_loop(Arc::clone(&self.state), Arc::clone(&peer));
        peer
    }

    /// Disconnect the peer with this id. Returns false if it is not hosted
    /// here (anymore).
    pub fn disconnect(&self, peer_id: &str) -> bool {
        let peer = self
            .state
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .get(peer_id)
            .cloned();
        match peer {
            Some(peer) => {
                peer.disconnect();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the live peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Take the server event stream. Yields `connect`, `disconnect`, and
    /// `error` events; can be taken once.
    pub fn events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take()
    }

    /// Disconnect every hosted peer and stop dispatching.
    pub fn shutdown(&self) {
        self.state.cancel.cancel();
        let peers: Vec<Arc<Peer>> = self
            .state
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.disconnect();
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

/// Drain one peer's events for as long as it lives.
fn spawn_peer_loop(state: Arc<ServerState>, peer: Arc<Peer>) {
    tokio::spawn(async move {
        loop {
            match peer.next_event().await {
                Some(PeerEvent::Correspondence(correspondence)) => {
                    spawn_dispatch(Arc::clone(&state), correspondence);
                }
                Some(PeerEvent::Error(error)) => {
                    let _ = state
                        .events_tx
                        .send(ServerEvent::Error(ServerError::Peer(error)))
                        .await;
                }
                Some(PeerEvent::Disconnect) | None => {
                    state
                        .peers
                        .lock()
                        .expect("peer map lock poisoned")
                        .remove(peer.id());
                    debug!(peer = %peer.id(), "peer released");
                    let _ = state
                        .events_tx
                        .send(ServerEvent::Disconnect(Arc::clone(&peer)))
                        .await;
                    break;
                }
            }
        }
    });
}

/// Run the subject handler for one new correspondence, then enforce the
/// termination contract.
fn spawn_dispatch(state: Arc<ServerState>, correspondence: Arc<Correspondence>) {
    tokio::spawn(async move {
        let subject = correspondence.subject();
        let handler = {
            let handlers = state.handlers.read().expect("handler map lock poisoned");
            handlers.get(&subject).cloned()
        }
        .unwrap_or_else(|| {
            Arc::clone(
                &state
                    .default_handler
                    .read()
                    .expect("default handler lock poisoned"),
            )
        });

        debug!(correspondence_id = %correspondence.id(), %subject, "dispatching");

        // The handler runs as its own task so a panic is contained and can
        // join the exception pipeline like any other failure.
        let outcome = match tokio::spawn(handler.call(Arc::clone(&correspondence))).await {
            Ok(outcome) => outcome,
            Err(join_error) if join_error.is_panic() => {
                warn!(correspondence_id = %correspondence.id(), %subject, "handler panicked");
                Err(Fault::new("GenericError", "handler panicked"))
            }
            Err(_) => Err(Fault::new("GenericError", "handler was cancelled")),
        };

        if let Err(fault) = outcome {
            run_exception_pipeline(&state, &correspondence, fault).await;
        }

        if correspondence.writable() {
            warn!(correspondence_id = %correspondence.id(), %subject, "handler returned without terminating the correspondence");
            let _ = state
                .events_tx
                .send(ServerEvent::Error(ServerError::UnfinishedCorrespondence(
                    correspondence,
                )))
                .await;
        }
    });
}

/// Walk the exception chain head to tail, stopping once the correspondence
/// becomes unwritable.
async fn run_exception_pipeline(
    state: &Arc<ServerState>,
    correspondence: &Arc<Correspondence>,
    fault: Fault,
) {
    debug!(correspondence_id = %correspondence.id(), %fault, "running exception pipeline");
    let chain: Vec<Arc<dyn ExceptionHandler>> = state
        .exception_chain
        .read()
        .expect("exception chain lock poisoned")
        .clone();

    for handler in chain {
        if !correspondence.writable() {
            return;
        }
        let view = WritableCorrespondence::new(Arc::clone(correspondence));
        if let Err(secondary) = handler.call(view, fault.clone()).await {
            warn!(correspondence_id = %correspondence.id(), fault = %secondary, "exception handler failed");
            let _ = correspondence
                .error(MessageError::new(
                    "GenericError",
                    "Failed processing correspondence",
                ))
                .await;
            return;
        }
    }
}
