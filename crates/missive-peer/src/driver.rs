//! The peer driver task.
//!
//! One task per peer owns the framed stream and the correspondence map.
//! Everything reaches it through the command queue, which is also what
//! serializes outbound frames: concurrent writers interleave at frame
//! granularity, never mid-JSON.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use missive_wire::{DecodeError, FramedStream, Header, Message, MessageKind, RecvError};

use crate::correspondence::{Correspondence, ReadEvent};
use crate::errors::PeerError;
use crate::peer::{PeerEvent, PeerShared};

/// Requests to the driver from the peer handle and its correspondences.
pub(crate) enum Command {
    /// Register a correspondence and send its initiating frame.
    Initiate {
        message: Message,
        reply: oneshot::Sender<Result<Arc<Correspondence>, PeerError>>,
    },
    /// Register a correspondence without sending anything.
    Open {
        header: Header,
        reply: oneshot::Sender<Result<Arc<Correspondence>, PeerError>>,
    },
    /// Write one frame on an already-registered correspondence.
    Frame { message: Message },
    /// Tear the peer down.
    Disconnect,
}

struct CorrEntry {
    correspondence: Arc<Correspondence>,
    /// `None` once the read side has terminated; the entry then only exists
    /// to keep the id reserved until the write side closes too.
    ingest: Option<mpsc::Sender<ReadEvent>>,
}

#[derive(Debug)]
enum Shutdown {
    Requested,
    StreamClosed,
    StreamFailed,
    Cancelled,
}

pub(crate) struct Driver<S> {
    io: FramedStream<S>,
    shared: Arc<PeerShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<PeerEvent>,
    correspondences: HashMap<String, CorrEntry>,
    read_buffer: usize,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        io: FramedStream<S>,
        shared: Arc<PeerShared>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::Sender<PeerEvent>,
        read_buffer: usize,
    ) -> Self {
        Self {
            io,
            shared,
            commands,
            events,
            correspondences: HashMap::new(),
            read_buffer,
        }
    }

    pub(crate) async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Disconnect) | None => break Shutdown::Requested,
                        Some(command) => {
                            if let Err(error) = self.handle_command(command).await {
                                let _ = self.events.send(PeerEvent::Error(PeerError::Streaming {
                                    detail: error.to_string(),
                                })).await;
                                break Shutdown::StreamFailed;
                            }
                        }
                    }
                }
                frame = self.io.recv() => {
                    match self.handle_frame(frame).await {
                        Ok(()) => {}
                        Err(reason) => break reason,
                    }
                }
                _ = self.shared.cancelled() => break Shutdown::Cancelled,
            }
        };
        self.shutdown(reason).await;
    }

    async fn handle_command(&mut self, command: Command) -> std::io::Result<()> {
        match command {
            Command::Initiate { mut message, reply } => {
                if message.header.correspondence_id.is_empty() {
                    message.header.correspondence_id = ulid::Ulid::new().to_string();
                }
                if let Err(schema) = message.validate() {
                    let _ = reply.send(Err(PeerError::InvalidMessage {
                        detail: schema.to_string(),
                    }));
                    return Ok(());
                }
                let id = message.header.correspondence_id.clone();
                if self.correspondences.contains_key(&id) {
                    let _ = reply.send(Err(PeerError::InvalidMessage {
                        detail: format!("correspondence id already in flight: {id}"),
                    }));
                    return Ok(());
                }

                let correspondence = self.register(message.header.clone());
                // An initiating fin/err is a one-shot: our write half is
                // already done.
                if matches!(message.kind, Some(MessageKind::Finish | MessageKind::Error)) {
                    correspondence.mark_unwritable();
                }
                if let Err(error) = self.io.send(&message).await {
                    let _ = reply.send(Err(PeerError::Disconnected));
                    return Err(error);
                }
                debug!(peer = %self.shared.id(), correspondence_id = %id, subject = %message.header.subject, "correspondence initiated");
                let _ = reply.send(Ok(correspondence));
                Ok(())
            }
            Command::Open { mut header, reply } => {
                if header.correspondence_id.is_empty() {
                    header.correspondence_id = ulid::Ulid::new().to_string();
                }
                if header.subject.is_empty() {
                    let _ = reply.send(Err(PeerError::InvalidMessage {
                        detail: "header.subject is missing or empty".into(),
                    }));
                    return Ok(());
                }
                let id = header.correspondence_id.clone();
                if self.correspondences.contains_key(&id) {
                    let _ = reply.send(Err(PeerError::InvalidMessage {
                        detail: format!("correspondence id already in flight: {id}"),
                    }));
                    return Ok(());
                }
                let correspondence = self.register(header);
                debug!(peer = %self.shared.id(), correspondence_id = %id, "correspondence opened");
                let _ = reply.send(Ok(correspondence));
                Ok(())
            }
            Command::Frame { message } => {
                self.io.send(&message).await?;
                self.evict_if_terminated(&message.header.correspondence_id);
                Ok(())
            }
            Command::Disconnect => Ok(()),
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Result<Option<Message>, RecvError>,
    ) -> Result<(), Shutdown> {
        match frame {
            Ok(Some(message)) => {
                self.dispatch(message).await;
                Ok(())
            }
            Ok(None) => Err(Shutdown::StreamClosed),
            Err(RecvError::Decode(DecodeError::Framing { detail })) => {
                warn!(peer = %self.shared.id(), %detail, "framing error, resynchronizing");
                let _ = self
                    .events
                    .send(PeerEvent::Error(PeerError::Streaming { detail }))
                    .await;
                Ok(())
            }
            Err(RecvError::Decode(DecodeError::Invalid { detail })) => {
                warn!(peer = %self.shared.id(), %detail, "invalid message dropped");
                let _ = self
                    .events
                    .send(PeerEvent::Error(PeerError::InvalidMessage { detail }))
                    .await;
                Ok(())
            }
            Err(RecvError::Io(error)) => {
                let _ = self
                    .events
                    .send(PeerEvent::Error(PeerError::Streaming {
                        detail: error.to_string(),
                    }))
                    .await;
                Err(Shutdown::StreamFailed)
            }
        }
    }

    /// Route one validated inbound frame.
    async fn dispatch(&mut self, message: Message) {
        let id = message.header.correspondence_id.clone();

        if !self.correspondences.contains_key(&id) {
            let correspondence = self.register(message.header.clone());
            // The event goes out before the first frame is ingested, so a
            // subscriber can start reading in time to observe chunk one.
            let _ = self
                .events
                .send(PeerEvent::Correspondence(correspondence))
                .await;
        }

        let Some(entry) = self.correspondences.get(&id) else {
            return;
        };
        let Some(ingest) = entry.ingest.clone() else {
            // Read side already terminated; the id stays reserved until our
            // own write half closes, and late frames go nowhere.
            debug!(peer = %self.shared.id(), correspondence_id = %id, "dropping frame for terminated correspondence");
            return;
        };

        let correspondence = Arc::clone(&entry.correspondence);
        correspondence.set_header(message.header.clone());

        match message.kind_or_data() {
            MessageKind::Data => {
                if let Some(body) = message.body {
                    let _ = ingest
                        .send(ReadEvent::Chunk {
                            body,
                            header: message.header,
                        })
                        .await;
                }
            }
            MessageKind::Finish => {
                correspondence.mark_unreadable();
                if let Some(body) = message.body {
                    let _ = ingest
                        .send(ReadEvent::Chunk {
                            body,
                            header: message.header,
                        })
                        .await;
                }
                let _ = ingest.send(ReadEvent::End).await;
                self.close_read_side(&id);
            }
            MessageKind::Error => {
                correspondence.mark_unreadable();
                if let Some(error) = message.error {
                    let _ = ingest.send(ReadEvent::Error(error)).await;
                }
                self.close_read_side(&id);
            }
        }
    }

    fn register(&mut self, header: Header) -> Arc<Correspondence> {
        let id = header.correspondence_id.clone();
        let (correspondence, ingest) =
            Correspondence::new(header, Arc::clone(&self.shared), self.read_buffer);
        self.correspondences.insert(
            id,
            CorrEntry {
                correspondence: Arc::clone(&correspondence),
                ingest: Some(ingest),
            },
        );
        correspondence
    }

    /// Drop the ingest sender (waking any waiter once the buffer drains) and
    /// release the record if the write half is closed too.
    fn close_read_side(&mut self, id: &str) {
        if let Some(entry) = self.correspondences.get_mut(id) {
            entry.ingest = None;
        }
        self.evict_if_terminated(id);
    }

    fn evict_if_terminated(&mut self, id: &str) {
        let terminated = self
            .correspondences
            .get(id)
            .map(|entry| !entry.correspondence.readable() && !entry.correspondence.writable())
            .unwrap_or(false);
        if terminated {
            self.correspondences.remove(id);
            debug!(peer = %self.shared.id(), correspondence_id = %id, "correspondence released");
        }
    }

    async fn shutdown(mut self, reason: Shutdown) {
        self.shared.mark_disconnected();
        for (_, entry) in self.correspondences.drain() {
            entry.correspondence.mark_unreadable();
            entry.correspondence.mark_unwritable();
            // Dropping the entry drops its ingest sender, failing waiters.
        }
        debug!(peer = %self.shared.id(), ?reason, "peer disconnected");
        let _ = self.events.send(PeerEvent::Disconnect).await;
    }
}
