//! End-to-end protocol scenarios, driven over in-memory duplex streams with
//! a raw framed stream standing in for the remote peer.

use std::sync::Arc;

use serde_json::json;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use missive_server::{
    Correspondence, Fault, Header, Message, MessageKind, Server, ServerError, ServerEvent,
};
use missive_wire::FramedStream;

async fn attach(server: &Server) -> FramedStream<DuplexStream> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (local, remote) = tokio::io::duplex(16 * 1024);
    server.connect(local).await;
    FramedStream::new(remote)
}

/// Drain server events until one matches, failing on disconnect.
async fn wait_for_error(events: &mut mpsc::Receiver<ServerEvent>) -> ServerError {
    loop {
        match events.recv().await.expect("event stream ended") {
            ServerEvent::Error(error) => return error,
            ServerEvent::Connect(_) => {}
            ServerEvent::Disconnect(_) => panic!("peer disconnected while awaiting an error event"),
        }
    }
}

#[tokio::test]
async fn echo_request_response() {
    let server = Server::new();
    server.handle("echo", |corr: Arc<Correspondence>| async move {
        let request = corr.next().await?;
        corr.finish(request.into_item()).await?;
        Ok(())
    });

    let mut wire = attach(&server).await;
    wire.send(&Message::data(Header::with_id("c1", "echo"), json!("ping")))
        .await
        .unwrap();

    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(
        frame,
        Message::finish(Header::with_id("c1", "echo"), Some(json!("ping")))
    );
}

#[tokio::test]
async fn streamed_response_preserves_write_order() {
    let server = Server::new();
    server.handle("stream", |corr: Arc<Correspondence>| async move {
        corr.write(json!("a")).await?;
        corr.write(json!("b")).await?;
        corr.finish(Some(json!("c"))).await?;
        Ok(())
    });

    let mut wire = attach(&server).await;
    wire.send(&Message::initiate(Header::with_id("c2", "stream"), None))
        .await
        .unwrap();

    let expected = [
        (Some(MessageKind::Data), json!("a")),
        (Some(MessageKind::Data), json!("b")),
        (Some(MessageKind::Finish), json!("c")),
    ];
    for (kind, body) in expected {
        let frame = wire.recv().await.unwrap().unwrap();
        assert_eq!(frame.header.correspondence_id, "c2");
        assert_eq!(frame.kind, kind);
        assert_eq!(frame.body, Some(body));
    }
}

#[tokio::test]
async fn unknown_subject_gets_the_builtin_rejection() {
    let server = Server::new();
    let mut wire = attach(&server).await;

    wire.send(&Message::data(Header::with_id("c9", "nope"), json!(null)))
        .await
        .unwrap();

    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(frame.kind, Some(MessageKind::Error));
    let error = frame.error.unwrap();
    assert_eq!(error.kind, "UnknownSubject");
    assert_eq!(error.message, "Unknown subject: nope");
}

#[tokio::test]
async fn thrown_fault_reaches_the_remote_via_the_default_exception_handler() {
    let server = Server::new();
    server.handle("boom", |_corr: Arc<Correspondence>| async move {
        Err(Fault::new("K", "m"))
    });

    let mut wire = attach(&server).await;
    wire.send(&Message::data(Header::with_id("c1", "boom"), json!(null)))
        .await
        .unwrap();

    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(frame.kind, Some(MessageKind::Error));
    let error = frame.error.unwrap();
    assert_eq!(error.kind, "K");
    assert_eq!(error.message, "m");
}

#[tokio::test]
async fn unfinished_handler_raises_a_server_error_and_sends_nothing() {
    let server = Server::new();
    let mut events = server.events().unwrap();
    server.handle("lazy", |_corr: Arc<Correspondence>| async move { Ok(()) });
    server.handle("echo", |corr: Arc<Correspondence>| async move {
        let request = corr.next().await?;
        corr.finish(request.into_item()).await?;
        Ok(())
    });

    let mut wire = attach(&server).await;
    wire.send(&Message::data(Header::with_id("c5", "lazy"), json!(1)))
        .await
        .unwrap();

    match wait_for_error(&mut events).await {
        ServerError::UnfinishedCorrespondence(corr) => {
            assert_eq!(corr.id(), "c5");
            assert!(corr.writable());
        }
        other => panic!("expected unfinished correspondence, got {other}"),
    }

    // No frame was forced on the lazy correspondence: the next thing on the
    // wire is the echo response.
    wire.send(&Message::data(Header::with_id("c6", "echo"), json!("x")))
        .await
        .unwrap();
    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(frame.header.correspondence_id, "c6");
    assert_eq!(frame.kind, Some(MessageKind::Finish));
}

#[tokio::test]
async fn invalid_json_line_surfaces_as_a_streaming_error() {
    let server = Server::new();
    let mut events = server.events().unwrap();
    server.handle("echo", |corr: Arc<Correspondence>| async move {
        let request = corr.next().await?;
        corr.finish(request.into_item()).await?;
        Ok(())
    });

    let mut wire = attach(&server).await;
    use tokio::io::AsyncWriteExt;
    wire.stream_mut().write_all(b"{\"header\":{\n").await.unwrap();

    match wait_for_error(&mut events).await {
        ServerError::Peer(missive_server::PeerError::Streaming { .. }) => {}
        other => panic!("expected streaming error, got {other}"),
    }

    // Whole frames after the bad line are still processed.
    wire.send(&Message::data(Header::with_id("c1", "echo"), json!("ok")))
        .await
        .unwrap();
    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(frame.body, Some(json!("ok")));
}

#[tokio::test]
async fn terminated_id_is_reusable_without_redelivery() {
    let server = Server::new();
    server.handle("drain", |corr: Arc<Correspondence>| async move {
        let chunks = corr.all().collect().await?;
        corr.finish(Some(json!(chunks))).await?;
        Ok(())
    });

    let mut wire = attach(&server).await;
    wire.send(&Message::data(Header::with_id("c3", "drain"), json!("x")))
        .await
        .unwrap();
    wire.send(&Message::finish(Header::with_id("c3", "drain"), None))
        .await
        .unwrap();

    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(frame.kind, Some(MessageKind::Finish));
    assert_eq!(frame.body, Some(json!(["x"])));

    // Both halves are now closed and the record released; the same id
    // starts a brand-new correspondence served by a fresh handler run.
    wire.send(&Message::data(Header::with_id("c3", "drain"), json!("y")))
        .await
        .unwrap();
    wire.send(&Message::finish(Header::with_id("c3", "drain"), None))
        .await
        .unwrap();

    let frame = wire.recv().await.unwrap().unwrap();
    assert_eq!(frame.header.correspondence_id, "c3");
    assert_eq!(frame.body, Some(json!(["y"])));
}
