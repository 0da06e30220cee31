//! Integration tests across the segment, ring, codec and tokio bridge.
//!
//! Every test uses its own temporary segment directory, so the suite runs
//! in parallel without name clashes.

use std::time::Duration;

use rand::Rng;
use shmem_core::{Error, ErrorKind, Segment, SessionState};
use shmem_integration_tests::{ci_timeout, numbered_payload, pair, payload_number, small_options};
use shmem_transport::{LinkStatus, Listener, Transport, accept, connect};
use tempfile::TempDir;

// ============================================================================
// Data Path
// ============================================================================

#[tokio::test]
async fn test_ping_pong_on_chan1() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("chan1", options.clone(), options).await.unwrap();

    client.send(b"ping").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"ping");
    server.send(b"pong").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"pong");

    assert_eq!(server.state(), SessionState::Established);
    assert_eq!(client.stats().frames_sent, 1);
    assert_eq!(client.stats().frames_received, 1);

    client.close().await.unwrap();
    server.close().await.unwrap();
    assert!(!dir.path().join("chan1").exists());
}

#[tokio::test]
async fn test_ten_thousand_frames_arrive_in_order() {
    const FRAMES: u64 = 10_000;

    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("ordered", options.clone(), options).await.unwrap();

    let mut rng = rand::thread_rng();
    let sizes: Vec<usize> = (0..FRAMES).map(|_| rng.gen_range(8..=1024)).collect();

    let sender = async {
        for (n, &len) in sizes.iter().enumerate() {
            client.send(&numbered_payload(n as u64, len)).await.unwrap();
        }
    };
    let receiver = async {
        let mut bytes = 0usize;
        for (n, &len) in sizes.iter().enumerate() {
            let message = server.receive().await.unwrap();
            assert_eq!(payload_number(&message), n as u64);
            assert_eq!(message.len(), len);
            bytes += message.len();
        }
        bytes
    };
    let ((), bytes) = tokio::join!(sender, receiver);

    let stats = server.stats();
    assert_eq!(stats.frames_received, FRAMES);
    assert_eq!(stats.bytes_received, bytes as u64);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_and_max_size_messages() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("edges", options.clone(), options).await.unwrap();

    client.send(&[]).await.unwrap();
    client.send(&[0x5A; 1024]).await.unwrap();
    assert!(server.receive().await.unwrap().is_empty());
    assert_eq!(server.receive().await.unwrap(), vec![0x5A; 1024]);

    let err = client.send(&[0; 1025]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FrameTooLarge);
    // An oversized send is not fatal.
    assert_eq!(client.state(), SessionState::Established);
}

#[tokio::test]
async fn test_backpressure_blocks_then_resumes() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("full", options.clone(), options).await.unwrap();

    let message = vec![7u8; 1000];
    let mut queued = 0;
    while client.try_send(&message).unwrap() {
        queued += 1;
    }
    assert!(queued >= 3, "only {queued} messages fit in a 4 KiB ring");

    // The ring is full: the next send waits.
    let blocked = tokio::time::timeout(Duration::from_millis(100), client.send(&message)).await;
    assert!(blocked.is_err());

    let sender = async {
        tokio::time::timeout(ci_timeout(Duration::from_secs(2)), client.send(&message))
            .await
            .expect("send did not resume after the consumer drained")
            .unwrap();
    };
    let receiver = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.receive().await.unwrap()
    };
    let ((), first) = tokio::join!(sender, receiver);
    assert_eq!(first, message);

    for _ in 0..queued {
        assert_eq!(server.receive().await.unwrap(), message);
    }
    assert!(server.try_receive().unwrap().is_none());
}

#[tokio::test]
async fn test_compression_threshold_boundary() {
    const THRESHOLD: usize = 64;

    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path()).with_compression(true, THRESHOLD);
    let (server, client) = pair("lz4", options.clone(), options).await.unwrap();
    assert!(client.codec().is_enabled());
    assert_eq!(client.codec().threshold(), THRESHOLD);

    let below = vec![b'a'; THRESHOLD - 1];
    client.send(&below).await.unwrap();
    assert_eq!(server.receive().await.unwrap(), below);
    assert_eq!(client.stats().compressed_frames_sent, 0);

    let above = b"shared memory ".repeat(THRESHOLD * 10 / 14 + 1);
    assert!(above.len() >= 10 * THRESHOLD);
    client.send(&above).await.unwrap();
    assert_eq!(server.receive().await.unwrap(), above);
    assert_eq!(client.stats().compressed_frames_sent, 1);
    assert_eq!(server.stats().compressed_frames_received, 1);
    // Accounting is in payload bytes, not wire bytes.
    assert_eq!(server.stats().bytes_received, (below.len() + above.len()) as u64);
}

// ============================================================================
// Naming and Attachment
// ============================================================================

#[tokio::test]
async fn test_second_server_gets_already_exists() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());

    let first = tokio::spawn(accept("taken", options.clone()));
    while !dir.path().join("taken").exists() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Let the creator publish `ready` before racing it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = accept("taken", options.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let client = connect("taken", options).await.unwrap();
    let server = first.await.unwrap().unwrap();
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_second_client_gets_in_use() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("single", options.clone(), options.clone())
        .await
        .unwrap();

    let err = Segment::open("single", dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);

    let impatient = options.with_connect_timeout(Duration::from_millis(50));
    let err = connect("single", impatient).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);

    // The established session is unaffected.
    client.send(b"still here").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"still here");
}

#[tokio::test]
async fn test_client_waits_for_late_server() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());

    let client = tokio::spawn(connect("late", options.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let server = accept("late", options).await.unwrap();
    let client = client.await.unwrap().unwrap();

    server.send(b"hello").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_handshake_mismatch_rejects_both_sides() {
    let dir = TempDir::new().unwrap();
    let server_options = small_options(dir.path());
    let client_options = small_options(dir.path()).with_max_frame_size(512);

    let err = pair("mismatch", server_options.clone(), client_options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);

    // The rejected segment is gone and the name is free again.
    let options = server_options;
    let (server, client) = pair("mismatch", options.clone(), options).await.unwrap();
    client.send(b"retry").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"retry");
}

// ============================================================================
// Shutdown and Failure
// ============================================================================

#[tokio::test]
async fn test_dropped_peer_reads_as_closed() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("dropped", options.clone(), options).await.unwrap();

    client.send(b"last words").await.unwrap();
    drop(client);

    assert_eq!(server.receive().await.unwrap(), b"last words");
    let err = server.receive().await.unwrap_err();
    assert!(matches!(err, Error::Closed));
    assert!(server.send(b"anyone?").await.is_err());
}

#[tokio::test]
async fn test_dead_peer_is_unresponsive() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());

    // The client lives on its own runtime; dropping the runtime stops its
    // heartbeat without running any teardown.
    let client_options = options.clone();
    let client_thread = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let conn = runtime.block_on(connect("doomed", client_options)).unwrap();
        std::mem::forget(conn);
        drop(runtime);
    });

    let server = accept("doomed", options.clone()).await.unwrap();
    client_thread.join().unwrap();

    let started = std::time::Instant::now();
    let err = tokio::time::timeout(ci_timeout(Duration::from_secs(5)), server.receive())
        .await
        .expect("dead peer was never detected")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerUnresponsive);
    let detected = started.elapsed();
    assert!(detected >= options.liveness_timeout / 2);
    assert!(detected <= options.liveness_timeout + ci_timeout(Duration::from_secs(1)));
    assert_eq!(server.link_status(), LinkStatus::PeerUnresponsive);
    assert_eq!(server.state(), SessionState::Error);

    // Fatal errors stick.
    assert_eq!(
        server.send(b"x").await.unwrap_err().kind(),
        ErrorKind::PeerUnresponsive
    );

    server.close().await.unwrap();
    assert!(!dir.path().join("doomed").exists());
}

#[tokio::test]
async fn test_cancel_wakes_pending_receive() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("cancel", options.clone(), options).await.unwrap();

    let canceller = server.canceller();
    let cancel_later = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    };
    let (result, ()) = tokio::join!(server.receive(), cancel_later);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);

    // Cancellation is not fatal.
    assert_eq!(server.state(), SessionState::Established);
    client.send(b"after cancel").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"after cancel");
}

#[tokio::test]
async fn test_receive_timeout_expires() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, _client) = pair("quiet", options.clone(), options).await.unwrap();

    let err = server
        .receive_timeout(Duration::from_millis(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(server.state(), SessionState::Established);
}

#[tokio::test]
async fn test_segment_destroyed_exactly_once() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let layout = options.layout();

    let mut creator = Segment::create("once", layout, dir.path()).unwrap();
    let mut opener = Segment::open("once", dir.path()).unwrap();

    let first = opener.release(true).unwrap();
    let second = creator.release(true).unwrap();
    assert!(!first);
    assert!(second);
    assert!(!dir.path().join("once").exists());

    // Through full sessions: whichever side closes last, the file goes once.
    for client_first in [true, false] {
        let (server, client) = pair("once", options.clone(), options.clone())
            .await
            .unwrap();
        if client_first {
            client.close().await.unwrap();
            server.close().await.unwrap();
        } else {
            server.close().await.unwrap();
            client.close().await.unwrap();
        }
        assert!(!dir.path().join("once").exists());
        assert!(!dir.path().join("once.bell.c").exists());
        assert!(!dir.path().join("once.bell.o").exists());
    }
}

// ============================================================================
// Listener and Transport Trait
// ============================================================================

#[tokio::test]
async fn test_listener_serves_sequential_clients() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let listener = Listener::bind("echo", options.clone()).unwrap();

    let server = async {
        for _ in 0..3 {
            let conn = listener.accept().await.unwrap();
            loop {
                match conn.receive().await {
                    Ok(message) => conn.send(&message).await.unwrap(),
                    Err(Error::Closed) => break,
                    Err(e) => panic!("echo failed: {e}"),
                }
            }
            conn.close().await.unwrap();
        }
    };
    let clients = async {
        for i in 0..3u8 {
            let conn: Box<dyn Transport> = Box::new(connect("echo", options.clone()).await.unwrap());
            conn.send(&[i; 16]).await.unwrap();
            assert_eq!(conn.recv().await.unwrap(), vec![i; 16]);
            assert_eq!(conn.stats().messages_sent, 1);
            conn.close().await.unwrap();
            assert!(conn.is_closed());
        }
    };
    tokio::join!(server, clients);
    assert_eq!(listener.sessions_accepted(), 3);
}

#[tokio::test]
async fn test_inspect_reports_queued_frames() {
    let dir = TempDir::new().unwrap();
    let options = small_options(dir.path());
    let (server, client) = pair("inspect", options.clone(), options).await.unwrap();

    client.send(&[1; 100]).await.unwrap();
    client.send(&[2; 100]).await.unwrap();

    let info = Segment::inspect("inspect", dir.path()).unwrap();
    assert!(info.ready);
    assert!(info.creator_alive);
    assert_eq!(info.attached, 2);
    assert_eq!(info.queued_frames[1], 2);
    assert_eq!(info.queued_frames[0], 0);

    server.receive().await.unwrap();
    let info = Segment::inspect("inspect", dir.path()).unwrap();
    assert_eq!(info.queued_frames[1], 1);
}
