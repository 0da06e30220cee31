//! Session routines behind the subcommands: echo, ping, the verification
//! harness and the in-process benchmark.

use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use shmem_core::{ConnectionOptions, Error};
use shmem_transport::{Connection, accept, connect};

use crate::progress::FrameProgress;

/// Frames exchanged by the verification harness
pub const HARNESS_FRAMES: usize = 256;

/// Size of each harness frame
pub const HARNESS_FRAME_SIZE: usize = 1024;

/// Harness frame `index`: every byte equals the index
#[must_use]
pub fn harness_frame(index: usize) -> Vec<u8> {
    vec![(index % 256) as u8; HARNESS_FRAME_SIZE]
}

/// Echo every message until the peer closes. Returns the number echoed.
///
/// # Errors
///
/// Returns any error other than the peer's orderly close.
pub async fn echo_session(conn: &Connection) -> anyhow::Result<u64> {
    let mut echoed = 0;
    loop {
        let message = match conn.receive().await {
            Ok(message) => message,
            Err(Error::Closed) => break,
            Err(e) => return Err(e.into()),
        };
        match conn.send(&message).await {
            Ok(()) => echoed += 1,
            Err(Error::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }
    conn.close().await?;
    Ok(echoed)
}

/// Backend half of the harness: receive and verify every frame, then echo
/// them back in order.
///
/// # Errors
///
/// Fails on the first mismatching frame or transport error.
pub async fn verify_backend(conn: &Connection) -> anyhow::Result<()> {
    let mut received = Vec::with_capacity(HARNESS_FRAMES);
    for i in 0..HARNESS_FRAMES {
        let frame = conn
            .receive()
            .await
            .with_context(|| format!("receiving frame {i}"))?;
        if frame != harness_frame(i) {
            bail!("frame {i} does not match ({} bytes received)", frame.len());
        }
        received.push(frame);
    }
    for (i, frame) in received.iter().enumerate() {
        conn.send(frame)
            .await
            .with_context(|| format!("echoing frame {i}"))?;
    }
    Ok(())
}

/// Client half of the harness: send every frame, then read and verify the
/// echoes.
///
/// # Errors
///
/// Fails on the first mismatching echo or transport error.
pub async fn verify_client(conn: &Connection) -> anyhow::Result<()> {
    for i in 0..HARNESS_FRAMES {
        conn.send(&harness_frame(i))
            .await
            .with_context(|| format!("sending frame {i}"))?;
    }
    for i in 0..HARNESS_FRAMES {
        let echo = conn
            .receive()
            .await
            .with_context(|| format!("receiving echo {i}"))?;
        if echo != harness_frame(i) {
            bail!("echo {i} does not match ({} bytes received)", echo.len());
        }
    }
    Ok(())
}

/// Send `count` messages of `size` bytes and time each echo.
///
/// # Errors
///
/// Fails on transport errors or a corrupted echo.
pub async fn ping(conn: &Connection, count: usize, size: usize) -> anyhow::Result<Vec<Duration>> {
    let mut rtts = Vec::with_capacity(count);
    for seq in 0..count {
        let payload = vec![(seq % 251) as u8; size];
        let start = Instant::now();
        conn.send(&payload).await?;
        let echo = conn.receive().await?;
        rtts.push(start.elapsed());
        if echo != payload {
            bail!("echo {seq} corrupted");
        }
    }
    Ok(rtts)
}

/// Result of an in-process benchmark
#[derive(Debug, Clone)]
pub struct BenchReport {
    /// Messages moved
    pub frames: u64,
    /// Payload bytes moved
    pub bytes: u64,
    /// Wall time from first send to last receive
    pub elapsed: Duration,
    /// Messages that went over the ring compressed
    pub compressed: u64,
}

/// Push `frames` messages of `size` bytes through channel `name` inside
/// this process, one task per side.
///
/// # Errors
///
/// Fails if the session cannot be set up or a transfer fails.
pub async fn bench(
    name: &str,
    options: ConnectionOptions,
    frames: u64,
    size: usize,
    progress: &FrameProgress,
) -> anyhow::Result<BenchReport> {
    let (server, client) = tokio::join!(accept(name, options.clone()), connect(name, options));
    let (server, client) = (server?, client?);

    let payload: Vec<u8> = (0..size).map(|i| (i % 64) as u8).collect();
    let start = Instant::now();

    let send_all = async {
        for _ in 0..frames {
            client.send(&payload).await?;
        }
        anyhow::Ok(())
    };
    let receive_all = async {
        let mut bytes = 0u64;
        for _ in 0..frames {
            bytes += server.receive().await?.len() as u64;
            progress.inc(1);
        }
        anyhow::Ok(bytes)
    };
    let (sent, received) = tokio::join!(send_all, receive_all);
    sent?;
    let bytes = received?;
    let elapsed = start.elapsed();
    let compressed = server.stats().compressed_frames_received;

    client.close().await?;
    server.close().await?;

    Ok(BenchReport {
        frames,
        bytes,
        elapsed,
        compressed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &std::path::Path) -> ConnectionOptions {
        ConnectionOptions::default()
            .with_capacity(64 * 1024)
            .with_liveness(Duration::from_millis(20), Duration::from_millis(1000))
            .with_shm_dir(dir)
    }

    #[test]
    fn test_harness_frame() {
        assert_eq!(harness_frame(0), vec![0; 1024]);
        assert_eq!(harness_frame(255), vec![255; 1024]);
        assert_eq!(harness_frame(256), vec![0; 1024]);
    }

    #[tokio::test]
    async fn test_verify_pair() {
        let dir = TempDir::new().unwrap();
        let (server, client) = tokio::join!(
            accept("harness", options(dir.path())),
            connect("harness", options(dir.path()))
        );
        let (server, client) = (server.unwrap(), client.unwrap());

        let (backend, frontend) = tokio::join!(verify_backend(&server), verify_client(&client));
        backend.unwrap();
        frontend.unwrap();
    }

    #[tokio::test]
    async fn test_verify_backend_rejects_bad_frame() {
        let dir = TempDir::new().unwrap();
        let (server, client) = tokio::join!(
            accept("harness-bad", options(dir.path())),
            connect("harness-bad", options(dir.path()))
        );
        let (server, client) = (server.unwrap(), client.unwrap());

        client.send(&harness_frame(1)).await.unwrap();
        let err = verify_backend(&server).await.unwrap_err();
        assert!(err.to_string().contains("frame 0"));
    }

    #[tokio::test]
    async fn test_echo_and_ping() {
        let dir = TempDir::new().unwrap();
        let (server, client) = tokio::join!(
            accept("echo", options(dir.path())),
            connect("echo", options(dir.path()))
        );
        let (server, client) = (server.unwrap(), client.unwrap());

        let pinger = async {
            let rtts = ping(&client, 5, 100).await.unwrap();
            client.close().await.unwrap();
            rtts
        };
        let (echoed, rtts) = tokio::join!(echo_session(&server), pinger);
        assert_eq!(echoed.unwrap(), 5);
        assert_eq!(rtts.len(), 5);
    }

    #[tokio::test]
    async fn test_bench_moves_everything() {
        let dir = TempDir::new().unwrap();
        let progress = FrameProgress::hidden();
        let report = bench("bench", options(dir.path()), 200, 512, &progress)
            .await
            .unwrap();
        assert_eq!(report.frames, 200);
        assert_eq!(report.bytes, 200 * 512);
        assert_eq!(progress.position(), 200);
    }
}
