//! Per-connection read and write tasks.
//!
//! Every accepted stream is registered, greeted, split into halves, and
//! handed to two tasks:
//!
//! - **read loop** – accumulates bytes in a [`FrameBuffer`] and passes each
//!   complete message to [`BroadcastRouter::on_message`].
//! - **write loop** – drains the connection's outbound queue onto the socket.
//!
//! Both tasks watch the registry's close signal, so a disconnect issued from
//! anywhere (router, HTTP handler, the other task) stops them promptly.
//!
//! The loops are generic over `AsyncRead` / `AsyncWrite` so they run the same
//! on a `TcpStream`, an in-memory duplex pipe, or a scripted mock.

use std::net::SocketAddr;
use std::sync::Arc;

use bus_core::FrameBuffer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::application::registry::{ConnectionId, DisconnectReason, OutboundQueue, Registration};
use crate::application::router::BroadcastRouter;

const READ_CHUNK: usize = 4096;

// ── Public API ────────────────────────────────────────────────────────────────

/// Registers `stream`, queues the `HELLO` greeting, and spawns its tasks.
///
/// Must be called from within a tokio runtime.
pub fn accept<S>(stream: S, peer: SocketAddr, router: Arc<BroadcastRouter>) -> ConnectionId
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Registration {
        id,
        outbound,
        closed,
    } = router.registry().register(peer);

    // Queued before the writer starts, so it is always the first frame out.
    if let Err(e) = router.on_connect(id) {
        warn!(id, %peer, error = %e, "could not greet new connection");
    }

    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_loop(
        id,
        writer,
        outbound,
        closed.clone(),
        Arc::clone(&router),
    ));
    tokio::spawn(read_loop(id, reader, closed, router));
    id
}

/// Reads frames from `reader` until EOF, a read error, a protocol error, or
/// the close signal.  Always leaves `id` disconnected.
pub async fn read_loop<R>(
    id: ConnectionId,
    mut reader: R,
    mut closed: watch::Receiver<bool>,
    router: Arc<BroadcastRouter>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_frame_len(router.max_frame_len());
    let mut read_tmp = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            biased;
            _ = closed.changed() => {
                debug!(id, "reader stopped by close signal");
                return;
            }
            read = reader.read(&mut read_tmp) => read,
        };

        let n = match read {
            Ok(0) => {
                router.disconnect(id, DisconnectReason::PeerClosed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                router.disconnect(id, DisconnectReason::ReadFailed(e.to_string()));
                return;
            }
        };
        frames.extend(&read_tmp[..n]);

        loop {
            match frames.next_message() {
                Ok(Some(msg)) => {
                    if let Err(e) = router.on_message(id, msg) {
                        router.disconnect(id, e.disconnect_reason());
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    router.disconnect(id, DisconnectReason::Protocol(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// Writes queued frames to `writer` until the close signal or a write error.
pub async fn write_loop<W>(
    id: ConnectionId,
    mut writer: W,
    mut outbound: OutboundQueue,
    mut closed: watch::Receiver<bool>,
    router: Arc<BroadcastRouter>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.changed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // A peer that stops reading can park `write_all` forever; the close
        // signal (e.g. slow-consumer eviction) must still get through.
        let written = tokio::select! {
            biased;
            _ = closed.changed() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            router.disconnect(id, DisconnectReason::WriteFailed(e.to_string()));
            return;
        }
        outbound.complete(frame.len());
    }

    if let Err(e) = writer.shutdown().await {
        debug!(id, error = %e, "shutdown after close failed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bus_core::{decode_message, encode_message, Message};
    use tokio::io::duplex;
    use tokio::time::timeout;
    use tokio_test::io::Builder;

    use super::*;
    use crate::application::notifier::MockNotifier;
    use crate::application::registry::ConnectionRegistry;

    fn router() -> Arc<BroadcastRouter> {
        let registry = Arc::new(ConnectionRegistry::new(64 * 1024));
        Arc::new(BroadcastRouter::new(
            registry,
            Arc::new(MockNotifier::new()),
            bus_core::DEFAULT_MAX_FRAME_LEN,
        ))
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, frames: &mut FrameBuffer) -> Message {
        let mut tmp = [0u8; 256];
        loop {
            if let Some(msg) = frames.next_message().expect("valid frame") {
                return msg;
            }
            let n = timeout(Duration::from_secs(2), reader.read(&mut tmp))
                .await
                .expect("timed out waiting for a frame")
                .expect("read failed");
            assert!(n > 0, "stream closed before a frame arrived");
            frames.extend(&tmp[..n]);
        }
    }

    #[tokio::test]
    async fn test_read_loop_relays_frame_split_across_reads() {
        // Arrange: the source frame arrives in two pieces, then EOF
        let router = router();
        let mut listener = router.registry().register(peer());
        let source = router.registry().register(peer());
        let msg = Message::new("busMsg").with_arg("k", "v");
        let bytes = encode_message(&msg).unwrap();
        let mock = Builder::new().read(&bytes[..7]).read(&bytes[7..]).build();

        // Act
        read_loop(source.id, mock, source.closed.clone(), Arc::clone(&router)).await;

        // Assert
        let frame = listener.outbound.try_recv().expect("listener should get the relay");
        assert_eq!(decode_message(&frame).unwrap().0, msg);
        assert!(!router.registry().contains(source.id), "EOF must deregister");
        assert!(router.registry().contains(listener.id));
    }

    #[tokio::test]
    async fn test_read_loop_malformed_frame_closes_only_that_connection() {
        // Arrange
        let router = router();
        let bystander = router.registry().register(peer());
        let bad = router.registry().register(peer());
        let mock = Builder::new().read(&3u32.to_be_bytes()).build();

        // Act
        read_loop(bad.id, mock, bad.closed.clone(), Arc::clone(&router)).await;

        // Assert
        assert!(!router.registry().contains(bad.id));
        assert!(router.registry().contains(bystander.id));
        assert!(!*bystander.closed.borrow());
    }

    #[tokio::test]
    async fn test_read_loop_oversized_prefix_closes_before_body() {
        let router = router();
        let conn = router.registry().register(peer());
        let prefix = (bus_core::DEFAULT_MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mock = Builder::new().read(&prefix).build();

        read_loop(conn.id, mock, conn.closed.clone(), Arc::clone(&router)).await;

        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_read_loop_duplicate_hello_disconnects() {
        let router = router();
        let conn = router.registry().register(peer());
        let mut wire = encode_message(&Message::new("HELLO")).unwrap();
        wire.extend_from_slice(&encode_message(&Message::new("HELLO")).unwrap());
        let mock = Builder::new().read(&wire).build();

        read_loop(conn.id, mock, conn.closed.clone(), Arc::clone(&router)).await;

        assert!(!router.registry().contains(conn.id));
    }

    #[tokio::test]
    async fn test_accept_greets_then_relays_between_streams() {
        // Arrange: two in-memory clients
        let router = router();
        let (a_server, mut a_client) = duplex(4096);
        let (b_server, mut b_client) = duplex(4096);
        let a_id = accept(a_server, peer(), Arc::clone(&router));
        let b_id = accept(b_server, peer(), Arc::clone(&router));
        let mut a_frames = FrameBuffer::new();
        let mut b_frames = FrameBuffer::new();

        // Assert: each receives its own id first
        let hello_a = read_message(&mut a_client, &mut a_frames).await;
        assert_eq!(hello_a.arg("yourID"), Some(a_id.to_string().as_str()));
        let hello_b = read_message(&mut b_client, &mut b_frames).await;
        assert_eq!(hello_b.arg("yourID"), Some(b_id.to_string().as_str()));

        // Act: A talks, B hears it
        let msg = Message::new("busMsg").with_arg("text", "hi");
        a_client.write_all(&encode_message(&msg).unwrap()).await.unwrap();

        // Assert
        assert_eq!(read_message(&mut b_client, &mut b_frames).await, msg);
    }

    #[tokio::test]
    async fn test_disconnect_closes_the_stream() {
        // Arrange
        let router = router();
        let (server, mut client) = duplex(4096);
        let id = accept(server, peer(), Arc::clone(&router));
        let mut frames = FrameBuffer::new();
        read_message(&mut client, &mut frames).await;

        // Act
        router.disconnect(id, DisconnectReason::Shutdown);

        // Assert: the client side sees EOF once both tasks have exited
        let mut tmp = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut tmp))
            .await
            .expect("stream should close")
            .expect("read failed");
        assert_eq!(n, 0);
    }
}
