use std::io;
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::mpsc::Receiver;

use crate::extend::chain_shutdown;
use crate::extend::frame_queue::{FrameReceiver, FrameSender};
use crate::session::Role;

/// Raw datagram path handed to the external engine: it writes wire packets
/// to `outbound` and reads the peer's packets from `inbound`. The adapter
/// pumps both ends against the punched link.
pub struct EngineIo {
    pub outbound: flume::Sender<BytesMut>,
    pub inbound: flume::Receiver<BytesMut>,
}

/// The engine's stream surface once its handshake finished.
pub struct EngineStream {
    /// Application frames for the engine to carry.
    pub frames_out: flume::Sender<BytesMut>,
    /// Frames the engine delivered; closes cleanly when the peer is done.
    pub frames_in: flume::Receiver<BytesMut>,
    /// Fires at most once with an engine-fatal error.
    pub fatal: flume::Receiver<io::Error>,
}

/// Externally supplied modern secure transport. The engine owns its own
/// handshake timeout; the adapter never wraps it in one.
#[async_trait]
pub trait AlternateEngine: Send + Sync {
    /// Initiator side. Returns the stream and the side-channel port the
    /// peer negotiated in-band (0 when it offers none).
    async fn connect(&self, io: EngineIo) -> io::Result<(EngineStream, u16)>;

    /// Responder side, announcing our side-channel port in-band.
    async fn accept(&self, io: EngineIo, side_channel_port: u16) -> io::Result<EngineStream>;
}

/// Wires the engine between the link and the session's frame queues.
/// Returns the side-channel port learned from the peer (initiator only).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn establish(
    role: Role,
    engine: Arc<dyn AlternateEngine>,
    side_channel_port: u16,
    out: flume::Sender<BytesMut>,
    mut link_in: Receiver<BytesMut>,
    data_out: FrameReceiver,
    data_in: FrameSender,
    closed: flume::Sender<()>,
    session_shutdown: &ShutdownManager<()>,
) -> io::Result<Option<u16>> {
    let scope = ShutdownManager::<()>::new();
    chain_shutdown(session_shutdown, &scope);

    let (wire_out_tx, wire_out_rx) = flume::bounded::<BytesMut>(512);
    let (wire_in_tx, wire_in_rx) = flume::bounded::<BytesMut>(512);

    // The wire pumps must already be running while the engine handshakes.
    spawn_adapter(&scope, session_shutdown, {
        let out = out.clone();
        async move {
            while let Ok(pkt) = wire_out_rx.recv_async().await {
                if out.send_async(pkt).await.is_err() {
                    break;
                }
            }
        }
    });
    spawn_adapter(&scope, session_shutdown, async move {
        while let Some(pkt) = link_in.recv().await {
            if wire_in_tx.send_async(pkt).await.is_err() {
                break;
            }
        }
    });

    let io = EngineIo {
        outbound: wire_out_tx,
        inbound: wire_in_rx,
    };
    let (stream, negotiated_port) = match role {
        Role::Initiator => {
            let (stream, port) = engine.connect(io).await?;
            (stream, Some(port).filter(|p| *p != 0))
        }
        Role::Responder => (engine.accept(io, side_channel_port).await?, None),
    };

    let EngineStream {
        frames_out,
        frames_in,
        fatal,
    } = stream;

    // A fatal engine error cancels the adapter scope, closing the exposed
    // stream with that error.
    spawn_adapter(&scope, session_shutdown, {
        let scope = scope.clone();
        let data_in = data_in.clone();
        async move {
            if let Ok(e) = fatal.recv_async().await {
                log::warn!("alternate transport engine failed: {e:?}");
                data_in.close_with(e);
                _ = scope.trigger_shutdown(());
            }
        }
    });
    spawn_adapter(&scope, session_shutdown, async move {
        loop {
            match frames_in.recv_async().await {
                Ok(frame) => {
                    if data_in.push(frame).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    // Engine finished cleanly; close_with from the fatal
                    // watcher wins if it got there first.
                    data_in.close();
                    _ = closed.try_send(());
                    break;
                }
            }
        }
    });
    spawn_adapter(&scope, session_shutdown, async move {
        loop {
            match data_out.pop().await {
                Ok(Some(frame)) => {
                    if frames_out.send_async(frame).await.is_err() {
                        break;
                    }
                }
                // Caller closed: dropping the sender tells the engine to
                // flush and close its stream on its own schedule.
                _ => break,
            }
        }
    });

    Ok(negotiated_port)
}

/// Adapter task: cancelled by the adapter scope, completion tracked by the
/// owning session's scope.
fn spawn_adapter<F>(scope: &ShutdownManager<()>, session: &ShutdownManager<()>, task: F)
where
    F: std::future::Future + Send + 'static,
    F::Output: Send,
{
    let scope = scope.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let Ok(_token) = session.delay_shutdown_token() else {
            return;
        };
        _ = scope.wrap_cancel(task).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extend::frame_queue::frame_queue;

    /// Engine double: echoes carried frames back and exposes a lever to
    /// report a fatal error.
    struct EchoEngine {
        fatal: flume::Sender<io::Error>,
        fatal_rx: flume::Receiver<io::Error>,
    }

    impl EchoEngine {
        fn new() -> Self {
            let (fatal, fatal_rx) = flume::bounded(1);
            Self { fatal, fatal_rx }
        }

        fn stream(&self) -> EngineStream {
            let (frames_out_tx, frames_out_rx) = flume::bounded::<BytesMut>(64);
            let (frames_in_tx, frames_in_rx) = flume::bounded::<BytesMut>(64);
            tokio::spawn(async move {
                while let Ok(frame) = frames_out_rx.recv_async().await {
                    if frames_in_tx.send_async(frame).await.is_err() {
                        break;
                    }
                }
            });
            EngineStream {
                frames_out: frames_out_tx,
                frames_in: frames_in_rx,
                fatal: self.fatal_rx.clone(),
            }
        }
    }

    #[async_trait]
    impl AlternateEngine for EchoEngine {
        async fn connect(&self, _io: EngineIo) -> io::Result<(EngineStream, u16)> {
            Ok((self.stream(), 24454))
        }
        async fn accept(&self, _io: EngineIo, _side_channel_port: u16) -> io::Result<EngineStream> {
            Ok(self.stream())
        }
    }

    #[tokio::test]
    async fn carries_frames_and_reports_side_channel_port() {
        let engine = Arc::new(EchoEngine::new());
        let shutdown = ShutdownManager::new();
        let (out, _wire) = flume::bounded(16);
        let (_link_tx, link_in) = tokio::sync::mpsc::channel(16);
        let (data_out_tx, data_out_rx) = frame_queue(16);
        let (data_in_tx, data_in_rx) = frame_queue(16);
        let (closed_tx, _closed_rx) = flume::bounded(1);

        let port = establish(
            Role::Initiator,
            engine.clone(),
            0,
            out,
            link_in,
            data_out_rx,
            data_in_tx,
            closed_tx,
            &shutdown,
        )
        .await
        .unwrap();
        assert_eq!(port, Some(24454));

        data_out_tx.push(BytesMut::from(&b"hello"[..])).unwrap();
        let frame = data_in_rx.pop().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        _ = shutdown.trigger_shutdown(());
    }

    #[tokio::test]
    async fn engine_fatal_error_closes_the_stream() {
        let engine = Arc::new(EchoEngine::new());
        let shutdown = ShutdownManager::new();
        let (out, _wire) = flume::bounded(16);
        let (_link_tx, link_in) = tokio::sync::mpsc::channel(16);
        let (_data_out_tx, data_out_rx) = frame_queue(16);
        let (data_in_tx, data_in_rx) = frame_queue(16);
        let (closed_tx, _closed_rx) = flume::bounded(1);

        establish(
            Role::Responder,
            engine.clone(),
            0,
            out,
            link_in,
            data_out_rx,
            data_in_tx,
            closed_tx,
            &shutdown,
        )
        .await
        .unwrap();

        engine
            .fatal
            .send_async(io::Error::new(io::ErrorKind::ConnectionAborted, "tls torn"))
            .await
            .unwrap();
        let err = loop {
            match data_in_rx.pop().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected error, got clean eof"),
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        _ = shutdown.trigger_shutdown(());
    }
}
