use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_shutdown::ShutdownManager;
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;

use crate::extend::frame_queue::{FrameReceiver, FrameSender};
use crate::protocol::VOICE_TAG;

/// Starts the local voice relay: datagrams from the voice application are
/// tagged and pushed toward the link, inbound tagged frames are stripped and
/// forwarded to the last-seen application address (or the configured port
/// until the application has sent anything).
///
/// A bind failure only loses voice; the data connection is unaffected.
pub(crate) async fn start(
    shutdown: ShutdownManager<()>,
    bind: SocketAddr,
    voice_port: u16,
    voice_in: FrameReceiver,
    voice_out: FrameSender,
) -> Option<SocketAddr> {
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("voice relay bind on {bind} failed, continuing without voice: {e:?}");
            return None;
        }
    };
    let local_addr = socket.local_addr().ok()?;
    log::debug!("voice relay listening on {local_addr}, app port {voice_port}");
    let fallback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), voice_port);
    crate::extend::spawn_guarded(&shutdown, relay(socket, fallback, voice_in, voice_out));
    Some(local_addr)
}

async fn relay(
    socket: UdpSocket,
    fallback: SocketAddr,
    voice_in: FrameReceiver,
    voice_out: FrameSender,
) {
    let mut buf = [0u8; 2048];
    let mut last_seen: Option<SocketAddr> = None;
    loop {
        tokio::select! {
            rs = socket.recv_from(&mut buf) => match rs {
                Ok((len, src)) => {
                    last_seen = Some(src);
                    let mut frame = BytesMut::with_capacity(len + 1);
                    frame.put_u8(VOICE_TAG);
                    frame.extend_from_slice(&buf[..len]);
                    if voice_out.push(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("voice relay socket error: {e:?}");
                    break;
                }
            },
            rs = voice_in.pop() => match rs {
                Ok(Some(frame)) if frame.len() > 1 => {
                    let dest = last_seen.unwrap_or(fallback);
                    if let Err(e) = socket.send_to(&frame[1..], dest).await {
                        log::warn!("voice forward to {dest} failed: {e:?}");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::extend::frame_queue::frame_queue;

    #[tokio::test]
    async fn tags_outbound_and_strips_inbound() {
        let shutdown = ShutdownManager::new();
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app_port = app.local_addr().unwrap().port();
        let (in_tx, in_rx) = frame_queue(16);
        let (out_tx, out_rx) = frame_queue(16);

        let relay_addr = start(
            shutdown.clone(),
            "127.0.0.1:0".parse().unwrap(),
            app_port,
            in_rx,
            out_tx,
        )
        .await
        .expect("bind failed");

        // App → relay: frame shows up tagged on the link side.
        app.send_to(b"opus frame", relay_addr).await.unwrap();
        let tagged = tokio::time::timeout(Duration::from_secs(2), out_rx.pop())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(tagged[0], VOICE_TAG);
        assert_eq!(&tagged[1..], b"opus frame");

        // Link → relay: tag stripped, forwarded to the last-seen app address.
        let mut frame = BytesMut::new();
        frame.put_u8(VOICE_TAG);
        frame.extend_from_slice(b"reply frame");
        in_tx.push(frame).unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), app.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"reply frame");
        _ = shutdown.trigger_shutdown(());
    }

    #[tokio::test]
    async fn falls_back_to_configured_port_before_first_app_packet() {
        let shutdown = ShutdownManager::new();
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app_port = app.local_addr().unwrap().port();
        let (in_tx, in_rx) = frame_queue(16);
        let (out_tx, _out_rx) = frame_queue(16);

        start(
            shutdown.clone(),
            "127.0.0.1:0".parse().unwrap(),
            app_port,
            in_rx,
            out_tx,
        )
        .await
        .expect("bind failed");

        let mut frame = BytesMut::new();
        frame.put_u8(VOICE_TAG);
        frame.extend_from_slice(b"early");
        in_tx.push(frame).unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), app.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"early");
        _ = shutdown.trigger_shutdown(());
    }
}
