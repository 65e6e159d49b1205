use std::io;
use std::io::Write;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use bytes::{Buf, BytesMut};
use kcp::Kcp;
use tokio::sync::mpsc::Receiver;

use crate::extend::frame_queue::{FrameReceiver, FrameSender};
use crate::protocol::{connect_probe, is_connect_probe, CLOSE_SENTINEL, STREAM_CONV};
use crate::session::Role;

/// Stream packets carry at least a 24-byte header; anything shorter on the
/// link is a probe or a stray.
const MIN_PACKET: usize = 24;

#[derive(Copy, Clone)]
pub(crate) struct StreamConfig {
    pub mtu: usize,
    pub window: u16,
    pub probe_interval: Duration,
}

/// Performs the connect handshake, then drives the reliable stream until it
/// closes. Returns once the handshake completed; the caller bounds the wait
/// with its handshake timeout.
///
/// Frames pulled from `data_out` ride the stream; reassembled frames are
/// pushed into `data_in`. `closed` fires after a graceful close fully
/// drained.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn establish(
    role: Role,
    out: flume::Sender<BytesMut>,
    mut link_in: Receiver<BytesMut>,
    data_out: FrameReceiver,
    data_in: FrameSender,
    closed: flume::Sender<()>,
    shutdown: ShutdownManager<()>,
    cfg: StreamConfig,
) -> io::Result<()> {
    let mut pending = Vec::new();
    handshake(role, &out, &mut link_in, &mut pending, cfg.probe_interval).await?;
    tokio::spawn(async move {
        let Ok(_token) = shutdown.delay_shutdown_token() else {
            return;
        };
        let task = run_stream(role, out, link_in, data_out, &data_in, &closed, cfg, pending);
        match shutdown.wrap_cancel(task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("reliable stream failed: {e:?}");
                data_in.close_with(e);
            }
            Err(_) => {}
        }
    });
    Ok(())
}

async fn handshake(
    role: Role,
    out: &flume::Sender<BytesMut>,
    link_in: &mut Receiver<BytesMut>,
    pending: &mut Vec<BytesMut>,
    probe_interval: Duration,
) -> io::Result<()> {
    let probe = BytesMut::from(&connect_probe()[..]);
    let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "link closed during handshake");
    match role {
        Role::Initiator => loop {
            out.send_async(probe.clone()).await.map_err(|_| broken())?;
            tokio::select! {
                rs = link_in.recv() => match rs {
                    Some(pkt) if is_connect_probe(&pkt) => return Ok(()),
                    // The peer skipped straight to stream data; the probe
                    // echo was lost but the link is clearly up.
                    Some(pkt) if pkt.len() >= MIN_PACKET => {
                        pending.push(pkt);
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return Err(broken()),
                },
                _ = tokio::time::sleep(probe_interval) => {}
            }
        },
        Role::Responder => loop {
            match link_in.recv().await {
                Some(pkt) if is_connect_probe(&pkt) => {
                    out.send_async(probe.clone()).await.map_err(|_| broken())?;
                    return Ok(());
                }
                Some(pkt) if pkt.len() >= MIN_PACKET => {
                    pending.push(pkt);
                    _ = out.send_async(probe.clone()).await;
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(broken()),
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    role: Role,
    out: flume::Sender<BytesMut>,
    mut link_in: Receiver<BytesMut>,
    data_out: FrameReceiver,
    data_in: &FrameSender,
    closed: &flume::Sender<()>,
    cfg: StreamConfig,
    pending: Vec<BytesMut>,
) -> io::Result<()> {
    let mut kcp = Kcp::new(STREAM_CONV, DatagramOut { sender: out.clone() });
    kcp.set_mtu(cfg.mtu).map_err(io::Error::other)?;
    kcp.set_wndsize(cfg.window, cfg.window);
    kcp.set_nodelay(true, 10, 2, true);
    let epoch = Instant::now();

    let mut drained = false;
    let mut sentinel_sent = false;
    let mut remote_done = false;
    for pkt in pending {
        input_packet(&mut kcp, pkt, sentinel_sent)?;
    }
    loop {
        // Deliver everything the stream has reassembled so far.
        while let Ok(size) = kcp.peeksize() {
            let mut frame = BytesMut::zeroed(size);
            let Ok(len) = kcp.recv(&mut frame) else { break };
            frame.truncate(len);
            if frame[..] == CLOSE_SENTINEL {
                // Peer is done sending; end the inbound stream without ever
                // surfacing the sentinel as data.
                remote_done = true;
                data_in.close();
            } else if !remote_done && data_in.push(frame).is_err() {
                log::trace!("inbound frame dropped, reader gone");
            }
        }
        if drained && !sentinel_sent {
            kcp.send(&CLOSE_SENTINEL).map_err(io::Error::other)?;
            sentinel_sent = true;
        }
        if sentinel_sent && kcp.wait_snd() == 0 {
            _ = kcp.flush();
            _ = closed.try_send(());
            return Ok(());
        }

        // Single retransmission timer, rescheduled from the protocol clock
        // after every send, receive, and tick.
        let now = epoch.elapsed().as_millis() as u32;
        let wait = kcp.check(now).clamp(1, 100) as u64;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait);
        let window_open = kcp.wait_snd() < kcp.snd_wnd() as usize;
        tokio::select! {
            rs = link_in.recv() => match rs {
                Some(pkt) if is_connect_probe(&pkt) => {
                    // A lost echo leaves the peer probing into the open
                    // stream; answering again is harmless.
                    if role == Role::Responder {
                        _ = out.try_send(BytesMut::from(&connect_probe()[..]));
                    }
                }
                Some(pkt) if pkt.len() >= MIN_PACKET => {
                    input_packet(&mut kcp, pkt, sentinel_sent)?;
                }
                Some(pkt) => log::trace!("ignoring stray {}-byte datagram", pkt.len()),
                None => {
                    if sentinel_sent {
                        _ = closed.try_send(());
                        return Ok(());
                    }
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "link closed"));
                }
            },
            frame = data_out.pop(), if window_open && !drained => match frame {
                Ok(Some(frame)) => {
                    kcp.send(&frame).map_err(io::Error::other)?;
                }
                // Caller closed its end: everything queued has now been
                // handed to the stream, start the close handshake.
                Ok(None) => drained = true,
                Err(_) => drained = true,
            },
            _ = tokio::time::sleep_until(deadline) => {
                let now = epoch.elapsed().as_millis() as u32;
                if let Err(e) = kcp.update(now) {
                    if !sentinel_sent {
                        return Err(io::Error::other(e));
                    }
                }
            }
        }
    }
}

fn input_packet(kcp: &mut Kcp<DatagramOut>, mut pkt: BytesMut, closing: bool) -> io::Result<()> {
    loop {
        match kcp.input(&pkt) {
            Ok(n) if n < pkt.len() => pkt.advance(n),
            Ok(_) => return Ok(()),
            Err(e) => {
                // Late garbage after our close is expected, anything else is
                // a stream failure.
                if closing {
                    return Ok(());
                }
                return Err(io::Error::other(e));
            }
        }
    }
}

struct DatagramOut {
    sender: flume::Sender<BytesMut>,
}

impl Write for DatagramOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sender.try_send(BytesMut::from(buf)) {
            Ok(_) => {}
            // A full link queue loses the datagram; retransmission covers it.
            Err(flume::TrySendError::Full(_)) => {}
            Err(flume::TrySendError::Disconnected(_)) => {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extend::frame_queue::frame_queue;

    struct Side {
        data_out: FrameSender,
        data_in: FrameReceiver,
        closed: flume::Receiver<()>,
        shutdown: ShutdownManager<()>,
    }

    async fn linked_pair() -> (Side, Side) {
        let cfg = StreamConfig {
            mtu: 1450,
            window: 128,
            probe_interval: Duration::from_millis(50),
        };
        let (out_a, wire_ab) = flume::bounded::<BytesMut>(512);
        let (out_b, wire_ba) = flume::bounded::<BytesMut>(512);
        let (in_a_tx, in_a) = tokio::sync::mpsc::channel(512);
        let (in_b_tx, in_b) = tokio::sync::mpsc::channel(512);
        tokio::spawn(async move {
            while let Ok(pkt) = wire_ab.recv_async().await {
                if in_b_tx.send(pkt).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Ok(pkt) = wire_ba.recv_async().await {
                if in_a_tx.send(pkt).await.is_err() {
                    break;
                }
            }
        });

        let mut sides = Vec::new();
        let mut handles = Vec::new();
        for (role, out, link_in) in [
            (Role::Initiator, out_a, in_a),
            (Role::Responder, out_b, in_b),
        ] {
            let (app_out_tx, app_out_rx) = frame_queue(64);
            let (app_in_tx, app_in_rx) = frame_queue(64);
            let (closed_tx, closed_rx) = flume::bounded(1);
            let shutdown = ShutdownManager::new();
            handles.push(tokio::spawn(establish(
                role,
                out,
                link_in,
                app_out_rx,
                app_in_tx,
                closed_tx,
                shutdown.clone(),
                cfg,
            )));
            sides.push(Side {
                data_out: app_out_tx,
                data_in: app_in_rx,
                closed: closed_rx,
                shutdown,
            });
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let b = sides.pop().unwrap();
        let a = sides.pop().unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (a, b) = linked_pair().await;
        a.data_out.push(BytesMut::from(&b"ping"[..])).unwrap();
        let frame = b.data_in.pop().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"ping");
        b.data_out.push(BytesMut::from(&b"pong"[..])).unwrap();
        let frame = a.data_in.pop().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"pong");
        _ = a.shutdown.trigger_shutdown(());
        _ = b.shutdown.trigger_shutdown(());
    }

    #[tokio::test]
    async fn large_frames_survive_segmentation() {
        let (a, b) = linked_pair().await;
        let big: Vec<u8> = (0..60_000).map(|i| (i % 251) as u8).collect();
        a.data_out.push(BytesMut::from(&big[..])).unwrap();
        let frame = b.data_in.pop().await.unwrap().unwrap();
        assert_eq!(&frame[..], &big[..]);
        _ = a.shutdown.trigger_shutdown(());
        _ = b.shutdown.trigger_shutdown(());
    }

    #[tokio::test]
    async fn close_delivers_pending_bytes_then_eof() {
        let (a, b) = linked_pair().await;
        a.data_out.push(BytesMut::from(&b"first"[..])).unwrap();
        a.data_out.push(BytesMut::from(&b"second"[..])).unwrap();
        a.data_out.close();

        assert_eq!(&b.data_in.pop().await.unwrap().unwrap()[..], b"first");
        assert_eq!(&b.data_in.pop().await.unwrap().unwrap()[..], b"second");
        // End of stream, and the sentinel never shows up as data.
        assert!(b.data_in.pop().await.unwrap().is_none());
        // The closing side observes its graceful close completing.
        tokio::time::timeout(Duration::from_secs(5), a.closed.recv_async())
            .await
            .expect("close did not drain")
            .unwrap();
        _ = a.shutdown.trigger_shutdown(());
        _ = b.shutdown.trigger_shutdown(());
    }

    #[tokio::test]
    async fn frame_matching_sentinel_length_is_data() {
        let (a, b) = linked_pair().await;
        // A real frame that happens to be 16 bytes long must arrive as data.
        let frame = BytesMut::from(&[0u8; 16][..]);
        a.data_out.push(frame.clone()).unwrap();
        assert_eq!(b.data_in.pop().await.unwrap().unwrap(), frame);
        _ = a.shutdown.trigger_shutdown(());
        _ = b.shutdown.trigger_shutdown(());
    }
}
