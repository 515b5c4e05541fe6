//! UDP transport for a single headset.
//!
//! The session threads hand framed packets to [`UdpTransport::send`]; a tokio
//! task drains them onto the socket. A second task decodes inbound datagrams
//! into session events.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use tether_core::{EventSender, SessionEvent, StreamError, StreamResult, Transport};
use tether_wire::{decode_packet, MAX_MESSAGE_BYTES};

const OUTBOUND_QUEUE: usize = 1024;

/// Where outbound packets go. Fixed when configured, otherwise learned from
/// the first valid datagram.
#[derive(Clone, Default)]
pub struct PeerSlot(Arc<Mutex<Option<SocketAddr>>>);

impl PeerSlot {
    pub fn fixed(addr: SocketAddr) -> Self {
        Self(Arc::new(Mutex::new(Some(addr))))
    }

    fn get(&self) -> Option<SocketAddr> {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn learn(&self, addr: SocketAddr) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(addr);
            return true;
        }
        *slot == Some(addr)
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: PeerSlot,
    outbound: mpsc::Sender<Bytes>,
    open: AtomicBool,
}

impl UdpTransport {
    /// Wrap `socket` and spawn the task that drains outbound packets.
    pub fn new(socket: UdpSocket, peer: PeerSlot) -> Arc<Self> {
        let socket = Arc::new(socket);
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(send_loop(Arc::clone(&socket), peer.clone(), rx));
        Arc::new(Self {
            socket,
            peer,
            outbound,
            open: AtomicBool::new(false),
        })
    }

    /// Start decoding inbound datagrams into `events`.
    pub fn spawn_receiver(&self, events: EventSender) {
        tokio::spawn(recv_loop(
            Arc::clone(&self.socket),
            self.peer.clone(),
            events,
        ));
    }
}

impl Transport for UdpTransport {
    fn open(&self) -> StreamResult<()> {
        if self.outbound.is_closed() {
            return Err(StreamError::Transport("socket task has exited".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn send(&self, packet: Bytes) -> StreamResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(StreamError::NotRunning);
        }
        self.outbound.try_send(packet).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                StreamError::Transport("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                StreamError::Transport("socket task has exited".into())
            }
        })
    }
}

async fn send_loop(socket: Arc<UdpSocket>, peer: PeerSlot, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(packet) = rx.recv().await {
        let Some(addr) = peer.get() else {
            continue;
        };
        if let Err(err) = socket.send_to(&packet, addr).await {
            warn!("send to {addr} failed: {err}");
        }
    }
    debug!("udp send task exiting");
}

async fn recv_loop(socket: Arc<UdpSocket>, peer: PeerSlot, events: EventSender) {
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES as usize];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("udp receive failed: {err}");
                events.push(SessionEvent::Disconnected);
                return;
            }
        };
        let (_, message) = match decode_packet(Bytes::copy_from_slice(&buf[..len])) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("invalid packet from {from}: {err}");
                continue;
            }
        };
        let first_contact = peer.get().is_none();
        if !peer.learn(from) {
            debug!("ignoring packet from unknown peer {from}");
            continue;
        }
        if first_contact {
            info!("headset connected from {from}");
        }
        trace!("{:?} message from {from}", message.channel());
        if let Some(event) = SessionEvent::from_message(message) {
            if !events.push(event) {
                debug!("event queue full, dropped inbound event");
            }
        }
    }
}
