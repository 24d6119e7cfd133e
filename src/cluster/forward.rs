//! Envelope delivery to peer engines.
//!
//! The forwarder decides, per message, whether a destination can take
//! delivery right now. Deliverable destinations get the message via the
//! transport; the rest get it spooled in the forward buffer for later
//! replay. Transports are fire-and-forget: a failed send is logged and the
//! message dropped, and reliability comes from the buffer and membership
//! layers above.

use std::collections::HashMap;
use std::io::Write as _;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info};

use super::{ForwardBuffer, Membership};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::message::{Address, Envelope};

/// The maximum number of outbound messages queued per peer. Sends beyond
/// this are discarded, since a stalled peer must not block the engine.
const SEND_QUEUE_CAPACITY: usize = 1000;

/// How long to wait before reconnecting to an unreachable peer.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// Delivers an envelope to a peer engine. Implementations must not block on
/// the peer.
pub trait Transport: Send {
    fn send(&self, envelope: Envelope, to: &Address) -> Result<()>;
}

/// Routes envelopes to healthy destinations and spools the rest.
pub struct Forwarder {
    transport: Box<dyn Transport>,
    buffer: ForwardBuffer,
}

impl Forwarder {
    pub fn new(transport: Box<dyn Transport>, buffer: ForwardBuffer) -> Self {
        Self { transport, buffer }
    }

    /// Re-registers buffered backlog from a previous run with the
    /// membership view, so readability stays blocked until it drains.
    pub fn recover(&mut self, membership: &mut Membership) -> Result<()> {
        for destination in self.buffer.buffered_destinations()? {
            info!("Recovered buffered backlog for {destination}");
            membership.set_buffered(&destination, true);
        }
        Ok(())
    }

    /// Forwards an envelope, or buffers it if the destination can't take
    /// delivery right now.
    pub fn forward(
        &mut self,
        envelope: Envelope,
        destination: &Address,
        membership: &mut Membership,
    ) -> Result<()> {
        if membership.deliverable(destination) {
            return self.transport.send(envelope, destination);
        }
        debug!("Buffering {} for unavailable {destination}", envelope.kind);
        self.buffer.add(&envelope, destination)?;
        membership.set_buffered(destination, true);
        Ok(())
    }

    /// Replays buffered messages to every destination that has become
    /// deliverable again, honoring replay boundaries from the cluster state.
    pub fn flush_ready(&mut self, membership: &mut Membership) -> Result<()> {
        for destination in self.buffer.buffered_destinations()? {
            if !membership.deliverable(&destination) {
                continue;
            }
            self.buffer.set_boundary(&destination, membership.boundary(&destination));
            let transport = &*self.transport;
            match self.buffer.flush(&destination, |envelope, to| transport.send(envelope, to)) {
                Ok(0) => {}
                Ok(n) => info!("Flushed {n} buffered message(s) to {destination}"),
                Err(err) => error!("Flushing buffered messages to {destination} failed: {err}"),
            }
            if self.buffer.is_empty_for(&destination)? {
                membership.set_buffered(&destination, false);
            }
        }
        Ok(())
    }
}

/// An in-process transport over crossbeam channels, for tests and embedded
/// clusters. Cloning yields a handle to the same peer registry.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    peers: Arc<Mutex<HashMap<Address, Sender<Envelope>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer's inbound channel under its node address.
    pub fn register(&self, address: &Address, tx: Sender<Envelope>) {
        self.peers.lock().expect("lock poisoned").insert(address.node(), tx);
    }

    /// Removes a peer, making sends to it fail.
    pub fn deregister(&self, address: &Address) {
        self.peers.lock().expect("lock poisoned").remove(&address.node());
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: Envelope, to: &Address) -> Result<()> {
        let peers = self.peers.lock()?;
        let Some(tx) = peers.get(&to.node()) else {
            return Err(Error::Unavailable);
        };
        tx.send(envelope).map_err(|_| Error::Unavailable)
    }
}

/// A TCP transport writing newline-delimited JSON envelopes. Each peer gets
/// a dedicated sender thread with a bounded queue, connecting lazily and
/// reconnecting with backoff; a full queue discards the message.
#[derive(Default)]
pub struct TcpTransport {
    peers: Mutex<HashMap<Address, Sender<Envelope>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the sender thread for a peer. It exits when the transport (and
    /// with it the send side of the queue) is dropped.
    fn spawn_sender(node: Address) -> Sender<Envelope> {
        let (tx, rx) = crossbeam::channel::bounded(SEND_QUEUE_CAPACITY);
        std::thread::spawn(move || Self::send_peer(node, rx));
        tx
    }

    /// Sends outbound envelopes to a peer, continuously reconnecting.
    fn send_peer(node: Address, mut rx: Receiver<Envelope>) {
        let addr = node.socket_addr();
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to peer {node}");
                    match Self::send_session(socket, &mut rx) {
                        Ok(()) => break,
                        Err(err) => error!("Failed sending to peer {node}: {err}"),
                    }
                }
                Err(err) => error!("Failed connecting to peer {node}: {err}"),
            }
            std::thread::sleep(RECONNECT_INTERVAL);
        }
        debug!("Disconnected from peer {node}");
    }

    /// Sends outbound envelopes to a peer via one TCP session.
    fn send_session(mut socket: TcpStream, rx: &mut Receiver<Envelope>) -> Result<()> {
        while let Ok(envelope) = rx.recv() {
            envelope.encode_into(&mut socket)?;
            socket.flush()?;
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope, to: &Address) -> Result<()> {
        let node = to.node();
        let mut peers = self.peers.lock()?;
        let tx = peers.entry(node.clone()).or_insert_with(|| Self::spawn_sender(node.clone()));
        match tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!("Full send queue for peer {node}, discarding message");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Unavailable),
        }
    }
}
