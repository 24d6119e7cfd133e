//! The engine server.
//!
//! The server splits in two. [`Engine`] owns every piece of single-threaded
//! state: the catalog and cluster-state snapshots with their file watchers,
//! the dispatcher with its sessions, and the forwarder with its buffer. It
//! processes one envelope or one clock tick at a time and never blocks,
//! which makes a whole multi-node cluster drivable in-process from a test.
//!
//! [`Server`] is the TCP shell around an engine: an accept thread hands
//! connections to detached reader threads that decode envelopes onto the
//! inbound channel, and the event loop selects over inbound envelopes, the
//! ticker, and shutdown requests. Writes go the other way through the
//! forwarder's transport, so the loop itself never touches a socket.
//!
//! Shutdown is a three-state machine. A graceful request moves Running to
//! Draining: new client requests get unavailable replies while internal
//! traffic still flows, and the engine stops once the last session finishes
//! or times out. An immediate request jumps straight to Stopped.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};
use serde_json::json;

use crate::catalog::{Catalog, FileWatcher};
use crate::cluster::{ForwardBuffer, Forwarder, Membership, Transport};
use crate::dispatch::{Dispatcher, TICKS_PER_SECOND};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::message::{Address, Envelope};
use crate::plugin::Registry;

/// The tick interval. Ten ticks per second drive session timeouts and file
/// polling.
const TICK_INTERVAL: Duration = Duration::from_millis(1000 / TICKS_PER_SECOND);

/// How long the accept loop sleeps between polls for new connections.
const ACCEPT_INTERVAL: Duration = Duration::from_millis(100);

/// The server lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Serving requests.
    Running,
    /// Refusing new client requests while live sessions finish or time out.
    Draining,
    /// Done; the event loop exits.
    Stopped,
}

/// Engine construction parameters, assembled by the binary from its config.
pub struct Options {
    /// This node's name, host:port/tag.
    pub name: Address,
    /// The catalog file.
    pub catalog_path: PathBuf,
    /// The cluster-state file.
    pub cluster_path: PathBuf,
    /// The forward-buffer directory.
    pub buffer_dir: PathBuf,
    /// The plugin registry serving this node's datasets.
    pub registry: Registry,
    /// Delivery to peer engines and reply listeners.
    pub transport: Box<dyn Transport>,
    /// Session timeout for plans that declare none.
    pub timeout_seconds: u64,
    /// Catalog and cluster-state poll interval.
    pub poll_seconds: u64,
}

/// One engine's complete state, processed strictly one event at a time.
pub struct Engine {
    catalog: Catalog,
    catalog_path: PathBuf,
    catalog_watcher: FileWatcher,
    cluster_watcher: FileWatcher,
    membership: Membership,
    dispatcher: Dispatcher,
    forwarder: Forwarder,
    /// Envelopes the dispatcher queued for delivery.
    outbox: Receiver<(Envelope, Address)>,
    state: State,
    /// Ticks since startup.
    now: u64,
    /// File poll cadence in ticks.
    poll_interval: u64,
}

impl Engine {
    /// Loads the catalog and cluster state, recovers any buffered backlog
    /// from a previous run, and assembles the engine around them.
    pub fn new(options: Options) -> Result<Self> {
        let catalog = Catalog::load(&options.catalog_path)?;
        let mut membership = Membership::load(options.name.clone(), &options.cluster_path);
        let buffer = ForwardBuffer::open(&options.buffer_dir)?;
        let mut forwarder = Forwarder::new(options.transport, buffer);
        forwarder.recover(&mut membership)?;

        let (outbox_tx, outbox_rx) = crossbeam::channel::unbounded();
        let dispatcher =
            Dispatcher::new(options.name, options.registry, outbox_tx, options.timeout_seconds);

        Ok(Self {
            catalog,
            catalog_watcher: FileWatcher::new(&options.catalog_path),
            catalog_path: options.catalog_path,
            cluster_watcher: FileWatcher::new(&options.cluster_path),
            membership,
            dispatcher,
            forwarder,
            outbox: outbox_rx,
            state: State::Running,
            now: 0,
            poll_interval: options.poll_seconds.saturating_mul(TICKS_PER_SECOND).max(1),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The number of live sessions.
    pub fn sessions(&self) -> usize {
        self.dispatcher.sessions()
    }

    /// Processes one inbound envelope and delivers whatever it produced.
    /// While draining, client requests bounce with an unavailable reply but
    /// internal traffic still reaches its sessions.
    pub fn process(&mut self, envelope: Envelope) {
        if self.state != State::Running && !envelope.is_internal() {
            debug!("Draining, refusing {} request", envelope.kind);
            if let Some(destination) = envelope.reply_destination() {
                let error = Error::Unavailable;
                let reply =
                    envelope.reply(error.status_code(), json!({"error": error.to_string()}));
                self.deliver(reply, destination);
            }
            return;
        }
        self.dispatcher.process(envelope, &self.catalog, &self.membership);
        self.drain_outbox();
    }

    /// Advances time one tick: session timeouts, periodic file polling, and
    /// drain completion.
    pub fn tick(&mut self) {
        self.now += 1;
        self.dispatcher.tick();
        self.drain_outbox();
        if self.now % self.poll_interval == 0 {
            self.poll();
        }
        if self.state == State::Draining && self.dispatcher.sessions() == 0 {
            info!("All sessions finished, stopping");
            self.state = State::Stopped;
        }
    }

    /// Requests shutdown: graceful drains live sessions first, immediate
    /// stops the loop outright.
    pub fn shutdown(&mut self, graceful: bool) {
        if !graceful {
            info!("Stopping immediately");
            self.state = State::Stopped;
            return;
        }
        if self.state == State::Running {
            info!("Draining {} live session(s) before stopping", self.dispatcher.sessions());
            self.state = State::Draining;
            if self.dispatcher.sessions() == 0 {
                self.state = State::Stopped;
            }
        }
    }

    /// Polls the catalog and cluster-state files for changes, swapping in
    /// whole new snapshots. A snapshot that fails to load keeps the previous
    /// one. Buffered messages replay to any destination that can take
    /// delivery again.
    fn poll(&mut self) {
        if self.catalog_watcher.poll() {
            match Catalog::load(&self.catalog_path) {
                Ok(catalog) => {
                    info!("Reloaded catalog from {}", self.catalog_path.display());
                    self.catalog = catalog;
                }
                Err(error) => error!("Reloading catalog failed, keeping previous: {error}"),
            }
        }
        if self.cluster_watcher.poll() {
            self.membership.reload();
        }
        if let Err(error) = self.forwarder.flush_ready(&mut self.membership) {
            error!("Replaying buffered messages failed: {error}");
        }
        self.drain_outbox();
    }

    /// Delivers everything the dispatcher queued.
    fn drain_outbox(&mut self) {
        while let Ok((envelope, destination)) = self.outbox.try_recv() {
            self.deliver(envelope, destination);
        }
    }

    fn deliver(&mut self, envelope: Envelope, destination: Address) {
        if let Err(error) = self.forwarder.forward(envelope, &destination, &mut self.membership) {
            error!("Forwarding to {destination} failed: {error}");
        }
    }
}

/// The TCP shell around an engine.
pub struct Server {
    engine: Engine,
}

impl Server {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Serves the listener until the engine stops. Shutdown requests arrive
    /// on the channel: true drains gracefully, false stops immediately; a
    /// closed channel stops too, so dropping the sender tears the server
    /// down.
    pub fn serve(mut self, listener: TcpListener, shutdown: Receiver<bool>) -> Result<()> {
        listener.set_nonblocking(true)?;
        info!("Listening on {}", listener.local_addr()?);

        let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        std::thread::scope(|scope| {
            scope.spawn({
                let stop = Arc::clone(&stop);
                move || Self::accept(listener, inbound_tx, stop)
            });
            let result = self.eventloop(inbound_rx, shutdown);
            stop.store(true, Ordering::Relaxed);
            result
        })
    }

    /// Accepts connections until stopped, handing each to a detached reader
    /// thread. The listener polls so the stop flag is honored promptly.
    fn accept(listener: TcpListener, inbound: Sender<Envelope>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((socket, _)) => {
                    let inbound = inbound.clone();
                    std::thread::spawn(move || Self::read(socket, inbound));
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_INTERVAL);
                }
                Err(error) => {
                    error!("Accepting connection failed: {error}");
                    return;
                }
            }
        }
    }

    /// Decodes envelopes off one connection onto the inbound channel until
    /// the peer closes it or the engine goes away.
    fn read(socket: TcpStream, inbound: Sender<Envelope>) {
        let peer = match socket.peer_addr() {
            Ok(peer) => peer.to_string(),
            Err(_) => "unknown".to_owned(),
        };
        if let Err(error) = socket.set_nonblocking(false) {
            error!("Failed to set up connection from {peer}: {error}");
            return;
        }
        debug!("Connection from {peer}");
        let mut reader = BufReader::new(socket);
        loop {
            match Envelope::maybe_decode_from(&mut reader) {
                Ok(Some(envelope)) => {
                    if inbound.send(envelope).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("Connection from {peer} closed");
                    return;
                }
                Err(error) => {
                    error!("Reading from {peer} failed: {error}");
                    return;
                }
            }
        }
    }

    /// The event loop: one thread owns the engine and multiplexes inbound
    /// envelopes, the ticker, and shutdown requests.
    fn eventloop(&mut self, inbound: Receiver<Envelope>, shutdown: Receiver<bool>) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        while self.engine.state() != State::Stopped {
            crossbeam::select! {
                recv(ticker) -> _ => self.engine.tick(),
                recv(inbound) -> envelope => match envelope {
                    Ok(envelope) => self.engine.process(envelope),
                    Err(_) => break,
                },
                recv(shutdown) -> graceful => self.engine.shutdown(graceful.unwrap_or(false)),
            }
        }
        info!("Server stopped");
        Ok(())
    }
}
