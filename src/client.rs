//! A blocking engine client.
//!
//! Replies don't come back on the request connection. The engine delivers
//! them through its forwarding side to the address in the request's
//! `replyTo` field, so the client binds an ephemeral listener, stamps its
//! address on the request, and waits for the engine to connect back with
//! the reply envelope.

use std::io::{BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use serde_json::Value as Json;

use crate::dispatch::STATUS;
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::message::{Address, Envelope};

/// How long to wait for a reply before giving up. The engine never answers
/// timed-out sessions, so the client needs its own limit.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the reply listener polls for the engine's connection.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Client {
    /// The engine node requests go to.
    server: Address,
    timeout: Duration,
}

impl Client {
    pub fn new(server: Address) -> Self {
        Self { server, timeout: DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(server: Address, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    /// Sends a request and blocks until the engine replies or the timeout
    /// passes.
    pub fn request(&self, kind: &str, dataset: &str, body: Json) -> Result<Envelope> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let local = listener.local_addr()?;

        let mut request = Envelope::request(kind, dataset, body);
        request.reply_to = Some(Address {
            host: local.ip().to_string(),
            port: local.port(),
            tag: "client".to_owned(),
            local: None,
        });
        self.send(&request)?;
        self.await_reply(listener)
    }

    /// Sends a fire-and-forget request carrying no reply address.
    pub fn notify(&self, kind: &str, dataset: &str, body: Json) -> Result<()> {
        self.send(&Envelope::request(kind, dataset, body))
    }

    /// Fetches the engine's cluster status.
    pub fn status(&self) -> Result<Json> {
        Ok(self.request(STATUS, "", Json::Null)?.body)
    }

    fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut socket = TcpStream::connect(self.server.socket_addr())?;
        envelope.encode_into(&mut socket)?;
        socket.flush()?;
        Ok(())
    }

    /// Waits for the engine to connect back with the reply.
    fn await_reply(&self, listener: TcpListener) -> Result<Envelope> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match listener.accept() {
                Ok((socket, _)) => {
                    socket.set_nonblocking(false)?;
                    socket.set_read_timeout(Some(self.timeout))?;
                    let mut reader = BufReader::new(socket);
                    return match Envelope::maybe_decode_from(&mut reader)? {
                        Some(reply) => Ok(reply),
                        None => Err(Error::Internal("connection closed before reply".to_owned())),
                    };
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Internal("timed out awaiting reply".to_owned()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
