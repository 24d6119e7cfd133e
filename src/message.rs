//! The shardcast message envelope and addressing scheme.
//!
//! Every unit of communication is a JSON envelope, whether it came from a
//! client, a peer engine, or the engine itself. Client-facing requests carry a
//! command type and a dataset; internal traffic between engines reuses the
//! same envelope with reserved types ("dispatcher" for step dispatch and
//! partial-result delivery).
//!
//! Addresses name an engine endpoint as host:port/tag, optionally suffixed
//! with a local shard name as host:port/tag.local. The node part (without the
//! local suffix) identifies the process a message is delivered to; the local
//! part selects a shard replica within it.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value as Json;
use time::OffsetDateTime;

use crate::error::Result;
use crate::{encoding, errinput};

/// The envelope type of internal engine-to-engine traffic. The body carries
/// either dispatched steps or a partial-result delivery.
pub const DISPATCHER: &str = "dispatcher";

/// An engine endpoint address of the form host:port/tag, optionally carrying
/// a shard-local name as host:port/tag.local.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    /// The host name or IP address.
    pub host: String,
    /// The TCP port.
    pub port: u16,
    /// The endpoint tag, distinguishing engines sharing a host:port space.
    pub tag: String,
    /// The shard-local name, if the address targets a single shard replica.
    pub local: Option<String>,
}

/// Matches host:port/tag with an optional .local suffix.
fn address_regex() -> &'static regex::Regex {
    static REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    REGEX.get_or_init(|| {
        regex::Regex::new(r"^([^:/\s]+):(\d+)/([^.\s]+)(?:\.([^\s]+))?$")
            .expect("invalid address regex")
    })
}

impl Address {
    /// Parses an address from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        let Some(captures) = address_regex().captures(s) else {
            return errinput!("invalid address {s}");
        };
        Ok(Self {
            host: captures[1].to_owned(),
            port: captures[2].parse()?,
            tag: captures[3].to_owned(),
            local: captures.get(4).map(|m| m.as_str().to_owned()),
        })
    }

    /// Returns the node part of the address, i.e. without the shard-local
    /// suffix. This identifies the engine process messages are delivered to.
    pub fn node(&self) -> Address {
        Address { local: None, ..self.clone() }
    }

    /// Returns true if both addresses name the same engine process,
    /// regardless of shard-local suffix.
    pub fn same_node(&self, other: &Address) -> bool {
        self.host == other.host && self.port == other.port && self.tag == other.tag
    }

    /// Returns the host:port socket address used for TCP delivery.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.tag)?;
        if let Some(local) = &self.local {
            write!(f, ".{local}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Address {
    type Error = crate::error::Error;

    fn try_from(s: String) -> Result<Self> {
        Address::parse(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> String {
        address.to_string()
    }
}

impl std::str::FromStr for Address {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

/// A message envelope. The same envelope shape is used for client requests,
/// replies, and internal dispatcher traffic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The message type, e.g. "search" or "dispatcher". Replies use the
    /// request type suffixed with ".result".
    #[serde(rename = "type")]
    pub kind: String,
    /// The dataset the message operates on. Internal dispatcher messages
    /// don't carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// The message payload.
    #[serde(default)]
    pub body: Json,
    /// A correlation id. Client requests may set one; the engine assigns a
    /// fresh execution id to internal traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Where the final reply should be sent. Fire-and-forget requests omit
    /// it.
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Address>,
    /// The reply status code, HTTP-like. Only set on replies.
    #[serde(rename = "statusCode", default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Addresses the message passed through on its way here, appended by each
    /// forwarding hop. If a reply has no replyTo, it unwinds to the first via
    /// entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<Address>,
    /// Names of adapters that have already processed this message, so output
    /// adapters can see what the input side did.
    #[serde(rename = "appliedAdapters", default, skip_serializing_if = "Vec::is_empty")]
    pub applied_adapters: Vec<String>,
    /// The message date. Buffered-message replay compares it against the
    /// destination's replay boundary.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub date: Option<OffsetDateTime>,
}

impl encoding::Value for Envelope {}

impl Envelope {
    /// Creates a new request envelope for a dataset command.
    pub fn request(kind: impl Into<String>, dataset: impl Into<String>, body: Json) -> Self {
        Self {
            kind: kind.into(),
            dataset: Some(dataset.into()),
            body,
            id: None,
            reply_to: None,
            status_code: None,
            via: Vec::new(),
            applied_adapters: Vec::new(),
            date: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Creates an internal dispatcher envelope carrying the given body.
    pub fn internal(body: Json) -> Self {
        Self {
            kind: DISPATCHER.to_owned(),
            dataset: None,
            body,
            id: None,
            reply_to: None,
            status_code: None,
            via: Vec::new(),
            applied_adapters: Vec::new(),
            date: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Returns true if this is internal dispatcher traffic.
    pub fn is_internal(&self) -> bool {
        self.kind == DISPATCHER
    }

    /// Builds the reply for this envelope, merging the response onto the
    /// original message: the type gains a ".result" suffix, the status code
    /// and body are replaced, and the correlation id and adapter trail are
    /// kept. The reply carries no replyTo of its own.
    pub fn reply(&self, status_code: u16, body: Json) -> Envelope {
        Envelope {
            kind: format!("{}.result", self.kind),
            dataset: self.dataset.clone(),
            body,
            id: self.id.clone(),
            reply_to: None,
            status_code: Some(status_code),
            via: Vec::new(),
            applied_adapters: self.applied_adapters.clone(),
            date: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Returns the address the reply to this envelope should go to: the
    /// explicit replyTo if present, else the first via hop, else nowhere
    /// (fire-and-forget).
    pub fn reply_destination(&self) -> Option<Address> {
        self.reply_to.clone().or_else(|| self.via.first().cloned())
    }
}
