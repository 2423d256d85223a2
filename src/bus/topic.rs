//! Channel identity: channel types, modes, producers, topics and addresses.
//!
//! Everything here is pure. Addresses must stay bit-identical to every other
//! implementation sharing the host, so the numeric values of [`ChannelType`]
//! and the default base ports are part of the wire contract.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::{BusError, Result};

/// Loopback host every channel binds or connects on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";
/// Base port shared by request and response sockets.
pub const REQUEST_RESPONSE_BASE_PORT: u16 = 5600;
/// Base port of the broker's subscriber-facing (fan-out) side.
pub const SUBSCRIBER_BASE_PORT: u16 = 5700;
/// Base port of the broker's publisher-facing (fan-in) side.
pub const PUBLISHER_BASE_PORT: u16 = 5800;
/// Base port of the broker's control channel.
pub const PROXY_CONTROL_BASE_PORT: u16 = 5900;

/// Reserved topic used only to wake blocked subscribers on shutdown.
///
/// No producer pattern starts with `#`, so it never collides with a real topic.
pub const WAKEUP_TOPIC: &str = "#WakeUp#";

/// Control frame that stops a broker relay.
pub const PROXY_TERMINATE: &str = "TERMINATE";

// ============================================================================
// Channel types
// ============================================================================

/// An independent logical bus with its own address space.
///
/// Values are used directly in port computation. Never resequence them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ChannelType {
    /// Fault and health events.
    Events = 1,
    /// Periodic counters and metrics.
    Counters = 2,
    /// Emergency "red button" notifications.
    RedButton = 3,
    /// Liveness request/response service.
    Echo = 4,
    /// Engine command request/response service.
    Command = 5,
}

impl ChannelType {
    /// All channel types, in value order.
    pub const ALL: [ChannelType; 5] = [
        ChannelType::Events,
        ChannelType::Counters,
        ChannelType::RedButton,
        ChannelType::Echo,
        ChannelType::Command,
    ];

    /// Stable integer value used in address computation.
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Whether this type carries publish/subscribe traffic.
    pub fn is_pubsub(self) -> bool {
        matches!(
            self,
            ChannelType::Events | ChannelType::Counters | ChannelType::RedButton
        )
    }

    /// Whether this type carries request/response traffic.
    pub fn is_request_response(self) -> bool {
        matches!(self, ChannelType::Echo | ChannelType::Command)
    }

    /// Publish/subscribe channel types.
    pub fn pubsub_types() -> impl Iterator<Item = ChannelType> {
        Self::ALL.into_iter().filter(|ct| ct.is_pubsub())
    }

    /// Lowercase name used in logs and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Events => "events",
            ChannelType::Counters => "counters",
            ChannelType::RedButton => "red_button",
            ChannelType::Echo => "echo",
            ChannelType::Command => "command",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for ChannelType {
    type Error = BusError;

    fn try_from(value: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ct| i64::from(ct.value()) == value)
            .ok_or_else(|| BusError::InvalidChannelType(format!("unknown channel type {value}")))
    }
}

impl FromStr for ChannelType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s)
            .ok_or_else(|| BusError::InvalidChannelType(format!("unknown channel type '{s}'")))
    }
}

// ============================================================================
// Channel modes
// ============================================================================

/// The role a socket plays on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Publisher,
    Subscriber,
    Request,
    Response,
    ProxyControlPublish,
    ProxyControlSubscribe,
}

impl ChannelMode {
    /// Socket kind a socket of this mode is created with.
    pub(crate) fn socket_type(self) -> zmq::SocketType {
        match self {
            ChannelMode::Publisher | ChannelMode::ProxyControlPublish => zmq::PUB,
            ChannelMode::Subscriber | ChannelMode::ProxyControlSubscribe => zmq::SUB,
            ChannelMode::Request => zmq::REQ,
            ChannelMode::Response => zmq::REP,
        }
    }

    /// Whether sockets of this mode connect (true) or bind (false).
    pub fn is_connect(self) -> bool {
        !matches!(
            self,
            ChannelMode::Response | ChannelMode::ProxyControlPublish
        )
    }

    /// Whether this mode pairs with publish/subscribe channel types.
    pub fn is_pubsub(self) -> bool {
        !matches!(self, ChannelMode::Request | ChannelMode::Response)
    }

    fn as_str(self) -> &'static str {
        match self {
            ChannelMode::Publisher => "publisher",
            ChannelMode::Subscriber => "subscriber",
            ChannelMode::Request => "request",
            ChannelMode::Response => "response",
            ChannelMode::ProxyControlPublish => "proxy-control-publish",
            ChannelMode::ProxyControlSubscribe => "proxy-control-subscribe",
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail unless `channel_type` may be used with `mode`.
pub fn validate_pairing(mode: ChannelMode, channel_type: ChannelType) -> Result<()> {
    let valid = if mode.is_pubsub() {
        channel_type.is_pubsub()
    } else {
        channel_type.is_request_response()
    };
    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidChannelType(format!(
            "{channel_type} cannot be used in {mode} mode"
        )))
    }
}

// ============================================================================
// Producers and topics
// ============================================================================

/// Logical role of a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelProducer {
    /// The sequencing engine. Single instance per process group.
    Engine,
    /// A plugin host instance.
    PluginMgr,
    /// A plugin, identified by its name.
    Plugin,
    /// Any other publisher, identified by its instance suffix.
    Other,
    /// Unspecified producer. Publishes with an empty topic.
    Empty,
}

impl ChannelProducer {
    const ALL: [ChannelProducer; 5] = [
        ChannelProducer::Engine,
        ChannelProducer::PluginMgr,
        ChannelProducer::Plugin,
        ChannelProducer::Other,
        ChannelProducer::Empty,
    ];

    /// Topic prefix; suffix-taking producers append the instance suffix.
    fn prefix(self) -> &'static str {
        match self {
            ChannelProducer::Engine => "Engine/",
            ChannelProducer::PluginMgr => "PluginMgr/",
            ChannelProducer::Plugin => "Plugin/",
            ChannelProducer::Other => "Other/",
            ChannelProducer::Empty => "",
        }
    }

    /// Whether the producer must be given a non-empty instance suffix.
    pub fn requires_suffix(self) -> bool {
        matches!(
            self,
            ChannelProducer::PluginMgr | ChannelProducer::Plugin | ChannelProducer::Other
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            ChannelProducer::Engine => "engine",
            ChannelProducer::PluginMgr => "plugin_mgr",
            ChannelProducer::Plugin => "plugin",
            ChannelProducer::Other => "other",
            ChannelProducer::Empty => "empty",
        }
    }
}

impl fmt::Display for ChannelProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for ChannelProducer {
    type Error = BusError;

    fn try_from(value: i64) -> Result<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| BusError::InvalidProducer(value.to_string()))
    }
}

impl FromStr for ChannelProducer {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| BusError::InvalidProducer(s.to_string()))
    }
}

/// Resolve the topic a producer publishes under.
///
/// Producers that take no suffix ignore the one supplied.
pub fn resolve_topic(producer: ChannelProducer, suffix: &str) -> Result<String> {
    if !producer.requires_suffix() {
        return Ok(producer.prefix().to_string());
    }
    if suffix.is_empty() {
        return Err(BusError::MissingSuffix { producer });
    }
    Ok(format!("{}{}", producer.prefix(), suffix))
}

// ============================================================================
// Addressing
// ============================================================================

/// Host and base ports used to compute channel addresses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortLayout {
    /// Host every endpoint lives on.
    pub host: String,
    /// Base port for request/response sockets.
    pub request_response_base: u16,
    /// Base port for the subscriber-facing broker side.
    pub subscriber_base: u16,
    /// Base port for the publisher-facing broker side.
    pub publisher_base: u16,
    /// Base port for the broker control channel.
    pub proxy_control_base: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            host: LOOPBACK_HOST.to_string(),
            request_response_base: REQUEST_RESPONSE_BASE_PORT,
            subscriber_base: SUBSCRIBER_BASE_PORT,
            publisher_base: PUBLISHER_BASE_PORT,
            proxy_control_base: PROXY_CONTROL_BASE_PORT,
        }
    }
}

impl PortLayout {
    /// Layout with every base port shifted by `offset`.
    ///
    /// Lets several independent buses coexist on one host. Fails when a
    /// shifted base port no longer fits in a `u16`.
    pub fn with_offset(offset: u16) -> Result<Self> {
        let base = Self::default();
        let shift = |port: u16| port.checked_add(offset).ok_or(BusError::PortOffsetOverflow(offset));
        Ok(Self {
            request_response_base: shift(base.request_response_base)?,
            subscriber_base: shift(base.subscriber_base)?,
            publisher_base: shift(base.publisher_base)?,
            proxy_control_base: shift(base.proxy_control_base)?,
            ..base
        })
    }

    fn base_port(&self, mode: ChannelMode) -> u16 {
        match mode {
            ChannelMode::Publisher => self.publisher_base,
            ChannelMode::Subscriber => self.subscriber_base,
            ChannelMode::Request | ChannelMode::Response => self.request_response_base,
            ChannelMode::ProxyControlPublish | ChannelMode::ProxyControlSubscribe => {
                self.proxy_control_base
            }
        }
    }

    /// Port a `(mode, channel_type)` pair lives on.
    pub fn port(&self, mode: ChannelMode, channel_type: ChannelType) -> Result<u16> {
        validate_pairing(mode, channel_type)?;
        self.base_port(mode)
            .checked_add(channel_type.value())
            .ok_or_else(|| {
                BusError::InvalidChannelType(format!(
                    "{channel_type} overflows the {mode} port range"
                ))
            })
    }

    /// Transport address for a `(mode, channel_type)` pair.
    pub fn address(&self, mode: ChannelMode, channel_type: ChannelType) -> Result<String> {
        let port = self.port(mode, channel_type)?;
        Ok(format!("tcp://{}:{}", self.host, port))
    }
}

/// Transport address of a `(mode, channel_type)` pair in the default layout.
pub fn resolve_address(mode: ChannelMode, channel_type: ChannelType) -> Result<String> {
    PortLayout::default().address(mode, channel_type)
}
