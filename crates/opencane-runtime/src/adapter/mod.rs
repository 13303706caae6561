//! Transport adapters.
//!
//! An adapter terminates one southbound transport and speaks canonical
//! envelopes to the runtime: an event stream in, a command sink out. The
//! runtime never sees topics, sockets, or framing; adapters never dedup or
//! sequence (that is the runtime's job).

pub mod mock;
pub mod mqtt;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use opencane_protocol::Envelope;

use crate::error::RuntimeError;

/// Capability set every transport variant implements.
///
/// `start` hands back the inbound event stream: a lazy, infinite sequence
/// that can only be taken once and ends when the adapter stops.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn transport(&self) -> &'static str;

    async fn start(&self) -> Result<mpsc::Receiver<Envelope>, RuntimeError>;
    async fn stop(&self);

    /// Non-blocking enqueue onto the adapter's bounded output queue.
    /// `TransportBackpressure` when the queue is full, `Transport` when the
    /// device is offline — either way the caller keeps the command for
    /// replay.
    fn send_command(&self, command: Envelope) -> Result<(), RuntimeError>;

    /// Whether the transport currently considers this device reachable.
    fn is_device_online(&self, device_id: &str) -> bool;

    async fn close_session(&self, device_id: &str, session_id: &str, reason: &str);
}

/// Inbound fan-in capacity shared by all adapters.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Bounded outbound queue per adapter.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 256;
