//! Plugin hooks and the per-message context handed to them.
//!
//! Plugins are registered on a [`Network`](crate::Network) in order; every
//! connect, disconnect and message event visits them in that order.

use crate::error::WireError;
use crate::message::{DecodedMessage, Message};
use crate::session::PeerSession;
use async_trait::async_trait;
use std::sync::Arc;

/// Higher-level peer behavior driven by session events.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        "plugin"
    }

    /// A session started its accept loop.
    async fn on_peer_connect(&self, _session: &Arc<PeerSession>) {}

    /// A session ended. Fires exactly once per session.
    async fn on_peer_disconnect(&self, _session: &Arc<PeerSession>) {}

    /// A verified message arrived.
    async fn on_message(&self, ctx: &PluginContext) -> Result<(), WireError>;
}

/// One verified inbound message plus a way to answer it.
pub struct PluginContext {
    session: Arc<PeerSession>,
    message: DecodedMessage,
    remote_id: Vec<u8>,
    timestamp: i64,
}

impl PluginContext {
    pub(crate) fn new(
        session: Arc<PeerSession>,
        message: DecodedMessage,
        remote_id: Vec<u8>,
        timestamp: i64,
    ) -> Self {
        Self {
            session,
            message,
            remote_id,
            timestamp,
        }
    }

    /// The payload as `T`, if that is its type.
    pub fn message<T: Message>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }

    pub fn decoded(&self) -> &DecodedMessage {
        &self.message
    }

    pub fn type_tag(&self) -> &str {
        self.message.type_tag()
    }

    /// Public key of the sender.
    pub fn remote_id(&self) -> &[u8] {
        &self.remote_id
    }

    pub fn remote_id_hex(&self) -> String {
        hex::encode(&self.remote_id)
    }

    /// Sender's signing time, nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The session the message arrived on.
    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    /// Send a message back over the originating session.
    pub async fn reply<T: Message>(&self, message: &T) -> Result<(), WireError> {
        self.session.send(message).await
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("session", &self.session.remote_address())
            .field("type_tag", &self.message.type_tag())
            .field("remote_id", &self.remote_id_hex())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
