//! Peerlink session layer: authenticated, multiplexed peer connections.
//!
//! Nodes are identified by public keys. Every application message travels in
//! a signed [`Envelope`] over its own logical stream of a multiplexed
//! transport connection, and is verified before it reaches any plugin.
//!
//! ## Architecture
//!
//! - **Network**: owns this node's key pair, the key scheme registry, the
//!   session table and the ordered plugin list
//! - **PeerSession**: one multiplexed connection to one remote peer
//! - **Envelope**: the signed, addressed wire unit (see [`message`])
//! - **Plugin**: connect/disconnect/message hooks driven by the network
//! - **Transport**: scheme-keyed dial/listen returning multiplexed connections

pub mod address;
pub mod config;
pub mod error;
pub mod keyscheme;
pub mod message;
pub mod network;
pub mod plugin;
pub mod session;
pub mod transport;

pub use address::PeerAddress;
pub use config::{load_config, NetworkConfig};
pub use error::WireError;
pub use keyscheme::{Ed25519Scheme, KeyPair, KeyScheme, KeySchemeRegistry};
pub use message::{Envelope, Message, MessageRegistry, Payload, MAX_MESSAGE_SIZE};
pub use network::Network;
pub use plugin::{Plugin, PluginContext};
pub use session::{PeerSession, SessionRole};
pub use transport::{MuxConnection, MuxListener, MuxStream, Transport, TransportRegistry};
