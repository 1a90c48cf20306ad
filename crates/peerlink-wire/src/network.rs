//! The local node: listens for peers, dials peers, and owns the session table.

use crate::address::PeerAddress;
use crate::config::NetworkConfig;
use crate::error::WireError;
use crate::keyscheme::{Ed25519Scheme, KeyPair, KeyScheme, KeySchemeRegistry};
use crate::message::{Message, MessageRegistry};
use crate::plugin::{Plugin, PluginContext};
use crate::session::{PeerSession, SessionRole};
use crate::transport::{MuxConnection, MuxListener, TransportRegistry};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sessions and plugins, guarded together.
#[derive(Default)]
struct NetworkState {
    /// Keyed by remote transport address.
    sessions: HashMap<String, Arc<PeerSession>>,
    /// In registration order.
    plugins: Vec<Arc<dyn Plugin>>,
}

/// A node in the peer network.
pub struct Network {
    config: NetworkConfig,
    address: PeerAddress,
    keypair: KeyPair,
    key_schemes: KeySchemeRegistry,
    messages: MessageRegistry,
    transports: TransportRegistry,
    state: Mutex<NetworkState>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: Mutex<Option<SocketAddr>>,
    listening: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Network {
    /// A network bound to `address` (`<scheme>://<host>:<port>`) with default settings.
    pub fn new(address: &str, keypair: KeyPair) -> Result<Arc<Self>, WireError> {
        Self::with_config(NetworkConfig::with_listen_addr(address), keypair)
    }

    pub fn with_config(config: NetworkConfig, keypair: KeyPair) -> Result<Arc<Self>, WireError> {
        Self::with_transports(config, keypair, TransportRegistry::with_defaults())
    }

    /// Build from configuration alone, deriving the identity from
    /// `identity_seed` or generating a fresh one.
    pub fn from_config(config: NetworkConfig) -> Result<Arc<Self>, WireError> {
        let keypair = match &config.identity_seed {
            Some(seed) => Ed25519Scheme::keypair_from_seed(seed)?,
            None => Ed25519Scheme::generate(),
        };
        Self::with_config(config, keypair)
    }

    /// Full constructor with a caller-supplied transport registry.
    ///
    /// Fails if the listen address does not parse, names an unregistered
    /// transport, or the key pair's scheme is unknown.
    pub fn with_transports(
        config: NetworkConfig,
        keypair: KeyPair,
        transports: TransportRegistry,
    ) -> Result<Arc<Self>, WireError> {
        let address = PeerAddress::parse(&config.listen_addr)?;
        transports.get(&address.scheme)?;

        let key_schemes = KeySchemeRegistry::with_defaults();
        if !key_schemes.contains(keypair.scheme_id()) {
            return Err(WireError::UnknownKeyScheme(keypair.scheme_id().to_string()));
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            address,
            keypair,
            key_schemes,
            messages: MessageRegistry::new(),
            transports,
            state: Mutex::new(NetworkState::default()),
            local_addr: Mutex::new(None),
            listening: AtomicBool::new(false),
            shutdown,
        }))
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key()
    }

    pub fn key_schemes(&self) -> &KeySchemeRegistry {
        &self.key_schemes
    }

    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Register a message type so inbound payloads with its tag can be decoded.
    pub fn register_message<T: Message>(&self) {
        self.messages.register::<T>();
    }

    /// Register an additional signature scheme for inbound verification.
    pub fn register_key_scheme(&self, scheme: Arc<dyn KeyScheme>) {
        self.key_schemes.register(scheme);
    }

    /// Append a plugin. Sessions started after this call will notify it.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = plugin.name(), "Plugin registered");
        self.state().plugins.push(plugin);
    }

    pub(crate) fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.state().plugins.clone()
    }

    /// Our dialable address: `scheme://<hex public key>@<host>:<port>`.
    ///
    /// Reports the bound port once listening.
    pub fn address(&self) -> String {
        let mut address = self.address.with_peer_id(self.keypair.public_key());
        if let Some(bound) = self.local_addr() {
            address.port = bound.port();
        }
        address.to_string()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Bind the listen address and accept peers until [`close`](Self::close).
    ///
    /// Returns once bound; the handle completes when the accept loop stops.
    ///
    /// A closed network cannot listen again.
    pub async fn listen(self: &Arc<Self>) -> Result<JoinHandle<()>, WireError> {
        if *self.shutdown.borrow() {
            return Err(WireError::NetworkClosed);
        }
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(WireError::AlreadyListening);
        }

        let bound = async {
            let transport = self.transports.get(&self.address.scheme)?;
            let listener = transport.listen(&self.address.host_port()).await?;
            let local_addr = listener.local_addr()?;
            Ok::<_, WireError>((listener, local_addr))
        };
        let (listener, local_addr) = match bound.await {
            Ok(bound) => bound,
            Err(e) => {
                self.listening.store(false, Ordering::Release);
                return Err(e);
            }
        };

        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        info!(
            address = %self.address(),
            "Listening for peers"
        );

        let network = Arc::clone(self);
        Ok(tokio::spawn(async move {
            network.accept_loop(listener).await;
        }))
    }

    async fn accept_loop(self: Arc<Self>, listener: Box<dyn MuxListener>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        debug!(peer = %conn.remote_addr(), "Accepted connection");
                        self.attach(conn, SessionRole::Acceptor, None);
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
            }
        }
        self.listening.store(false, Ordering::Release);
        info!("Stopped listening");
    }

    /// Dial a peer and start a session with it.
    ///
    /// A public-key segment in `address` binds the session's peer identity;
    /// without one the session can receive nothing and send nothing.
    pub async fn new_session(self: &Arc<Self>, address: &str) -> Result<Arc<PeerSession>, WireError> {
        let target = PeerAddress::parse(address)?;
        let transport = self.transports.get(&target.scheme)?;
        let conn = transport.dial(&target.host_port()).await?;
        info!(peer = %target, "Connected to peer");
        Ok(self.attach(conn, SessionRole::Initiator, target.peer_id))
    }

    /// Register a session for `conn` and start its accept loop.
    ///
    /// A previous session for the same transport address is closed.
    fn attach(
        self: &Arc<Self>,
        conn: Arc<dyn MuxConnection>,
        role: SessionRole,
        peer_id: Option<Vec<u8>>,
    ) -> Arc<PeerSession> {
        let session = PeerSession::new(self, conn, role, &self.address.scheme, peer_id);
        let replaced = self
            .state()
            .sessions
            .insert(session.transport_addr().to_string(), Arc::clone(&session));
        if let Some(old) = replaced {
            warn!(peer = %old.remote_address(), "Replacing existing session");
            old.close();
        }
        session.start();
        session
    }

    /// Drop `session` from the table if it is still the registered one.
    pub(crate) fn close_session(&self, session: &PeerSession) {
        let mut state = self.state();
        let current = state
            .sessions
            .get(session.transport_addr())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if current {
            state.sessions.remove(session.transport_addr());
        }
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.state().sessions.values().cloned().collect()
    }

    /// Look up a session by remote transport address.
    pub fn session(&self, transport_addr: &str) -> Option<Arc<PeerSession>> {
        self.state().sessions.get(transport_addr).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Hand a verified message to every plugin in registration order.
    ///
    /// Stops early if the session closes part way through.
    pub(crate) async fn dispatch(&self, ctx: &PluginContext) {
        for plugin in self.plugins() {
            if ctx.session().is_closed() {
                break;
            }
            if let Err(e) = plugin.on_message(ctx).await {
                warn!(
                    plugin = plugin.name(),
                    type_tag = %ctx.type_tag(),
                    peer = %ctx.remote_id_hex(),
                    error = %e,
                    "Plugin failed to handle message"
                );
            }
        }
    }

    /// Stop listening and close every session.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.listening.store(false, Ordering::Release);
        let sessions: Vec<Arc<PeerSession>> = self.state().sessions.drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closing sessions");
        }
        for session in sessions {
            session.close();
        }
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("address", &self.address())
            .field("listening", &self.is_listening())
            .field("sessions", &self.session_count())
            .finish()
    }
}
