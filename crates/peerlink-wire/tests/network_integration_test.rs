//! End-to-end tests: two real networks on loopback TCP exchanging signed
//! messages through plugins.

use async_trait::async_trait;
use peerlink_wire::{
    Ed25519Scheme, Message, Network, PeerSession, Plugin, PluginContext, SessionRole, WireError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

impl Message for Ping {
    const TYPE_TAG: &'static str = "demo.ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

impl Message for Pong {
    const TYPE_TAG: &'static str = "demo.pong";
}

/// Answers every Ping with a Pong and counts both.
#[derive(Default)]
struct PingPong {
    pings: AtomicUsize,
    pongs: AtomicUsize,
}

#[async_trait]
impl Plugin for PingPong {
    fn name(&self) -> &str {
        "ping-pong"
    }

    async fn on_message(&self, ctx: &PluginContext) -> Result<(), WireError> {
        if let Some(ping) = ctx.message::<Ping>() {
            self.pings.fetch_add(1, Ordering::SeqCst);
            ctx.reply(&Pong { seq: ping.seq }).await?;
        } else if ctx.message::<Pong>().is_some() {
            self.pongs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Records every event with its own label, to check plugin ordering.
struct EventLog {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for EventLog {
    fn name(&self) -> &str {
        self.label
    }

    async fn on_peer_connect(&self, _session: &Arc<PeerSession>) {
        self.events.lock().unwrap().push(format!("{}:connect", self.label));
    }

    async fn on_peer_disconnect(&self, _session: &Arc<PeerSession>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:disconnect", self.label));
    }

    async fn on_message(&self, ctx: &PluginContext) -> Result<(), WireError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, ctx.type_tag()));
        Ok(())
    }
}

/// Always fails; later plugins must still run.
struct Failing;

#[async_trait]
impl Plugin for Failing {
    async fn on_message(&self, _ctx: &PluginContext) -> Result<(), WireError> {
        Err(WireError::Codec("refused".into()))
    }
}

async fn start_node() -> (Arc<Network>, Arc<PingPong>) {
    let network = Network::new("tcp://127.0.0.1:0", Ed25519Scheme::generate()).unwrap();
    network.register_message::<Ping>();
    network.register_message::<Pong>();
    let plugin = Arc::new(PingPong::default());
    network.add_plugin(plugin.clone());
    network.listen().await.unwrap();
    (network, plugin)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_listen_and_dial() {
    let (n1, _) = start_node().await;
    let (n2, _) = start_node().await;

    let session = n2.new_session(&n1.address()).await.unwrap();
    assert_eq!(session.role(), SessionRole::Initiator);
    assert!(session.remote_address().starts_with("tcp://"));
    assert!(session
        .remote_address()
        .contains(&hex::encode(n1.public_key())));

    wait_for(|| n1.session_count() == 1).await;
    assert_eq!(n1.session_count(), 1);
    assert_eq!(n2.session_count(), 1);

    n1.close();
    n2.close();
}

#[tokio::test]
async fn test_ping_pong_single() {
    let (n1, p1) = start_node().await;
    let (n2, p2) = start_node().await;

    let session = n2.new_session(&n1.address()).await.unwrap();
    session.send(&Ping { seq: 1 }).await.unwrap();

    wait_for(|| p2.pongs.load(Ordering::SeqCst) == 1).await;
    assert_eq!(p1.pings.load(Ordering::SeqCst), 1);
    assert_eq!(p2.pongs.load(Ordering::SeqCst), 1);
    assert_eq!(p1.pongs.load(Ordering::SeqCst), 0);
    assert_eq!(p2.pings.load(Ordering::SeqCst), 0);

    // The acceptor learned the initiator's identity from the first message.
    let inbound = n1.sessions();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].peer_id(), Some(n2.public_key()));

    n1.close();
    n2.close();
}

#[tokio::test]
async fn test_ping_pong_repeated() {
    let (n1, p1) = start_node().await;
    let (n2, p2) = start_node().await;

    let session = n2.new_session(&n1.address()).await.unwrap();
    for seq in 0..3 {
        session.send(&Ping { seq }).await.unwrap();
    }

    wait_for(|| p2.pongs.load(Ordering::SeqCst) == 3).await;
    assert_eq!(p1.pings.load(Ordering::SeqCst), 3);
    assert_eq!(p2.pongs.load(Ordering::SeqCst), 3);

    n1.close();
    n2.close();
}

#[tokio::test]
async fn test_bidirectional_after_binding() {
    let (n1, p1) = start_node().await;
    let (n2, p2) = start_node().await;

    let session = n2.new_session(&n1.address()).await.unwrap();
    session.send(&Ping { seq: 7 }).await.unwrap();
    wait_for(|| p1.pings.load(Ordering::SeqCst) == 1).await;

    // Once bound, the acceptor can start its own exchanges.
    let inbound = n1.sessions().pop().unwrap();
    inbound.send(&Ping { seq: 8 }).await.unwrap();
    wait_for(|| p1.pongs.load(Ordering::SeqCst) == 1).await;

    assert_eq!(p2.pings.load(Ordering::SeqCst), 1);
    assert_eq!(p1.pongs.load(Ordering::SeqCst), 1);
    assert_eq!(p2.pongs.load(Ordering::SeqCst), 1);

    n1.close();
    n2.close();
}

#[tokio::test]
async fn test_plugins_run_in_registration_order() {
    let n1 = Network::new("tcp://127.0.0.1:0", Ed25519Scheme::generate()).unwrap();
    n1.register_message::<Ping>();
    let events = Arc::new(Mutex::new(Vec::new()));
    n1.add_plugin(Arc::new(EventLog {
        label: "a",
        events: events.clone(),
    }));
    n1.add_plugin(Arc::new(Failing));
    n1.add_plugin(Arc::new(EventLog {
        label: "b",
        events: events.clone(),
    }));
    n1.listen().await.unwrap();

    let n2 = Network::new("tcp://127.0.0.1:0", Ed25519Scheme::generate()).unwrap();
    let session = n2.new_session(&n1.address()).await.unwrap();
    session.send(&Ping { seq: 0 }).await.unwrap();
    wait_for(|| events.lock().unwrap().len() == 4).await;

    session.close();
    wait_for(|| events.lock().unwrap().len() == 6).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "a:connect",
            "b:connect",
            "a:demo.ping",
            "b:demo.ping",
            "a:disconnect",
            "b:disconnect",
        ]
    );

    n1.close();
    n2.close();
}

#[tokio::test]
async fn test_network_close_ends_sessions() {
    let (n1, _) = start_node().await;
    let (n2, _) = start_node().await;

    let session = n2.new_session(&n1.address()).await.unwrap();
    wait_for(|| n1.session_count() == 1).await;

    n1.close();
    wait_for(|| session.is_closed()).await;
    assert!(session.is_closed());
    assert_eq!(n1.session_count(), 0);
    assert_eq!(n2.session_count(), 0);

    // No longer listening: a fresh dial is refused.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(n2.new_session(&n1.address()).await.is_err());

    n2.close();
}
