// Integration test: a complete mix network over real TCP
//
// Three mixes and one provider run as relay engines on localhost. Alice and
// Bob are clients of the provider. Verifies that:
// - a message crosses the mixes and lands in Bob's mailbox
// - loop cover comes back to Alice and is never surfaced as a message
// - a tampered packet is dropped by the first mix
// - a mailbox backlog larger than one frame is fetched completely

use loopmix_core::client::{ClientConfig, ClientPayload, ClientPipeline, ReceivedMessage};
use loopmix_core::descriptor::ParticipantKind;
use loopmix_core::identity::NodeKeys;
use loopmix_core::privacy::CoverTrafficPolicy;
use loopmix_core::relay::{FlaggedFrame, RelayConfig, RelayEngine, Role};
use loopmix_core::store::{Directory, MemoryStorage, StorageDirectory};
use loopmix_core::topology::{Topology, TopologyHandle};
use loopmix_core::transport::{PacketTransport, TcpTransport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HOST: &str = "127.0.0.1";

fn free_port() -> u16 {
    std::net::TcpListener::bind((HOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Network {
    engines: HashMap<String, Arc<RelayEngine>>,
    directory: Arc<StorageDirectory>,
    client_keys: HashMap<String, NodeKeys>,
}

impl Network {
    async fn start() -> Self {
        let directory = Arc::new(StorageDirectory::new(Arc::new(MemoryStorage::new())));
        let transport: Arc<dyn PacketTransport> = Arc::new(TcpTransport::new());
        let mut engines = HashMap::new();

        let mut nodes = vec![("p1".to_string(), ParticipantKind::Provider)];
        for i in 0..3 {
            nodes.push((format!("mix{i}"), ParticipantKind::Mix));
        }

        for (layer, (id, kind)) in nodes.into_iter().enumerate() {
            let port = free_port();
            let keys = NodeKeys::generate();
            let descriptor = keys
                .descriptor(id.clone(), kind, HOST, port.to_string())
                .with_layer(layer as u32);
            directory.put(&descriptor).unwrap();

            let role = match kind {
                ParticipantKind::Provider => Role::provider(),
                _ => Role::Mix,
            };
            let config = RelayConfig {
                listen_addr: descriptor.address(),
                ..Default::default()
            };
            let engine = RelayEngine::new(descriptor, keys, role, Arc::clone(&transport), config);
            engine.start().await.unwrap();
            engines.insert(id, engine);
        }

        let mut client_keys = HashMap::new();
        for id in ["alice", "bob"] {
            let keys = NodeKeys::generate();
            let descriptor = keys
                .descriptor(id, ParticipantKind::Client, HOST, "0")
                .with_provider("p1");
            directory.put(&descriptor).unwrap();
            client_keys.insert(id.to_string(), keys);
        }

        println!("✓ Network started: {} relays", engines.len());
        Self {
            engines,
            directory,
            client_keys,
        }
    }

    fn client(&self, id: &str, policy: CoverTrafficPolicy) -> (ClientPipeline, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let topology = Topology::load(self.directory.as_ref()).unwrap();
        let config = ClientConfig {
            id: id.to_string(),
            host: HOST.to_string(),
            provider_id: "p1".to_string(),
            policy,
            fetch_enabled: false,
            ..Default::default()
        };
        ClientPipeline::start(
            config,
            self.client_keys[id].clone(),
            Arc::new(TcpTransport::new()),
            TopologyHandle::new(topology),
            None,
        )
        .unwrap()
    }

    fn engine_at(&self, address: &str) -> &Arc<RelayEngine> {
        self.engines
            .values()
            .find(|e| e.descriptor().address() == address)
            .unwrap()
    }

    async fn shutdown(self) {
        for engine in self.engines.values() {
            engine.shutdown().await;
        }
    }
}

/// Cover off, short mixing delays
fn quiet_policy() -> CoverTrafficPolicy {
    CoverTrafficPolicy {
        desired_rate: 200.0,
        ..CoverTrafficPolicy::disabled()
    }
}

/// Fetch until at least `want` messages surfaced or the attempts run out
async fn fetch_until(client: &ClientPipeline, want: usize) -> usize {
    let mut total = 0;
    for _ in 0..100 {
        total += client.fetch_now().await.unwrap();
        if total >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    total
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_delivery_through_mixes() {
    let net = Network::start().await;
    let (alice, _alice_inbox) = net.client("alice", quiet_policy());
    let (bob, mut bob_inbox) = net.client("bob", quiet_policy());

    alice.send(b"hello bob", "bob").await.unwrap();
    println!("✓ Alice sent a message");

    assert_eq!(fetch_until(&bob, 1).await, 1);
    let received = bob_inbox.recv().await.unwrap();
    assert_eq!(received.sender, "alice");
    assert_eq!(received.body, b"hello bob");
    println!("✓ Bob received it from his provider");

    let provider = &net.engines["p1"];
    assert_eq!(provider.stats().delivered, 1);
    assert_eq!(provider.mailbox().unwrap().pending_for("bob"), 0);
    let forwarded = || -> u64 {
        net.engines
            .iter()
            .filter(|(id, _)| id.starts_with("mix"))
            .map(|(_, e)| e.stats().forwarded)
            .sum()
    };
    for _ in 0..50 {
        if forwarded() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(forwarded(), 2);

    alice.shutdown().await;
    bob.shutdown().await;
    net.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cover_traffic_never_surfaces() {
    let net = Network::start().await;
    let (alice, mut alice_inbox) = net.client(
        "alice",
        CoverTrafficPolicy {
            loop_enabled: true,
            drop_enabled: true,
            rate_compliant_enabled: false,
            desired_rate: 50.0,
        },
    );
    let (bob, mut bob_inbox) = net.client("bob", quiet_policy());

    tokio::time::sleep(Duration::from_millis(500)).await;
    alice.reconfigure(quiet_policy()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = alice.stats();
    assert!(stats.loop_sent > 0, "no loop cover sent");
    assert!(stats.drop_sent > 0, "no drop cover sent");

    assert_eq!(alice.fetch_now().await.unwrap(), 0);
    assert_eq!(bob.fetch_now().await.unwrap(), 0);
    assert!(alice_inbox.try_recv().is_err());
    assert!(bob_inbox.try_recv().is_err());
    assert!(alice.stats().loop_returned > 0);
    println!("✓ {} loops returned, none surfaced", alice.stats().loop_returned);

    let dropped: u64 = net.engines.values().map(|e| e.stats().dropped_cover).sum();
    assert!(dropped > 0);

    alice.shutdown().await;
    bob.shutdown().await;
    net.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tampered_packet_rejected_at_first_hop() {
    let net = Network::start().await;
    let (alice, _alice_inbox) = net.client("alice", quiet_policy());
    let (bob, mut bob_inbox) = net.client("bob", quiet_policy());

    let packet = alice.encode_frame(b"tampered", "bob").unwrap();
    let mut body = packet.frame.body.clone();
    body[100] ^= 0x01;
    TcpTransport::new()
        .transmit(&packet.address, &FlaggedFrame::comm(body))
        .await
        .unwrap();

    let entry = net.engine_at(&packet.address);
    for _ in 0..100 {
        if entry.stats().integrity_failures == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(entry.stats().integrity_failures, 1);
    assert_eq!(entry.stats().forwarded, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.fetch_now().await.unwrap(), 0);
    assert!(bob_inbox.try_recv().is_err());
    println!("✓ Tampered packet dropped by {}", entry.id());

    alice.shutdown().await;
    bob.shutdown().await;
    net.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mailbox_backlog_fetched_completely() {
    let net = Network::start().await;
    let (bob, mut bob_inbox) = net.client("bob", quiet_policy());

    let bob_key = net.client_keys["bob"].public_key();
    let mailbox = net.engines["p1"].mailbox().unwrap();
    let mut rng = rand::rngs::OsRng;
    for i in 0..100 {
        let sealed = ClientPayload::Message {
            sender: "alice".to_string(),
            body: format!("backlog {i}").into_bytes(),
        }
        .seal(&bob_key, &mut rng)
        .unwrap();
        mailbox.deposit("bob", sealed).unwrap();
    }

    // Several times what one pull response frame can carry
    assert_eq!(bob.fetch_now().await.unwrap(), 100);
    assert_eq!(mailbox.pending_for("bob"), 0);
    for i in 0..100 {
        let message = bob_inbox.recv().await.unwrap();
        assert_eq!(message.body, format!("backlog {i}").into_bytes());
    }
    println!("✓ Bob fetched a 100 message backlog");

    bob.shutdown().await;
    net.shutdown().await;
}
