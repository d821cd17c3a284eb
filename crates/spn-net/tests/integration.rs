//! End-to-end tests over in-memory ship pairs

use spn_core::{ErrorKind, HubCache, HubInfoImporter, Identity};
use spn_net::ops::capacity::{measure_capacity, CapacityTestOpts};
use spn_net::ops::counter::{start_counter, CounterOpts};
use spn_net::ops::latency::{measure_latency, LatencyTestOpts};
use spn_net::{
    Crane, CraneEvent, Dock, NetConfig, OperationRegistry, TerminalOpts, TestShip, TestShipOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestHub {
    identity: Arc<Identity>,
    hubs: Arc<HubCache>,
    dock: Arc<Dock>,
}

fn hub(name: &str, config: NetConfig) -> TestHub {
    let identity = Arc::new(Identity::generate(name).unwrap());
    let hubs = Arc::new(HubCache::new());
    hubs.insert(identity.hub());
    let dock = Dock::new(
        config,
        hubs.clone(),
        Some(identity.clone()),
        Arc::new(OperationRegistry::with_defaults()),
    );
    TestHub {
        identity,
        hubs,
        dock,
    }
}

/// Connect `client` to `server` and start both cranes.
async fn connect(client: &TestHub, server: &TestHub, options: TestShipOptions) -> (Arc<Crane>, Arc<Crane>) {
    let (client_ship, server_ship) = TestShip::pair(options);
    let client_crane = Crane::new(
        client.dock.clone(),
        Arc::new(client_ship),
        Some(server.identity.hub()),
    );
    let server_crane = Crane::new(server.dock.clone(), Arc::new(server_ship), None);
    let (c, s) = tokio::join!(client_crane.start(), server_crane.start());
    c.unwrap();
    s.unwrap();
    (client_crane, server_crane)
}

#[tokio::test]
async fn test_loopback_counter() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let (crane, _peer) = connect(&a, &b, TestShipOptions::default()).await;

    let terminal = crane.new_terminal(None).await.unwrap();
    let counter = start_counter(
        &terminal,
        CounterOpts {
            client_count_to: 1000,
            server_count_to: 1000,
            wait_ms: 1,
        },
    )
    .await
    .unwrap();

    timeout(Duration::from_secs(30), counter.wait())
        .await
        .expect("counter timed out")
        .unwrap();
    assert_eq!(counter.sent(), 1000);
    assert_eq!(counter.received(), 1000);
    assert!(terminal.dfq().recv_queue_len() <= terminal.opts().queue_size as usize);
    assert!(!terminal.is_abandoned());
}

/// Count to `count` in both directions over one terminal at full speed.
/// Any queue overflow ends the counter with an error.
async fn counter_stress(count: u64, limit: Duration) {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let (crane, _peer) = connect(&a, &b, TestShipOptions::default()).await;

    let terminal = crane.new_terminal(None).await.unwrap();
    let counter = start_counter(
        &terminal,
        CounterOpts {
            client_count_to: count,
            server_count_to: count,
            wait_ms: 0,
        },
    )
    .await
    .unwrap();

    timeout(limit, counter.wait())
        .await
        .expect("counter timed out")
        .unwrap();
    assert_eq!(counter.received(), count);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_stress() {
    counter_stress(100_000, Duration::from_secs(120)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "slow; run with --ignored"]
async fn test_counter_stress_full() {
    counter_stress(1_000_000, Duration::from_secs(900)).await;
}

#[tokio::test]
async fn test_capacity() {
    init_tracing();
    let config = NetConfig {
        controller_queue_size: 10,
        ..NetConfig::default()
    };
    let a = hub("a", config);
    let b = hub("b", NetConfig::default());
    let delay = Duration::from_millis(50);
    let (crane, _peer) = connect(
        &a,
        &b,
        TestShipOptions {
            delay,
            ..Default::default()
        },
    )
    .await;

    let bits_per_second = measure_capacity(
        &crane,
        CapacityTestOpts {
            volume: 100_000,
            max_time_ms: 10_000,
        },
    )
    .await
    .unwrap();

    let ceiling = 1000.0 * 8.0 * 10.0 / delay.as_secs_f64();
    let ratio = bits_per_second as f64 / ceiling;
    assert!((0.2..=1.1).contains(&ratio), "capacity ratio {ratio}");
    assert_eq!(crane.lane_capacity(), Some(bits_per_second));
    assert!(crane.lane_capacity_expires_at().is_some());
}

#[tokio::test]
async fn test_latency() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let (crane, _peer) = connect(
        &a,
        &b,
        TestShipOptions {
            delay: Duration::from_millis(10),
            ..Default::default()
        },
    )
    .await;

    let latency = measure_latency(
        &crane,
        LatencyTestOpts {
            rounds: 10,
            pause_ms: 10,
        },
    )
    .await
    .unwrap();
    assert!(latency >= Duration::from_millis(10), "latency {latency:?}");
    assert!(latency <= Duration::from_millis(30), "latency {latency:?}");
    assert_eq!(crane.lane_latency(), Some(latency));
}

async fn expansion_hubs() -> (TestHub, TestHub, TestHub, Arc<Crane>) {
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::public());
    let c = hub("c", NetConfig::default());

    // C publishes itself to B, so B can relay to C.
    let (c_crane, _) = connect(&c, &b, TestShipOptions::default()).await;
    c_crane.publish().await.unwrap();
    assert!(c_crane.is_public());
    assert!(c_crane.is_authenticated());
    assert!(b.dock.cranes.get_assigned(&c.identity.id()).is_some());

    let (a_crane, _) = connect(&a, &b, TestShipOptions::default()).await;
    (a, b, c, a_crane)
}

#[tokio::test]
async fn test_publish_rejects_wrong_hub() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let other = hub("other", NetConfig::default());

    // A thinks it reached `other`, but the ship leads to B.
    let (client_ship, server_ship) = TestShip::pair(TestShipOptions::default());
    let client = Crane::new(a.dock.clone(), Arc::new(client_ship), Some(other.identity.hub()));
    let server = Crane::new(b.dock.clone(), Arc::new(server_ship), None);
    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();
    assert!(!client.is_authenticated());

    let err = timeout(Duration::from_secs(5), client.publish())
        .await
        .expect("publish timed out")
        .unwrap_err();
    assert!(err.is(ErrorKind::Integrity), "{err}");
    assert!(!client.is_authenticated());
    assert!(!client.is_public());
    assert!(a.dock.cranes.get_assigned(&other.identity.id()).is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!server.is_public());
    assert!(b.dock.cranes.get_assigned(&a.identity.id()).is_none());
}

#[tokio::test]
async fn test_expansion() {
    init_tracing();
    let (_a, _b, c, a_crane) = expansion_hubs().await;

    let home = a_crane.new_terminal(None).await.unwrap();
    let expanded = home.expand(&c.identity.hub(), None).await.unwrap();
    let counter = start_counter(
        &expanded,
        CounterOpts {
            client_count_to: 100,
            server_count_to: 100,
            wait_ms: 0,
        },
    )
    .await
    .unwrap();
    timeout(Duration::from_secs(10), counter.wait())
        .await
        .expect("counter timed out")
        .unwrap();
    assert_eq!(counter.received(), 100);
    assert!(!home.is_abandoned());
}

#[tokio::test]
async fn test_encrypted_expansion() {
    init_tracing();
    let (_a, _b, c, a_crane) = expansion_hubs().await;

    let home = a_crane.new_terminal(None).await.unwrap();
    let opts = TerminalOpts {
        queue_size: 20,
        padding: 8,
        encrypt: true,
    };
    let expanded = home.expand(&c.identity.hub(), Some(opts)).await.unwrap();
    assert!(expanded.is_encrypted());
    let counter = start_counter(
        &expanded,
        CounterOpts {
            client_count_to: 100,
            server_count_to: 50,
            wait_ms: 0,
        },
    )
    .await
    .unwrap();
    timeout(Duration::from_secs(10), counter.wait())
        .await
        .expect("counter timed out")
        .unwrap();
    assert_eq!(counter.received(), 50);
}

#[tokio::test]
async fn test_expansion_to_unknown_hub() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::public());
    let nowhere = Identity::generate("nowhere").unwrap();
    let (a_crane, _) = connect(&a, &b, TestShipOptions::default()).await;

    let home = a_crane.new_terminal(None).await.unwrap();
    let expanded = home.expand(&nowhere.hub(), None).await.unwrap();
    timeout(Duration::from_secs(5), expanded.ctx().cancelled())
        .await
        .expect("expansion was not refused");
    assert!(expanded.is_abandoned());
    assert!(!home.is_abandoned());
}

#[tokio::test]
async fn test_encryption_handshake() {
    init_tracing();
    let server = hub("server", NetConfig::default());
    let client_hubs = Arc::new(HubCache::new());
    let client_dock = Dock::new(
        NetConfig::default(),
        client_hubs.clone(),
        None,
        Arc::new(OperationRegistry::with_defaults()),
    );

    let (client_ship, server_ship) = TestShip::pair(TestShipOptions {
        delay: Duration::from_millis(5),
        secure: false,
        ..Default::default()
    });
    let client = Crane::new(client_dock, Arc::new(client_ship), None);
    let peer = Crane::new(server.dock.clone(), Arc::new(server_ship), None);

    let (c, s) = timeout(Duration::from_secs(1), async {
        tokio::join!(client.start(), peer.start())
    })
    .await
    .expect("handshake timed out");
    c.unwrap();
    s.unwrap();

    assert!(client.is_authenticated());
    assert_eq!(client.connected_hub().unwrap().id, server.identity.id());
    assert!(client_hubs.get_hub(&server.identity.id()).is_some());

    let terminal = client.new_terminal(None).await.unwrap();
    let counter = start_counter(
        &terminal,
        CounterOpts {
            client_count_to: 200,
            server_count_to: 200,
            wait_ms: 0,
        },
    )
    .await
    .unwrap();
    timeout(Duration::from_secs(10), counter.wait())
        .await
        .expect("counter timed out")
        .unwrap();
}

#[tokio::test]
async fn test_gossip_query() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let c = hub("c", NetConfig::default());
    b.hubs.insert(c.identity.hub());

    let (crane, _) = connect(&a, &b, TestShipOptions::default()).await;
    let imported = crane.query_gossip().await.unwrap();
    // Announcement and status of both b and c.
    assert_eq!(imported, 4);
    assert!(a.hubs.get_hub(&c.identity.id()).is_some());
}

#[tokio::test]
async fn test_gossip_forwarding() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let c = hub("c", NetConfig::default());

    let (a_crane, _) = connect(&a, &b, TestShipOptions::default()).await;
    let (c_crane, _) = connect(&c, &b, TestShipOptions::default()).await;
    a_crane.start_gossip().await.unwrap();
    c_crane.start_gossip().await.unwrap();

    // C's publish imports C at B, which gossips it on to A.
    c_crane.publish().await.unwrap();
    timeout(Duration::from_secs(5), async {
        while a.hubs.get_hub(&c.identity.id()).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hub was not gossiped");
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let (crane, peer) = connect(&a, &b, TestShipOptions::default()).await;
    let mut events = a.dock.subscribe();

    for _ in 0..3 {
        crane.stop(None);
    }

    let mut stopped = 0;
    let _ = timeout(Duration::from_millis(500), async {
        while let Ok(event) = events.recv().await {
            if let CraneEvent::Stopped { crane_id, .. } = event {
                assert_eq!(crane_id, crane.id());
                stopped += 1;
            }
        }
    })
    .await;
    assert_eq!(stopped, 1);
    assert!(crane.is_stopped());
    assert!(a.dock.cranes.is_empty());

    timeout(Duration::from_secs(2), peer.ctx().cancelled())
        .await
        .expect("peer crane kept running");

    let err = crane.new_terminal(None).await.unwrap_err();
    assert!(err.is(ErrorKind::Stopping));
}

#[tokio::test]
async fn test_mark_stopping_drains() {
    init_tracing();
    let a = hub("a", NetConfig::default());
    let b = hub("b", NetConfig::default());
    let (crane, _peer) = connect(&a, &b, TestShipOptions::default()).await;

    let terminal = crane.new_terminal(None).await.unwrap();
    terminal.flush(Duration::from_secs(1)).await.unwrap();
    crane.mark_stopping();
    assert!(crane.is_stopping());
    assert!(!crane.is_stopped());

    // Abandoning the last data terminal lets the crane stop.
    terminal.abandon(ErrorKind::Stopping.with("done"));
    timeout(Duration::from_secs(2), crane.ctx().cancelled())
        .await
        .expect("crane did not stop after draining");
    assert!(crane.is_stopped());
}
