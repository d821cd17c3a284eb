//! hubd server - main service loop

use crate::config::Config;
use spn_core::{HubCache, Identity};
use spn_net::ops::gossip::{self, GossipMsgType};
use spn_net::ops::latency::{self, LatencyTestOpts};
use spn_net::{Crane, CraneEvent, Dock, OperationRegistry, TcpShip};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SPN error: {0}")]
    Spn(#[from] spn_core::Error),
}

/// Server state
pub struct Server {
    config: Config,
    identity: Arc<Identity>,
    dock: Arc<Dock>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance with a fresh identity
    pub fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        let identity = Arc::new(Identity::generate(config.name.clone())?);

        let hubs = Arc::new(HubCache::new());
        hubs.insert(identity.hub());

        let dock = Dock::new(
            config.net_config(),
            hubs,
            Some(identity.clone()),
            Arc::new(OperationRegistry::with_defaults()),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            identity,
            dock,
            shutdown_tx,
        }))
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn dock(&self) -> &Arc<Dock> {
        &self.dock
    }

    /// Run the server until shutdown
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        info!(
            "Starting hubd {} ({}) on {}",
            self.identity.id(),
            self.config.name,
            self.config.listen
        );

        let events_handle = self.spawn_event_logger();
        let rotate_handle = self.spawn_key_rotation_task();
        let measure_handle = self.spawn_measure_task();

        for addr in self.config.bootstrap.clone() {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.dial(addr).await {
                    warn!("Bootstrap hub {} failed: {}", addr, e);
                }
            });
        }

        let listener = TcpListener::bind(&self.config.listen).await?;
        info!("Listening on {}", self.config.listen);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    warn!("Crane from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        events_handle.abort();
        rotate_handle.abort();
        measure_handle.abort();
        for crane in self.dock.cranes.all() {
            crane.stop(None);
        }
        Ok(())
    }

    /// Run a crane on an accepted connection.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        let ship = TcpShip::from_stream(stream, false)?;
        let crane = Crane::new(self.dock.clone(), Arc::new(ship), None);
        crane.start().await?;
        Ok(())
    }

    /// Dial a hub, publish ourselves to it and start gossiping.
    async fn dial(&self, addr: SocketAddr) -> Result<(), ServerError> {
        info!("Dialing bootstrap hub {}", addr);
        let ship = TcpShip::connect(addr).await?;
        let crane = Crane::new(self.dock.clone(), Arc::new(ship), None);
        crane.start().await?;
        crane.publish().await?;
        crane.start_gossip().await?;
        let imported = crane.query_gossip().await?;
        info!("Crane {} to {} is up, imported {} hub messages", crane.id(), addr, imported);
        Ok(())
    }

    /// Log crane lifecycle changes
    fn spawn_event_logger(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.dock.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CraneEvent::Started { crane_id, hub }) => {
                        info!("Crane {} started (hub {:?})", crane_id, hub.map(|h| h.to_string()));
                    }
                    Ok(CraneEvent::Public { crane_id, hub }) => {
                        info!("Crane {} is the lane to {}", crane_id, hub);
                    }
                    Ok(CraneEvent::Stopped { crane_id, .. }) => {
                        info!("Crane {} stopped", crane_id);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} crane events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Rotate our exchange key and gossip the new status
    fn spawn_key_rotation_task(&self) -> tokio::task::JoinHandle<()> {
        let identity = self.identity.clone();
        let dock = self.dock.clone();
        let period = Duration::from_secs(self.config.key_rotation_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match identity.rotate_exchange_key() {
                    Ok(key) => {
                        let status = identity.status_blob();
                        if let Err(e) = dock.hubs.import_hub_info(None, Some(&status)) {
                            warn!("Failed to import own status: {}", e);
                        }
                        let sent = gossip::broadcast(&dock, GossipMsgType::Status, &status, None);
                        info!("Rotated exchange key to {}, gossiped to {} cranes", key.id, sent);
                    }
                    Err(e) => error!("Exchange key rotation failed: {}", e),
                }
            }
        })
    }

    /// Measure latency of public lanes whose measurement expired
    fn spawn_measure_task(&self) -> tokio::task::JoinHandle<()> {
        let dock = self.dock.clone();
        let period = Duration::from_secs(self.config.measure_interval_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                for crane in dock.cranes.assigned() {
                    if crane.lane_latency().is_some() || !crane.ship().is_mine() {
                        continue;
                    }
                    if let Err(e) = latency::measure_latency(&crane, LatencyTestOpts::default()).await {
                        debug!("Latency test on crane {} failed: {}", crane.id(), e);
                    }
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
