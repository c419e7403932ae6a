//! Relay engine: the receive / peel / classify / delay / act loop shared by
//! mixes, providers and listening clients

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::mailbox::{Mailbox, MailboxConfig};
use super::protocol::{read_frame, write_frame, Flag, FlaggedFrame, PullResponse, PULL_BATCH_BYTES};
use crate::descriptor::ParticipantDescriptor;
use crate::identity::NodeKeys;
use crate::privacy::sphinx::{self, PeelResult, SphinxPacket};
use crate::registration::{PresenceRecord, RegistrationClient};
use crate::transport::PacketTransport;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the listener binds to
    pub listen_addr: String,
    /// Upper bound on reading one inbound frame
    pub read_timeout: Duration,
    /// Interval of the provider mailbox TTL sweep
    pub mailbox_sweep_interval: Duration,
    /// Presence / metrics registry, if any
    pub registry_url: Option<String>,
    /// Interval of metrics reports to the registry
    pub metrics_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            read_timeout: Duration::from_secs(10),
            mailbox_sweep_interval: Duration::from_secs(300),
            registry_url: None,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(RelayError::InvalidConfig(format!(
                "listen_addr {} is not a socket address",
                self.listen_addr
            )));
        }
        if self.read_timeout.is_zero() || self.mailbox_sweep_interval.is_zero() || self.metrics_interval.is_zero() {
            return Err(RelayError::InvalidConfig("intervals must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// What this participant does with packets that end here
pub enum Role {
    /// Only forwards; a packet ending at a mix is a protocol violation
    Mix,
    /// Stores delivered payloads until the recipient pulls them
    Provider { mailbox: Arc<Mailbox> },
    /// Accepts payloads addressed to `id` and hands them to `inbox`
    Client {
        id: String,
        inbox: mpsc::UnboundedSender<Vec<u8>>,
    },
}

impl Role {
    pub fn provider() -> Self {
        Role::Provider {
            mailbox: Arc::new(Mailbox::new()),
        }
    }

    pub fn provider_with_config(config: MailboxConfig) -> Self {
        Role::Provider {
            mailbox: Arc::new(Mailbox::with_config(config)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Role::Mix => "mix",
            Role::Provider { .. } => "provider",
            Role::Client { .. } => "client",
        }
    }
}

/// Per-relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    dropped_cover: AtomicU64,
    integrity_failures: AtomicU64,
    protocol_violations: AtomicU64,
    malformed: AtomicU64,
    abandoned: AtomicU64,
    pulls_served: AtomicU64,
}

/// Point-in-time copy of `RelayStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub dropped_cover: u64,
    pub integrity_failures: u64,
    pub protocol_violations: u64,
    pub malformed: u64,
    pub abandoned: u64,
    pub pulls_served: u64,
}

impl RelayStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_cover: self.dropped_cover.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            pulls_served: self.pulls_served.load(Ordering::Relaxed),
        }
    }
}

impl RelayStatsSnapshot {
    /// Counter map for the metrics endpoint
    pub fn to_counters(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("received".to_string(), self.received),
            ("forwarded".to_string(), self.forwarded),
            ("delivered".to_string(), self.delivered),
            ("droppedCover".to_string(), self.dropped_cover),
            ("integrityFailures".to_string(), self.integrity_failures),
            ("protocolViolations".to_string(), self.protocol_violations),
            ("malformed".to_string(), self.malformed),
            ("abandoned".to_string(), self.abandoned),
            ("pullsServed".to_string(), self.pulls_served),
        ])
    }
}

/// Terminal action scheduled after a hop delay
enum Action {
    Forward { next_hop: String, frame: FlaggedFrame },
    Deposit { recipient_id: String, payload: Vec<u8> },
    Hand { payload: Vec<u8> },
}

pub struct RelayEngine {
    descriptor: ParticipantDescriptor,
    keys: NodeKeys,
    role: Role,
    transport: Arc<dyn PacketTransport>,
    config: RelayConfig,
    stats: RelayStats,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new(
        descriptor: ParticipantDescriptor,
        keys: NodeKeys,
        role: Role,
        transport: Arc<dyn PacketTransport>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            descriptor,
            keys,
            role,
            transport,
            config,
            stats: RelayStats::default(),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ParticipantDescriptor {
        &self.descriptor
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Mailbox of a provider-role engine
    pub fn mailbox(&self) -> Option<&Arc<Mailbox>> {
        match &self.role {
            Role::Provider { mailbox } => Some(mailbox),
            _ => None,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Bind the listener and start the accept loop plus background tasks
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, RelayError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| RelayError::Bind {
                address: self.config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            address: self.config.listen_addr.clone(),
            source,
        })?;

        tracing::info!(
            "{} {} listening on {} (published as {})",
            self.role.name(),
            self.id(),
            local_addr,
            self.descriptor.address()
        );

        let mut tasks = vec![tokio::spawn(Arc::clone(self).accept_loop(listener))];
        if let Role::Provider { mailbox } = &self.role {
            tasks.push(tokio::spawn(mailbox_sweep(
                Arc::clone(mailbox),
                self.config.mailbox_sweep_interval,
                self.shutdown_rx.clone(),
            )));
        }
        if let Some(url) = &self.config.registry_url {
            let registry = RegistrationClient::new(url.clone());
            registry.spawn_presence(PresenceRecord::from_descriptor(&self.descriptor));
            tasks.push(tokio::spawn(Arc::clone(self).metrics_loop(registry)));
        }
        self.tasks.lock().extend(tasks);

        Ok(local_addr)
    }

    /// Stop accepting, abandon pending delayed actions and join background tasks
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("{} {} stopped: {:?}", self.role.name(), self.id(), self.stats());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = Arc::clone(&self);
                        tokio::spawn(async move { engine.handle_connection(stream, peer).await });
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("Accept loop of {} exited", self.id());
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let bytes = match timeout(self.config.read_timeout, read_frame(&mut stream)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                RelayStats::bump(&self.stats.malformed);
                tracing::warn!("Dropping frame from {}: {}", peer, e);
                return;
            }
            Err(_) => {
                RelayStats::bump(&self.stats.malformed);
                tracing::warn!("Timed out reading frame from {}", peer);
                return;
            }
        };

        if let Some(response) = self.handle_frame(&bytes).await {
            if let Err(e) = write_frame(&mut stream, &response).await {
                tracing::warn!("Failed to answer {}: {}", peer, e);
            }
        }
    }

    /// Process one inbound frame; returns the response for PULL requests
    pub async fn handle_frame(self: &Arc<Self>, bytes: &[u8]) -> Option<Vec<u8>> {
        RelayStats::bump(&self.stats.received);

        let frame = match FlaggedFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                RelayStats::bump(&self.stats.malformed);
                tracing::warn!("{}: malformed frame: {}", self.id(), e);
                return None;
            }
        };

        match frame.flag {
            Flag::Pull => self.handle_pull(&frame),
            Flag::Comm | Flag::Cover => {
                self.handle_packet(frame.flag, &frame.body).await;
                None
            }
        }
    }

    fn handle_pull(&self, frame: &FlaggedFrame) -> Option<Vec<u8>> {
        let Role::Provider { mailbox } = &self.role else {
            RelayStats::bump(&self.stats.protocol_violations);
            tracing::warn!("{}: PULL sent to a non-provider", self.id());
            return None;
        };
        let recipient = match frame.pull_recipient() {
            Ok(recipient) => recipient,
            Err(e) => {
                RelayStats::bump(&self.stats.malformed);
                tracing::warn!("{}: {}", self.id(), e);
                return None;
            }
        };

        let (payloads, remaining) = mailbox.retrieve_batch(recipient, PULL_BATCH_BYTES);
        let response = PullResponse {
            payloads,
            more: remaining > 0,
        };
        RelayStats::bump(&self.stats.pulls_served);
        tracing::debug!(
            "{}: serving {} payloads to {} ({} still queued)",
            self.id(),
            response.payloads.len(),
            recipient,
            remaining
        );
        match response.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!("{}: failed to encode pull response: {}", self.id(), e);
                None
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, flag: Flag, body: &[u8]) {
        let packet = match SphinxPacket::from_bytes(body) {
            Ok(packet) => packet,
            Err(_) => {
                RelayStats::bump(&self.stats.malformed);
                tracing::warn!("{}: packet of {} bytes has the wrong size", self.id(), body.len());
                return;
            }
        };

        let peeled = match sphinx::peel(&packet, self.keys.secret()) {
            Ok(peeled) => peeled,
            Err(e) if e.is_integrity_failure() => {
                RelayStats::bump(&self.stats.integrity_failures);
                tracing::warn!("{}: dropping packet that failed authentication", self.id());
                return;
            }
            Err(e) => {
                RelayStats::bump(&self.stats.protocol_violations);
                tracing::warn!("{}: dropping authenticated packet: {}", self.id(), e);
                return;
            }
        };

        let (delay, action) = match peeled {
            PeelResult::Forward {
                next_hop,
                delay,
                packet,
            } => (
                delay,
                Action::Forward {
                    next_hop,
                    frame: FlaggedFrame::new(flag, packet.to_bytes()),
                },
            ),
            PeelResult::Drop { .. } => {
                RelayStats::bump(&self.stats.dropped_cover);
                tracing::debug!("{}: drop cover reached its end", self.id());
                return;
            }
            PeelResult::Deliver { .. } if flag == Flag::Cover => {
                RelayStats::bump(&self.stats.dropped_cover);
                tracing::debug!("{}: discarding cover-flagged delivery", self.id());
                return;
            }
            PeelResult::Deliver {
                recipient_id,
                delay,
                payload,
            } => match &self.role {
                Role::Mix => {
                    RelayStats::bump(&self.stats.protocol_violations);
                    tracing::warn!("{}: mix asked to deliver to {}", self.id(), recipient_id);
                    return;
                }
                Role::Client { id, .. } if *id != recipient_id => {
                    RelayStats::bump(&self.stats.protocol_violations);
                    tracing::warn!("{}: delivery for foreign recipient {}", self.id(), recipient_id);
                    return;
                }
                Role::Client { .. } => (delay, Action::Hand { payload }),
                Role::Provider { .. } => (delay, Action::Deposit { recipient_id, payload }),
            },
        };

        if delay.is_zero() {
            self.act(action).await;
            return;
        }

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => engine.act(action).await,
                _ = shutdown.changed() => {
                    RelayStats::bump(&engine.stats.abandoned);
                    tracing::info!("{}: abandoned a pending action on shutdown", engine.id());
                }
            }
        });
    }

    async fn act(&self, action: Action) {
        match action {
            Action::Forward { next_hop, frame } => match self.transport.transmit(&next_hop, &frame).await {
                Ok(()) => {
                    RelayStats::bump(&self.stats.forwarded);
                    tracing::debug!("{}: forwarded to {}", self.id(), next_hop);
                }
                Err(e) => tracing::warn!("{}: forward to {} failed: {}", self.id(), next_hop, e),
            },
            Action::Deposit { recipient_id, payload } => {
                let Some(mailbox) = self.mailbox() else {
                    return;
                };
                match mailbox.deposit(&recipient_id, payload) {
                    Ok(()) => {
                        RelayStats::bump(&self.stats.delivered);
                        tracing::debug!("{}: stored payload for {}", self.id(), recipient_id);
                    }
                    Err(e) => tracing::warn!("{}: {}", self.id(), e),
                }
            }
            Action::Hand { payload } => {
                if let Role::Client { inbox, .. } = &self.role {
                    if inbox.send(payload).is_ok() {
                        RelayStats::bump(&self.stats.delivered);
                    } else {
                        tracing::warn!("{}: inbox receiver gone", self.id());
                    }
                }
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>, registry: RegistrationClient) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.config.metrics_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.spawn_metrics(self.stats().to_counters()),
                _ = shutdown.changed() => break,
            }
        }
    }
}

async fn mailbox_sweep(mailbox: Arc<Mailbox>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = mailbox.cleanup_expired();
                if removed > 0 {
                    tracing::info!("Mailbox sweep removed {} expired payloads", removed);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
