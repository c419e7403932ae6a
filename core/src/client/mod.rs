//! Client pipeline: merges real messages and cover traffic into one outbound
//! stream and retrieves the client's mailbox

pub mod builder;
pub mod cover;
pub mod payload;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::crypto::SealError;
use crate::descriptor::{ParticipantDescriptor, ParticipantKind};
use crate::identity::NodeKeys;
use crate::privacy::circuit::PathError;
use crate::privacy::cover::{CoverError, CoverTrafficPolicy};
use crate::privacy::sphinx::{SphinxError, MAX_HOPS};
use crate::privacy::timing::DelayError;
use crate::relay::protocol::{FlaggedFrame, FrameError, PullResponse};
use crate::relay::{RelayConfig, RelayEngine, RelayError, Role};
use crate::store::Directory;
use crate::topology::TopologyHandle;
use crate::transport::{PacketTransport, TransportError};

pub use builder::{OutboundPacket, PacketBuilder};
pub use cover::CoverTrafficGenerator;
pub use payload::{ClientPayload, ReceivedMessage};

/// Upper bound on PULL round trips in one fetch
const MAX_PULLS_PER_FETCH: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("Path selection failed: {0}")]
    Path(#[from] PathError),
    #[error("Delay sampling failed: {0}")]
    Delay(#[from] DelayError),
    #[error("Packet encoding failed: {0}")]
    Encoding(#[from] SphinxError),
    #[error("Sealing failed: {0}")]
    Seal(#[from] SealError),
    #[error("Invalid payload: {0}")]
    Payload(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Listener error: {0}")]
    Relay(#[from] RelayError),
    #[error("Client is shut down")]
    Shutdown,
}

impl From<CoverError> for ClientError {
    fn from(e: CoverError) -> Self {
        ClientError::InvalidConfig(e.to_string())
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub id: String,
    /// Host published in the client descriptor
    pub host: String,
    pub port: String,
    /// Provider holding this client's mailbox
    pub provider_id: String,
    /// Mixes on every path, before the terminal node
    pub hop_count: usize,
    /// Initial cover policy; its `desired_rate` also drives per-hop delays
    pub policy: CoverTrafficPolicy,
    /// Periodically pull the mailbox from the provider
    pub fetch_enabled: bool,
    pub fetch_interval: Duration,
    /// Reload topology from the directory at this interval (when one is given)
    pub topology_refresh_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            host: "127.0.0.1".to_string(),
            port: "0".to_string(),
            provider_id: String::new(),
            hop_count: 2,
            policy: CoverTrafficPolicy::default(),
            fetch_enabled: true,
            fetch_interval: Duration::from_secs(1),
            topology_refresh_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.id.is_empty() {
            return Err(ClientError::InvalidConfig("id must not be empty".to_string()));
        }
        if self.provider_id.is_empty() {
            return Err(ClientError::InvalidConfig("provider_id must not be empty".to_string()));
        }
        if self.hop_count + 1 > MAX_HOPS {
            return Err(ClientError::InvalidConfig(format!(
                "hop_count {} exceeds maximum of {}",
                self.hop_count,
                MAX_HOPS - 1
            )));
        }
        if self.fetch_interval.is_zero() || self.topology_refresh_interval.is_zero() {
            return Err(ClientError::InvalidConfig("intervals must be > 0".to_string()));
        }
        self.policy.validate()?;
        Ok(())
    }
}

/// Counters kept by a client
#[derive(Debug, Default)]
pub(crate) struct ClientCounters {
    pub real_sent: AtomicU64,
    pub loop_sent: AtomicU64,
    pub loop_returned: AtomicU64,
    pub drop_sent: AtomicU64,
    pub rate_cover_sent: AtomicU64,
    pub received: AtomicU64,
    pub undecryptable: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub real_sent: u64,
    pub loop_sent: u64,
    pub loop_returned: u64,
    pub drop_sent: u64,
    pub rate_cover_sent: u64,
    pub received: u64,
    pub undecryptable: u64,
}

/// State shared by the pipeline and its background tasks
pub(crate) struct ClientCore {
    pub config: ClientConfig,
    pub keys: NodeKeys,
    pub descriptor: ParticipantDescriptor,
    pub topology: TopologyHandle,
    pub transport: Arc<dyn PacketTransport>,
    pub builder: Mutex<PacketBuilder>,
    /// Real frames waiting for a rate-compliant tick
    pub queue: Mutex<VecDeque<OutboundPacket>>,
    pub policy_tx: watch::Sender<CoverTrafficPolicy>,
    pub shutdown_tx: watch::Sender<bool>,
    pub fetch_enabled: AtomicBool,
    pub loops_in_flight: Mutex<HashMap<u64, Instant>>,
    pub counters: ClientCounters,
    pub received_tx: mpsc::UnboundedSender<ReceivedMessage>,
}

impl ClientCore {
    pub fn policy(&self) -> CoverTrafficPolicy {
        self.policy_tx.borrow().clone()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub async fn transmit(&self, packet: &OutboundPacket) -> Result<(), TransportError> {
        self.transport.transmit(&packet.address, &packet.frame).await
    }

    /// Drain the mailbox, pulling again while the provider reports more.
    /// Returns the number of application messages surfaced.
    pub async fn fetch(&self) -> Result<usize, ClientError> {
        let topology = self.topology.snapshot();
        let provider = topology
            .provider(&self.config.provider_id)
            .ok_or_else(|| ClientError::UnknownProvider(self.config.provider_id.clone()))?;
        let address = provider.address();

        let mut surfaced = 0;
        for _ in 0..MAX_PULLS_PER_FETCH {
            let response = self
                .transport
                .request(&address, &FlaggedFrame::pull(&self.config.id))
                .await?;
            let pulled = PullResponse::from_bytes(&response)?;
            for sealed in &pulled.payloads {
                if self.accept_sealed(sealed) {
                    surfaced += 1;
                }
            }
            if !pulled.more {
                break;
            }
        }
        Ok(surfaced)
    }

    /// Open one sealed payload; true when it surfaced an application message
    pub fn accept_sealed(&self, sealed: &[u8]) -> bool {
        match ClientPayload::open(self.keys.secret(), sealed) {
            Ok(ClientPayload::Message { sender, body }) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                if self.received_tx.send(ReceivedMessage { sender, body }).is_err() {
                    tracing::debug!("{}: nobody is listening for messages", self.config.id);
                }
                true
            }
            Ok(ClientPayload::LoopCover { nonce }) => {
                self.counters.loop_returned.fetch_add(1, Ordering::Relaxed);
                if let Some(sent_at) = self.loops_in_flight.lock().remove(&nonce) {
                    tracing::debug!("{}: loop {} returned after {:?}", self.config.id, nonce, sent_at.elapsed());
                }
                false
            }
            Err(e) => {
                self.counters.undecryptable.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}: discarding undecryptable payload: {}", self.config.id, e);
                false
            }
        }
    }

    fn stats(&self) -> ClientStats {
        let c = &self.counters;
        ClientStats {
            real_sent: c.real_sent.load(Ordering::Relaxed),
            loop_sent: c.loop_sent.load(Ordering::Relaxed),
            loop_returned: c.loop_returned.load(Ordering::Relaxed),
            drop_sent: c.drop_sent.load(Ordering::Relaxed),
            rate_cover_sent: c.rate_cover_sent.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            undecryptable: c.undecryptable.load(Ordering::Relaxed),
        }
    }
}

/// A running client
pub struct ClientPipeline {
    core: Arc<ClientCore>,
    tasks: Vec<JoinHandle<()>>,
    listener: Option<Arc<RelayEngine>>,
}

impl ClientPipeline {
    /// Start the client and its background tasks. Received application
    /// messages arrive on the returned channel.
    pub fn start(
        config: ClientConfig,
        keys: NodeKeys,
        transport: Arc<dyn PacketTransport>,
        topology: TopologyHandle,
        directory: Option<Arc<dyn Directory>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ReceivedMessage>), ClientError> {
        config.validate()?;

        let descriptor = keys
            .descriptor(config.id.clone(), ParticipantKind::Client, config.host.clone(), config.port.clone())
            .with_provider(config.provider_id.clone());
        let (policy_tx, _) = watch::channel(config.policy.clone());
        let (shutdown_tx, _) = watch::channel(false);
        let (received_tx, received_rx) = mpsc::unbounded_channel();

        let core = Arc::new(ClientCore {
            builder: Mutex::new(PacketBuilder::new(config.hop_count)),
            fetch_enabled: AtomicBool::new(config.fetch_enabled),
            config,
            keys,
            descriptor,
            topology,
            transport,
            queue: Mutex::new(VecDeque::new()),
            policy_tx,
            shutdown_tx,
            loops_in_flight: Mutex::new(HashMap::new()),
            counters: ClientCounters::default(),
            received_tx,
        });

        // Receivers must exist before their task is spawned: a task that
        // subscribes late never sees a shutdown sent before it first runs
        let mut tasks = CoverTrafficGenerator::spawn(&core);
        tasks.push(tokio::spawn(fetch_loop(Arc::clone(&core), core.shutdown_rx())));
        if let Some(directory) = directory {
            tasks.push(tokio::spawn(topology_refresh_loop(
                Arc::clone(&core),
                directory,
                core.shutdown_rx(),
            )));
        }

        tracing::info!(
            "Client {} started (provider {}, {} hops)",
            core.config.id,
            core.config.provider_id,
            core.config.hop_count
        );
        Ok((
            Self {
                core,
                tasks,
                listener: None,
            },
            received_rx,
        ))
    }

    pub fn id(&self) -> &str {
        &self.core.config.id
    }

    /// Run this client's own listening process. Packets whose last hop is
    /// this client are peeled there and surfaced like fetched payloads.
    pub async fn listen(&mut self, config: RelayConfig) -> Result<SocketAddr, ClientError> {
        if self.listener.is_some() {
            return Err(ClientError::InvalidConfig("client is already listening".to_string()));
        }
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let engine = RelayEngine::new(
            self.core.descriptor.clone(),
            self.core.keys.clone(),
            Role::Client {
                id: self.core.config.id.clone(),
                inbox: inbox_tx,
            },
            Arc::clone(&self.core.transport),
            config,
        );
        let local_addr = engine.start().await?;

        self.tasks.push(tokio::spawn(inbox_loop(
            Arc::clone(&self.core),
            inbox_rx,
            self.core.shutdown_rx(),
        )));
        self.listener = Some(engine);
        Ok(local_addr)
    }

    /// Descriptor to publish for this client
    pub fn descriptor(&self) -> &ParticipantDescriptor {
        &self.core.descriptor
    }

    pub fn policy(&self) -> CoverTrafficPolicy {
        self.core.policy()
    }

    pub fn stats(&self) -> ClientStats {
        self.core.stats()
    }

    /// Number of real frames waiting for a rate-compliant tick
    pub fn queued(&self) -> usize {
        self.core.queue.lock().len()
    }

    /// Build the frame for a message without sending it
    pub fn encode_frame(&self, body: &[u8], recipient_id: &str) -> Result<OutboundPacket, ClientError> {
        let topology = self.core.topology.snapshot();
        let rate = self.core.policy().desired_rate;
        self.core
            .builder
            .lock()
            .message(&topology, &self.core.config.id, recipient_id, body, rate)
    }

    /// Send a pre-built frame immediately, bypassing the rate-compliant queue
    pub async fn transmit_frame(&self, packet: &OutboundPacket) -> Result<(), ClientError> {
        if self.core.is_shut_down() {
            return Err(ClientError::Shutdown);
        }
        self.core.transmit(packet).await?;
        self.core.counters.real_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Encode `body` for `recipient_id` and send it.
    ///
    /// With rate-compliant cover on, the frame waits for the next scheduler
    /// tick; otherwise it goes out at once and transport errors are returned.
    pub async fn send(&self, body: &[u8], recipient_id: &str) -> Result<(), ClientError> {
        if self.core.is_shut_down() {
            return Err(ClientError::Shutdown);
        }
        let packet = self.encode_frame(body, recipient_id)?;

        if self.core.policy().rate_compliant_enabled {
            self.core.queue.lock().push_back(packet);
            tracing::debug!("{}: queued message for {}", self.id(), recipient_id);
            return Ok(());
        }

        self.transmit_frame(&packet).await?;
        tracing::debug!("{}: sent message for {}", self.id(), recipient_id);
        Ok(())
    }

    /// Publish a new cover policy to every running task
    pub fn reconfigure(&self, policy: CoverTrafficPolicy) -> Result<(), ClientError> {
        policy.validate()?;
        tracing::info!("{}: cover policy now {:?}", self.id(), policy);
        self.core.policy_tx.send_replace(policy);
        Ok(())
    }

    pub fn set_fetch_enabled(&self, enabled: bool) {
        self.core.fetch_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Pull the mailbox now, outside the periodic fetch loop
    pub async fn fetch_now(&self) -> Result<usize, ClientError> {
        self.core.fetch().await
    }

    /// Signal every task and wait for them to finish
    pub async fn shutdown(self) {
        self.core.shutdown_tx.send_replace(true);
        if let Some(listener) = &self.listener {
            listener.shutdown().await;
        }
        for task in self.tasks {
            let _ = task.await;
        }
        let dropped = self.core.queue.lock().len();
        if dropped > 0 {
            tracing::warn!("{}: {} queued messages not sent before shutdown", self.core.config.id, dropped);
        }
        tracing::info!("Client {} stopped: {:?}", self.core.config.id, self.core.stats());
    }
}

async fn fetch_loop(core: Arc<ClientCore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.fetch_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !core.fetch_enabled.load(Ordering::Relaxed) {
                    continue;
                }
                match core.fetch().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("{}: fetched {} messages", core.config.id, n),
                    Err(e) => tracing::warn!("{}: mailbox fetch failed: {}", core.config.id, e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn topology_refresh_loop(
    core: Arc<ClientCore>,
    directory: Arc<dyn Directory>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(core.config.topology_refresh_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let directory = Arc::clone(&directory);
                let topology = core.topology.clone();
                let refreshed = tokio::task::spawn_blocking(move || topology.refresh(directory.as_ref())).await;
                match refreshed {
                    Ok(Ok(())) => tracing::debug!("{}: topology refreshed", core.config.id),
                    Ok(Err(e)) => tracing::warn!("{}: topology refresh failed: {}", core.config.id, e),
                    Err(e) => tracing::error!("{}: topology refresh task failed: {}", core.config.id, e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn inbox_loop(
    core: Arc<ClientCore>,
    mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            sealed = inbox.recv() => match sealed {
                Some(sealed) => {
                    core.accept_sealed(&sealed);
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
