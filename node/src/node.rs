//! Node assembly: wires the store, ledger, processors, and channel layer
//! together and routes decoded messages to the right subsystem.
//!
//! Every routed message is attributed to a channel first; until that
//! channel's mutual handshake completes, nothing but `node_id_handshake`
//! traffic passes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_ledger::{dev_genesis, Ledger};
use strand_messages::{decode, encode, HandshakeResponse, Message, TelemetryData};
use strand_network::{BufferRing, Channel, ChannelTable, CookieJar, HandshakeFsm};
use strand_store::{LedgerStore, Writer};
use strand_types::{Account, Endpoint, HashOrAccount, KeyPair};
use strand_utils::Stats;

use crate::block_processor::{BlockItem, BlockProcessor};
use crate::bootstrap::lazy::LazyBootstrap;
use crate::bootstrap::server::{BootstrapServer, BulkPullAccountResponse};
use crate::bootstrap::PullsCache;
use crate::confirmation_height::ConfirmationHeightProcessor;
use crate::config::NodeConfig;
use crate::frontiers::FrontierPrioritizer;
use crate::NodeError;

/// Slot size of the datagram buffer ring; datagrams longer than this are
/// truncated by the transport before they reach the codec.
const RING_SLOT_SIZE: usize = 512;
/// Outstanding handshake cookies.
const MAX_COOKIES: usize = 1024;
const COOKIE_TTL: Duration = Duration::from_secs(30);

/// A bootstrap-server answer, ready for the stream writer.
#[derive(Clone, Debug)]
pub enum StreamResponse {
    Blocks(Vec<strand_ledger::Block>),
    Pending(BulkPullAccountResponse),
    Frontiers(Vec<(Account, strand_types::BlockHash)>),
}

/// Per-endpoint handshake progress plus the cookie jar both sides of an
/// exchange draw from.
struct HandshakeDriver {
    jar: CookieJar,
    fsms: HashMap<Endpoint, HandshakeFsm>,
}

pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<LedgerStore>,
    pub ledger: Arc<Ledger>,
    pub stats: Arc<Stats>,
    pub block_processor: Arc<BlockProcessor>,
    pub confirmation_height: Arc<ConfirmationHeightProcessor>,
    pub bootstrap_server: BootstrapServer,
    pub channels: ChannelTable,
    pub message_ring: BufferRing,
    pub frontiers: Mutex<FrontierPrioritizer>,
    node_key: KeyPair,
    handshake: Mutex<HandshakeDriver>,
    pulls_cache: Arc<PullsCache>,
    local_endpoint: Endpoint,
    started_at: std::time::Instant,
}

impl Node {
    pub fn new(config: NodeConfig, local_endpoint: Endpoint) -> Result<Self, NodeError> {
        let store = Arc::new(LedgerStore::open(&config.data_dir, config.map_size)?);
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), dev_genesis()));
        {
            let _guard = store.write_queue().wait(Writer::Node);
            let mut txn = store.write_txn()?;
            ledger.initialize(&mut txn)?;
            txn.commit().map_err(strand_store::StoreError::from)?;
        }
        let stats = Arc::new(Stats::default());
        let block_processor = Arc::new(BlockProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&stats),
            64 * 1024,
        ));
        let confirmation_height = Arc::new(ConfirmationHeightProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&stats),
            config.confirmation.clone(),
        ));
        let bootstrap_server = BootstrapServer::new(Arc::clone(&ledger));
        let message_ring = BufferRing::new(config.message_ring_slots, RING_SLOT_SIZE);
        let frontiers = Mutex::new(FrontierPrioritizer::new(
            config.max_priority_cementable_frontiers,
        ));
        Ok(Self {
            store,
            ledger,
            stats,
            block_processor,
            confirmation_height,
            bootstrap_server,
            channels: ChannelTable::new(),
            message_ring,
            frontiers,
            node_key: KeyPair::generate(),
            handshake: Mutex::new(HandshakeDriver {
                jar: CookieJar::new(MAX_COOKIES, COOKIE_TTL),
                fsms: HashMap::new(),
            }),
            pulls_cache: Arc::new(PullsCache::new(4 * 1024)),
            local_endpoint,
            config,
            started_at: std::time::Instant::now(),
        })
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint
    }

    /// This run's ephemeral node identity.
    pub fn node_id(&self) -> Account {
        self.node_key.account
    }

    /// Start a lazy bootstrap attempt seeded from `start`.
    pub fn bootstrap_lazy(&self, start: HashOrAccount, confirmed: bool) -> Arc<LazyBootstrap> {
        let attempt = Arc::new(LazyBootstrap::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.block_processor),
            Arc::clone(&self.pulls_cache),
            Arc::clone(&self.stats),
            self.config.bootstrap.clone(),
        ));
        attempt.lazy_start(start, confirmed);
        attempt
    }

    /// The confirmed-block input edge from the voting subsystem.
    pub fn block_confirmed(&self, hash: &strand_types::BlockHash) -> Result<u64, NodeError> {
        let (count, _) = self.confirmation_height.process(hash)?;
        Ok(count)
    }

    /// Consume one descriptor from the shared datagram ring. Returns
    /// `false` once the ring has been stopped.
    pub fn process_one_ring_message(&self) -> Result<bool, NodeError> {
        let Some(buffer) = self.message_ring.dequeue() else {
            return Ok(false);
        };
        let bytes = self.message_ring.read(&buffer);
        let result = self.handle_datagram(buffer.sender, &bytes);
        self.message_ring.release(buffer.slot);
        result?;
        Ok(true)
    }

    /// Handle one datagram as received from the socket.
    ///
    /// A datagram claiming to come from our own endpoint is counted and
    /// discarded before any parsing.
    pub fn handle_datagram(&self, source: Endpoint, bytes: &[u8]) -> Result<(), NodeError> {
        if source == self.local_endpoint {
            self.stats.inc("error/bad_sender");
            return Ok(());
        }
        let message = match decode(bytes, self.config.network) {
            Ok(message) => message,
            Err(e) => {
                // Unparseable traffic never tears the channel down.
                self.stats.inc("error/parse");
                tracing::debug!(%source, "dropping unparseable message: {e}");
                return Ok(());
            }
        };
        self.handle_message(source, message)
    }

    /// Attribute a decoded message to its channel and route it. Until the
    /// channel completes the mutual handshake, only `node_id_handshake`
    /// traffic is accepted; everything else is counted and dropped.
    pub fn handle_message(&self, source: Endpoint, message: Message) -> Result<(), NodeError> {
        let Some(channel) = self.channels.find(&source) else {
            self.stats.inc("error/not_live");
            tracing::debug!(%source, "dropping message from unregistered endpoint");
            return Ok(());
        };
        if !channel.accepts(message.message_type()) {
            self.stats.inc("error/not_live");
            tracing::debug!(
                %source,
                kind = ?message.message_type(),
                "dropping message on unverified channel"
            );
            return Ok(());
        }
        channel.mark_activity();
        self.dispatch(&channel, source, message)
    }

    /// Route a message already admitted by its channel. Bootstrap-server
    /// requests are answered on the stream path and never arrive here.
    fn dispatch(
        &self,
        channel: &Arc<Channel>,
        source: Endpoint,
        message: Message,
    ) -> Result<(), NodeError> {
        match message {
            Message::Publish { block } => {
                self.stats.inc("message/publish");
                self.block_processor.add(BlockItem {
                    block,
                    known_account: None,
                    verified: false,
                });
            }
            Message::Keepalive { peers } => {
                self.stats.inc("message/keepalive");
                self.keepalive(channel, source, &peers)?;
            }
            Message::ConfirmReq { .. } => {
                // Votes are produced outside the core.
                self.stats.inc("message/confirm_req");
            }
            Message::ConfirmAck { vote } => {
                self.stats.inc("message/confirm_ack");
                tracing::trace!(voter = %vote.voter, hashes = vote.hashes.len(), "vote relayed");
            }
            Message::TelemetryReq => {
                self.stats.inc("message/telemetry");
            }
            Message::TelemetryAck { .. } => {
                self.stats.inc("message/telemetry");
            }
            Message::NodeIdHandshake { query, response } => {
                self.handle_handshake(channel, query, response)?;
            }
            Message::BulkPull { .. }
            | Message::BulkPullAccount { .. }
            | Message::BulkPush
            | Message::FrontierReq { .. } => {
                // Bulk traffic is stream-only; on the datagram path it is
                // junk.
                self.stats.inc("error/bad_sender");
            }
        }
        Ok(())
    }

    /// Open the handshake on a freshly dialed channel.
    pub fn initiate_handshake(&self, channel: &Arc<Channel>) -> Result<(), NodeError> {
        let source = channel.endpoint();
        let message = {
            let mut driver = self.lock_handshake();
            let HandshakeDriver { jar, fsms } = &mut *driver;
            let fsm = fsms
                .entry(source)
                .or_insert_with(|| HandshakeFsm::new(source));
            fsm.initiate(jar)?
        };
        let frame = encode(&message, self.config.network)?;
        channel.send(&frame)?;
        Ok(())
    }

    /// Advance a channel's handshake with a received `node_id_handshake`.
    /// A verification failure drops the channel.
    fn handle_handshake(
        &self,
        channel: &Arc<Channel>,
        query: Option<[u8; 32]>,
        response: Option<HandshakeResponse>,
    ) -> Result<(), NodeError> {
        self.stats.inc("message/handshake");
        let source = channel.endpoint();
        let outcome = {
            let mut driver = self.lock_handshake();
            let HandshakeDriver { jar, fsms } = &mut *driver;
            let fsm = fsms
                .entry(source)
                .or_insert_with(|| HandshakeFsm::new(source));
            match fsm.receive(query, response, &self.node_key, jar) {
                Ok(reply) => {
                    let verified = if fsm.is_live() { fsm.node_id() } else { None };
                    if verified.is_some() {
                        fsms.remove(&source);
                    }
                    Ok((reply, verified))
                }
                Err(e) => {
                    fsms.remove(&source);
                    Err(e)
                }
            }
        };
        match outcome {
            Ok((reply, verified)) => {
                if let Some(node_id) = verified {
                    channel.set_live(node_id);
                    // Re-insert to index the proven node id.
                    self.channels.insert(Arc::clone(channel));
                    tracing::debug!(%source, %node_id, "handshake complete");
                }
                if let Some(reply) = reply {
                    let frame = encode(&reply, self.config.network)?;
                    if let Err(e) = channel.send(&frame) {
                        tracing::debug!(%source, "handshake reply failed: {e}");
                    }
                }
            }
            Err(e) => {
                self.stats.inc("error/handshake");
                tracing::debug!(%source, "handshake failed: {e}");
                self.channels.remove(&source);
            }
        }
        Ok(())
    }

    /// Answer a bootstrap-server request arriving on the stream path.
    /// Returns `None` for message types the server does not handle.
    pub fn handle_stream_request(
        &self,
        message: &Message,
    ) -> Result<Option<StreamResponse>, NodeError> {
        let txn = self.store.read_txn()?;
        match message {
            Message::BulkPull { start, end, count } => {
                let blocks = self.bootstrap_server.bulk_pull(&txn, *start, *end, *count)?;
                Ok(Some(StreamResponse::Blocks(blocks)))
            }
            Message::BulkPullAccount {
                account,
                minimum_amount,
                flags,
            } => {
                let response = self
                    .bootstrap_server
                    .bulk_pull_account(&txn, account, *minimum_amount, *flags)?;
                Ok(Some(StreamResponse::Pending(response)))
            }
            Message::FrontierReq { start, age, count } => {
                let frontiers = self.bootstrap_server.frontier_req(
                    &txn,
                    *start,
                    *age,
                    *count,
                    unix_seconds(),
                )?;
                Ok(Some(StreamResponse::Frontiers(frontiers)))
            }
            _ => Ok(None),
        }
    }

    /// Record gossiped peers, displacing stale port mappings.
    fn keepalive(
        &self,
        channel: &Arc<Channel>,
        source: Endpoint,
        peers: &[Endpoint],
    ) -> Result<(), NodeError> {
        if let Some(node_id) = channel.node_id() {
            for peer in peers {
                if peer.addr() == source.addr() && *peer != source {
                    self.channels.replace_port(&node_id, *peer);
                }
            }
        }
        let now = unix_seconds();
        let _guard = self.store.write_queue().wait(Writer::Node);
        let mut txn = self.store.write_txn()?;
        for peer in peers {
            if strand_types::endpoint::reserved_address(peer, self.config.allow_private_addresses) {
                continue;
            }
            self.store.peer_put(&mut txn, peer, now)?;
        }
        txn.commit().map_err(strand_store::StoreError::from)?;
        Ok(())
    }

    /// Close channels that made no progress within the idle timeout.
    pub fn reap_idle_channels(&self) -> usize {
        self.channels
            .purge_idle(Duration::from_secs(self.config.tcp_idle_timeout_secs))
    }

    /// Refresh the frontier prioritizer from the ledger.
    pub fn prioritize_frontiers(&self, wallet_accounts: &HashSet<Account>) -> Result<(), NodeError> {
        let mut frontiers = self
            .frontiers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        frontiers.prioritize(&self.ledger, wallet_accounts)
    }

    /// Snapshot for a telemetry ack.
    pub fn telemetry(&self) -> Result<TelemetryData, NodeError> {
        let txn = self.store.read_txn()?;
        Ok(TelemetryData {
            block_count: self.store.block_count(&txn)?,
            cemented_count: self.stats.get("confirmation/blocks_confirmed"),
            unchecked_count: self.store.unchecked_count(&txn)?,
            account_count: self.store.account_count(&txn)?,
            peer_count: self.channels.len() as u32,
            protocol_version: strand_messages::header::VERSION_USING,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            genesis_hash: self.ledger.genesis().hash,
            timestamp: unix_seconds(),
        })
    }

    fn lock_handshake(&self) -> std::sync::MutexGuard<'_, HandshakeDriver> {
        self.handshake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
