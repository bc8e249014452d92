//! Socket front-end: binds the node's datagram and stream ports and keeps
//! the channel layer fed.
//!
//! The datagram path copies received packets into the shared
//! [`BufferRing`](strand_network::BufferRing); consumer threads drain the
//! ring into [`Node::handle_datagram`]. The stream path accepts
//! connections, serves the bootstrap plane (`bulk_pull`,
//! `bulk_pull_account`, `frontier_req`, `bulk_push`) per connection, and
//! routes everything else through the handshake-gated channel plane.
//! Idle channels are reaped on the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use strand_ledger::Block;
use strand_messages::{decode, Message, MessageType};
use strand_network::transport::{read_frame, spawn_stream_writer};
use strand_network::{Channel, DatagramTransport, MessageBuffer, StreamTransport};
use strand_types::Endpoint;

use crate::block_processor::BlockItem;
use crate::node::{Node, StreamResponse};
use crate::NodeError;

/// Threads draining the datagram ring.
const RING_CONSUMERS: usize = 2;
/// Frames queued per stream channel before backpressure.
const STREAM_QUEUE_DEPTH: usize = 128;

/// Handle to the running socket loops.
pub struct PeerService {
    udp_endpoint: Endpoint,
    tcp_endpoint: Endpoint,
    socket: Arc<UdpSocket>,
}

impl PeerService {
    /// Bind the node's configured endpoint and start the receive loops.
    pub async fn start(node: Arc<Node>) -> Result<Self, NodeError> {
        let bind_addr = node.local_endpoint().to_socket_addr();
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let udp_endpoint = Endpoint::from_socket_addr(socket.local_addr()?);
        let listener = TcpListener::bind(bind_addr).await?;
        let tcp_endpoint = Endpoint::from_socket_addr(listener.local_addr()?);
        tracing::info!(%udp_endpoint, %tcp_endpoint, "peer service listening");

        for _ in 0..RING_CONSUMERS {
            let node = Arc::clone(&node);
            std::thread::spawn(move || loop {
                match node.process_one_ring_message() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => tracing::warn!("datagram processing failed: {e}"),
                }
            });
        }

        {
            let node = Arc::clone(&node);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                receive_datagrams(node, socket).await;
            });
        }

        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, from)) => {
                            let node = Arc::clone(&node);
                            let source = Endpoint::from_socket_addr(from);
                            tokio::spawn(async move {
                                if let Err(e) = serve_stream(node, stream, source).await {
                                    tracing::debug!(%source, "stream connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => tracing::warn!("accept failed: {e}"),
                    }
                }
            });
        }

        {
            let node = Arc::clone(&node);
            let interval = Duration::from_secs(node.config.tcp_idle_timeout_secs.max(2));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval / 2).await;
                    node.reap_idle_channels();
                }
            });
        }

        Ok(Self {
            udp_endpoint,
            tcp_endpoint,
            socket,
        })
    }

    pub fn udp_endpoint(&self) -> Endpoint {
        self.udp_endpoint
    }

    pub fn tcp_endpoint(&self) -> Endpoint {
        self.tcp_endpoint
    }

    /// Dial a peer over the datagram path and open the handshake.
    pub fn connect(&self, node: &Arc<Node>, peer: Endpoint) -> Result<(), NodeError> {
        let channel = match node.channels.find(&peer) {
            Some(channel) => channel,
            None => {
                let transport =
                    DatagramTransport::new(Arc::clone(&self.socket), peer.to_socket_addr());
                let channel = Arc::new(Channel::new(peer, Box::new(transport)));
                node.channels.insert(Arc::clone(&channel));
                channel
            }
        };
        node.initiate_handshake(&channel)
    }
}

/// Receive datagrams into the ring, registering a reply channel for every
/// new source endpoint.
async fn receive_datagrams(node: Arc<Node>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; node.message_ring.slot_size()];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("udp receive failed: {e}");
                continue;
            }
        };
        let source = Endpoint::from_socket_addr(from);
        if node.channels.find(&source).is_none() {
            if node.channels.len() >= node.config.max_peers {
                tracing::debug!(%source, "channel table full, dropping datagram");
                continue;
            }
            let transport = DatagramTransport::new(Arc::clone(&socket), source.to_socket_addr());
            node.channels
                .insert(Arc::new(Channel::new(source, Box::new(transport))));
        }
        let Some(slot) = node.message_ring.allocate() else {
            // Ring stopped: the service is shutting down.
            break;
        };
        let len = node.message_ring.fill(slot, &buf[..len]);
        node.message_ring.enqueue(MessageBuffer {
            slot,
            len,
            sender: source,
        });
    }
}

/// One accepted stream connection: bootstrap requests are served per
/// connection; channel traffic goes through the handshake gate.
async fn serve_stream(
    node: Arc<Node>,
    stream: TcpStream,
    source: Endpoint,
) -> Result<(), NodeError> {
    let (mut read_half, write_half) = stream.into_split();
    let transport = spawn_stream_writer(write_half, STREAM_QUEUE_DEPTH);
    let responder = transport.clone();
    let channel = Arc::new(Channel::new(source, Box::new(transport)));
    node.channels.insert(Arc::clone(&channel));

    let result = stream_loop(&node, &mut read_half, &responder, &channel, source).await;
    node.channels.remove(&source);
    result
}

async fn stream_loop(
    node: &Arc<Node>,
    read_half: &mut OwnedReadHalf,
    responder: &StreamTransport,
    channel: &Arc<Channel>,
    source: Endpoint,
) -> Result<(), NodeError> {
    loop {
        let frame = match read_frame(read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::debug!(%source, "stream read failed: {e}");
                return Ok(());
            }
        };
        channel.mark_activity();
        let message = match decode(&frame, node.config.network) {
            Ok(message) => message,
            Err(e) => {
                node.stats.inc("error/parse");
                tracing::debug!(%source, "dropping unparseable frame: {e}");
                continue;
            }
        };
        match message.message_type() {
            MessageType::BulkPull | MessageType::BulkPullAccount | MessageType::FrontierReq => {
                if let Some(response) = node.handle_stream_request(&message)? {
                    write_response(responder, &response).await?;
                }
            }
            MessageType::BulkPush => {
                receive_push(node, read_half).await?;
            }
            _ => node.handle_message(source, message)?,
        }
    }
}

/// Stream a bootstrap response; bulk streams end with an empty frame,
/// frontier streams with the zero pair the server already appended.
async fn write_response(
    responder: &StreamTransport,
    response: &StreamResponse,
) -> Result<(), NodeError> {
    match response {
        StreamResponse::Blocks(blocks) => {
            for block in blocks {
                responder.send_queued(bincode::serialize(block)?).await?;
            }
            responder.send_queued(Vec::new()).await?;
        }
        StreamResponse::Pending(pending) => {
            responder
                .send_queued(bincode::serialize(&(pending.frontier, pending.balance))?)
                .await?;
            for entry in &pending.entries {
                responder.send_queued(bincode::serialize(entry)?).await?;
            }
            responder.send_queued(Vec::new()).await?;
        }
        StreamResponse::Frontiers(pairs) => {
            for pair in pairs {
                responder.send_queued(bincode::serialize(pair)?).await?;
            }
        }
    }
    Ok(())
}

/// Drain a pushed block stream into the processor (ends at an empty
/// frame).
async fn receive_push(node: &Arc<Node>, read_half: &mut OwnedReadHalf) -> Result<(), NodeError> {
    while let Some(frame) = read_frame(read_half).await? {
        if frame.is_empty() {
            break;
        }
        match bincode::deserialize::<Block>(&frame) {
            Ok(block) => {
                node.block_processor.add(BlockItem {
                    block,
                    known_account: None,
                    verified: false,
                });
            }
            Err(e) => {
                node.stats.inc("error/parse");
                tracing::debug!("dropping unparseable pushed block: {e}");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::connections::{BootstrapConnections, TcpPullConnection};
    use crate::bootstrap::{PullConnection, PullInfo};
    use crate::config::NodeConfig;
    use strand_ledger::{dev_genesis_key, OpenBlock, ReceiveBlock, SendBlock};
    use strand_messages::encode;
    use strand_network::{CookieJar, HandshakeFsm};
    use strand_types::{Account, Amount, BlockHash, HashOrAccount, KeyPair, NetworkId, Signature};

    async fn start_node() -> (tempfile::TempDir, Arc<Node>, PeerService) {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::test_default(dir.path());
        let node = Arc::new(Node::new(config, Endpoint::loopback(0)).unwrap());
        let service = PeerService::start(Arc::clone(&node)).await.unwrap();
        (dir, node, service)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    fn send(kp: &KeyPair, previous: BlockHash, to: Account, balance: u128) -> Block {
        let mut block = Block::Send(SendBlock {
            previous,
            destination: to,
            balance: Amount::raw(balance),
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    fn open(kp: &KeyPair, source: BlockHash) -> Block {
        let mut block = Block::Open(OpenBlock {
            source,
            representative: kp.account,
            account: kp.account,
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    fn receive(kp: &KeyPair, previous: BlockHash, source: BlockHash) -> Block {
        let mut block = Block::Receive(ReceiveBlock {
            previous,
            source,
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    fn admit(node: &Node, block: &Block) {
        let mut txn = node.store.write_txn().unwrap();
        assert!(node.ledger.process(&mut txn, block).unwrap().is_progress());
        txn.commit().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn udp_handshake_and_traffic_end_to_end() {
        let (_dir, node, service) = start_node().await;
        let server = service.udp_endpoint();

        let client = UdpSocket::bind("[::1]:0").await.unwrap();
        let peer_key = KeyPair::from_seed(&[5u8; 32]);
        let mut jar = CookieJar::new(16, Duration::from_secs(30));
        let mut fsm = HandshakeFsm::new(server);

        // Message 1: our query.
        let opening = fsm.initiate(&mut jar).unwrap();
        client
            .send_to(
                &encode(&opening, NetworkId::Dev).unwrap(),
                server.to_socket_addr(),
            )
            .await
            .unwrap();

        // Message 2: the node's response + counter-query.
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = decode(&buf[..len], NetworkId::Dev).unwrap();
        let Message::NodeIdHandshake { query, response } = reply else {
            panic!("expected a handshake reply");
        };
        assert_eq!(response.as_ref().map(|r| r.node_id), Some(node.node_id()));

        // Message 3: our closing response.
        let closing = fsm
            .receive(query, response, &peer_key, &mut jar)
            .unwrap()
            .unwrap();
        client
            .send_to(
                &encode(&closing, NetworkId::Dev).unwrap(),
                server.to_socket_addr(),
            )
            .await
            .unwrap();
        assert!(fsm.is_live());

        {
            let node = Arc::clone(&node);
            let peer_account = peer_key.account;
            wait_for(move || node.channels.find_node_id(&peer_account).is_some()).await;
        }

        // The channel is live; ordinary traffic flows.
        client
            .send_to(
                &encode(&Message::TelemetryReq, NetworkId::Dev).unwrap(),
                server.to_socket_addr(),
            )
            .await
            .unwrap();
        {
            let node = Arc::clone(&node);
            wait_for(move || node.stats.get("message/telemetry") >= 1).await;
        }
        assert_eq!(node.stats.get("error/not_live"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn udp_pre_handshake_traffic_is_dropped() {
        let (_dir, node, service) = start_node().await;
        let server = service.udp_endpoint();

        let client = UdpSocket::bind("[::1]:0").await.unwrap();
        client
            .send_to(
                &encode(&Message::TelemetryReq, NetworkId::Dev).unwrap(),
                server.to_socket_addr(),
            )
            .await
            .unwrap();

        {
            let node = Arc::clone(&node);
            wait_for(move || node.stats.get("error/not_live") >= 1).await;
        }
        assert_eq!(node.stats.get("message/telemetry"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tcp_bulk_pull_serves_chain() {
        let (_dir, node, service) = start_node().await;
        let gkey = dev_genesis_key();
        let other = KeyPair::from_seed(&[1u8; 32]);
        let block = send(
            &gkey,
            node.ledger.genesis().hash,
            other.account,
            Amount::MAX.number() - 100,
        );
        admit(&node, &block);

        let tcp = service.tcp_endpoint().to_socket_addr();
        let genesis_account = gkey.account;
        let blocks = tokio::task::spawn_blocking(move || {
            let connection =
                TcpPullConnection::connect(tcp, NetworkId::Dev, Duration::from_secs(5)).unwrap();
            let pull = PullInfo::new(HashOrAccount::from(genesis_account), 0, 1);
            let mut out = Vec::new();
            connection
                .bulk_pull(&pull, &mut |block| {
                    out.push(block);
                    false
                })
                .unwrap();
            out
        })
        .await
        .unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].hash(), block.hash());
        assert_eq!(blocks[1].hash(), node.ledger.genesis().hash);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lazy_bootstrap_over_tcp() {
        // Remote node with a two-account graph; a fresh node pulls it
        // transitively through real sockets.
        let (_dir_remote, remote, remote_service) = start_node().await;
        let gkey = dev_genesis_key();
        let x = KeyPair::from_seed(&[1u8; 32]);
        let g = remote.ledger.genesis().hash;
        let max = Amount::MAX.number();

        let send1 = send(&gkey, g, x.account, max - 100);
        let open1 = open(&x, send1.hash());
        let send2 = send(&gkey, send1.hash(), x.account, max - 200);
        let receive2 = receive(&x, open1.hash(), send2.hash());
        for block in [&send1, &open1, &send2, &receive2] {
            admit(&remote, block);
        }

        let (_dir_local, local, _local_service) = start_node().await;
        let pool = BootstrapConnections::new(
            vec![remote_service.tcp_endpoint().to_socket_addr()],
            NetworkId::Dev,
            Duration::from_secs(5),
        );
        let attempt = local.bootstrap_lazy(HashOrAccount::from(receive2.hash()), true);
        {
            let attempt = Arc::clone(&attempt);
            tokio::task::spawn_blocking(move || attempt.run(&pool).unwrap())
                .await
                .unwrap();
        }

        assert!(attempt.lazy_finished().unwrap());
        let txn = local.store.read_txn().unwrap();
        for block in [&send1, &open1, &send2, &receive2] {
            assert!(local.ledger.block_exists(&txn, &block.hash()).unwrap());
        }
        assert_eq!(local.store.block_count(&txn).unwrap(), 5);
    }
}
