// Network node - manages peer connections, gossip, sync and mining

use crate::config::NodeConfig;
use crate::consensus::{Miner, Rejection, reward};
use crate::core::{Address, Block, BlockHeader, Transaction, unix_now};
use crate::mempool::{PoolError, TransactionPool};
use crate::network::message::{Command, Message};
use crate::network::peer::{PeerError, PeerEvent, PeerHandle};
use crate::network::sync::{ChainSync, SyncError, SyncOutcome, chain_info};
use crate::storage::{AppendOutcome, ChainStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc};

/// Upper bound of pooled transactions packed into one block
pub const MAX_BLOCK_TRANSACTIONS: usize = 1_000;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("node is already started")]
    AlreadyStarted,
}

/// Network node
pub struct Node {
    config: NodeConfig,
    store: ChainStore,
    pool: Mutex<TransactionPool>,
    /// Connected peers by remote socket address
    peers: RwLock<HashMap<SocketAddr, PeerHandle>>,
    /// Listening addresses already announced through NEW_NODE
    known_nodes: Mutex<HashSet<SocketAddr>>,
    /// Bumped whenever the stored chain changes
    chain_revision: AtomicU64,
    /// Cleared by `stop`; ends the mining loop
    running: AtomicBool,
    chain_sync: ChainSync,
    /// One sync attempt at a time
    sync_lock: tokio::sync::Mutex<()>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    listen_addr: OnceLock<SocketAddr>,
}

impl Node {
    pub fn new(config: NodeConfig, store: ChainStore) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        Arc::new(Self {
            chain_sync: ChainSync::new(config.fork_choice),
            config,
            store,
            pool: Mutex::new(TransactionPool::new()),
            peers: RwLock::new(HashMap::new()),
            known_nodes: Mutex::new(HashSet::new()),
            chain_revision: AtomicU64::new(0),
            running: AtomicBool::new(true),
            sync_lock: tokio::sync::Mutex::new(()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            listen_addr: OnceLock::new(),
        })
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    /// Address the listener is bound to, once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Pending transactions, in arrival order
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pool().transactions().to_vec()
    }

    /// Bind the listener and start accepting peers and dispatching their
    /// messages. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        let listener = TcpListener::bind(self.config.listen).await?;
        let addr = listener.local_addr()?;
        let _ = self.listen_addr.set(addr);
        log::info!("Node listening on {}", addr);

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().dispatch_loop(events));
        Ok(addr)
    }

    /// Start, join the configured peers, then keep syncing (and mining,
    /// if a miner address is configured) until Ctrl-C.
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        self.start().await?;

        for addr in self.config.peers.clone() {
            if let Err(e) = self.connect(addr).await {
                log::error!("Failed to connect to {}: {}", addr, e);
            }
        }
        if let Err(e) = self.sync_with_peers().await {
            log::error!("Initial sync failed: {}", e);
        }

        if let Some(address) = self.config.miner_address {
            tokio::spawn(self.clone().mine_forever(address));
        }

        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutting down");
                    self.stop();
                    self.store.flush()?;
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_with_peers().await {
                        log::error!("Sync failed: {}", e);
                    }
                }
            }
        }
    }

    /// Ask background work (mining) to wind down
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Dial a node and announce our listening address to it
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerHandle, NodeError> {
        let peer =
            PeerHandle::connect(addr, self.events_tx.clone(), self.config.request_timeout()).await?;

        // the announcement goes out before any broadcast can reach this peer
        if let Some(listen) = self.listen_addr() {
            if let Err(e) = peer.send(Command::NewNode { address: listen }).await {
                peer.kill("announcement failed").await;
                return Err(e.into());
            }
        }
        self.known_nodes().insert(addr);
        self.peers.write().await.insert(peer.addr, peer.clone());
        Ok(peer)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Validate and store a block. Accepted blocks invalidate the miner's
    /// template and prune the pool.
    pub fn insert_block(&self, block: &Block) -> Result<AppendOutcome, StoreError> {
        let outcome = self.store.append(block)?;
        if let AppendOutcome::Accepted { height } = outcome {
            log::info!("New block added at height {}: {}", height, block.hash());
            self.on_chain_changed()?;
        }
        Ok(outcome)
    }

    /// Gossip entry point for blocks: store, relay, or go looking for a
    /// better chain when the block does not fit ours.
    pub async fn handle_new_block(
        self: &Arc<Self>,
        block: Block,
        from: Option<SocketAddr>,
    ) -> Result<AppendOutcome, NodeError> {
        let hash = block.hash();
        let outcome = self.insert_block(&block)?;

        match &outcome {
            AppendOutcome::AlreadyKnown => log::debug!("Block {} already known", hash),
            AppendOutcome::Accepted { .. } => {
                self.broadcast(Command::NewBlock { block }, from).await;
            }
            AppendOutcome::Rejected(rejection) => {
                log::warn!("Invalid block {}: {}", hash, rejection);
                let suspicious = rejection.is_linkage()
                    || matches!(rejection, Rejection::InvalidTransaction { .. });
                if suspicious {
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.sync_with_peers().await {
                            log::error!("Sync after rejected block failed: {}", e);
                        }
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Gossip entry point for transactions: pool and relay valid ones.
    /// The inner result is the pool's verdict (the fee when accepted).
    pub async fn handle_new_transaction(
        &self,
        transaction: Transaction,
        from: Option<SocketAddr>,
    ) -> Result<Result<u64, PoolError>, StoreError> {
        let hash = transaction.hash();
        let utxos = self.store.get_utxos()?;
        let verdict = self.pool().add(transaction.clone(), &utxos);

        match &verdict {
            Ok(fee) => {
                log::info!("New transaction added to the pool: {} (fee {})", hash, fee);
                self.broadcast(Command::NewTransaction { transaction }, from)
                    .await;
            }
            Err(PoolError::Duplicate(_)) => log::debug!("Transaction {} already pooled", hash),
            Err(e) => log::warn!("Invalid transaction {}: {}", hash, e),
        }
        Ok(verdict)
    }

    /// Run one sync round against every connected peer
    pub async fn sync_with_peers(&self) -> Result<SyncOutcome, NodeError> {
        let _guard = self.sync_lock.lock().await;
        let peers: Vec<PeerHandle> = self.peers.read().await.values().cloned().collect();
        if peers.is_empty() {
            return Ok(SyncOutcome::UpToDate);
        }

        let tip = self.store.tip_hash()?;
        let result = self.chain_sync.sync(&self.store, &peers).await;
        // a failed suffix replication may still have appended blocks
        if self.store.tip_hash()? != tip {
            self.on_chain_changed()?;
        }
        Ok(result?)
    }

    /// Send `command` to every peer except `except`
    pub async fn broadcast(&self, command: Command, except: Option<SocketAddr>) {
        let peers: Vec<PeerHandle> = self
            .peers
            .read()
            .await
            .values()
            .filter(|peer| Some(peer.addr) != except)
            .cloned()
            .collect();

        log::debug!("Broadcasting {} to {} peers", command.code(), peers.len());
        for peer in peers {
            if let Err(e) = peer.send(command.clone()).await {
                log::debug!("Failed to send {} to {}: {}", command.code(), peer.addr, e);
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            log::info!("New connection from {}", addr);

            match PeerHandle::spawn(stream, false, self.events_tx.clone(), self.config.request_timeout()) {
                Ok(peer) => {
                    self.peers.write().await.insert(addr, peer);
                }
                Err(e) => log::error!("Failed to set up peer {}: {}", addr, e),
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Message(peer, message) => {
                    // handlers may issue requests of their own, so they
                    // must not block the dispatcher
                    let node = self.clone();
                    tokio::spawn(async move {
                        let addr = peer.addr;
                        if let Err(e) = node.handle_message(peer, message).await {
                            log::error!("Failed to handle message from {}: {}", addr, e);
                        }
                    });
                }
                PeerEvent::Disconnected(addr) => {
                    if self.peers.write().await.remove(&addr).is_some() {
                        log::info!("Peer {} removed", addr);
                    }
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, peer: PeerHandle, message: Message) -> Result<(), NodeError> {
        match &message.command {
            Command::ChainInfoRequest => {
                let info = chain_info(&self.store)?;
                peer.respond(&message, Command::ChainInfo(info)).await?;
            }
            Command::HaveBlockRequest { hash } => {
                let exists = self.store.block_exists(hash)?;
                peer.respond(&message, Command::HaveBlock { exists }).await?;
            }
            Command::BlockRequest { height } => {
                let block = self.store.get(*height)?;
                peer.respond(&message, Command::Block { block }).await?;
            }
            Command::NewBlock { block } => {
                self.handle_new_block(block.clone(), Some(peer.addr)).await?;
            }
            Command::NewTransaction { transaction } => {
                let _ = self
                    .handle_new_transaction(transaction.clone(), Some(peer.addr))
                    .await?;
            }
            Command::NewNode { address } => self.handle_new_node(&peer, *address).await,
            Command::ChainInfo(_) | Command::HaveBlock { .. } | Command::Block { .. } => {
                log::debug!("Unsolicited {} from {}", message.command.code(), peer.addr);
            }
        }
        Ok(())
    }

    async fn handle_new_node(self: &Arc<Self>, peer: &PeerHandle, address: SocketAddr) {
        if Some(address) == self.listen_addr() {
            return;
        }

        // an inbound peer's first NEW_NODE names its own listener
        if peer.set_announced(address) {
            self.known_nodes().insert(address);
            log::info!("Peer {} listens on {}", peer.addr, address);
            self.broadcast(Command::NewNode { address }, Some(peer.addr)).await;
            return;
        }

        if !self.known_nodes().insert(address) {
            return;
        }
        let connected = self
            .peers
            .read()
            .await
            .values()
            .any(|p| p.node_address() == Some(address));
        if connected {
            return;
        }

        match self.connect(address).await {
            Ok(_) => self.broadcast(Command::NewNode { address }, Some(peer.addr)).await,
            Err(e) => log::warn!("Failed to connect to announced node {}: {}", address, e),
        }
    }

    /// Keep producing blocks on top of the current tip. The search restarts
    /// whenever the chain or the pool changes.
    async fn mine_forever(self: Arc<Self>, address: Address) {
        log::info!("Mining to {}", address);
        while self.running.load(Ordering::SeqCst) {
            let (last, template, chain_revision, pool_revision) = match self.block_template(address) {
                Ok(template) => template,
                Err(e) => {
                    log::error!("Failed to assemble block: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let node = self.clone();
            let mined = tokio::task::spawn_blocking(move || {
                Miner::new().mine(&last, template, unix_now, || {
                    !node.running.load(Ordering::SeqCst)
                        || node.chain_revision.load(Ordering::SeqCst) != chain_revision
                        || node.pool().revision() != pool_revision
                })
            })
            .await;

            let result = match mined {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Mining task failed: {}", e);
                    return;
                }
            };
            let (attempts, hash_rate) = (result.attempts, result.hash_rate());
            let Some(block) = result.block else {
                log::debug!("Mining interrupted after {} attempts", attempts);
                continue;
            };

            match self.insert_block(&block) {
                Ok(AppendOutcome::Accepted { height }) => {
                    log::info!(
                        "Mined block {} at height {} ({} attempts, {:.0} H/s)",
                        block.hash(),
                        height,
                        attempts,
                        hash_rate
                    );
                    self.broadcast(Command::NewBlock { block }, None).await;
                }
                Ok(outcome) => log::debug!("Mined block not appended: {:?}", outcome),
                Err(e) => log::error!("Failed to store mined block: {}", e),
            }
        }
        log::info!("Mining stopped");
    }

    /// Coinbase plus a pool selection on top of the tip, with the
    /// revisions it was built from
    fn block_template(&self, address: Address) -> Result<(BlockHeader, Block, u64, u64), StoreError> {
        let chain_revision = self.chain_revision.load(Ordering::SeqCst);
        let last = self.store.last_block()?;
        let height = self.store.length()?;
        let utxos = self.store.get_utxos()?;

        let (pool_revision, (selected, fees)) = {
            let pool = self.pool();
            (pool.revision(), pool.select(&utxos, MAX_BLOCK_TRANSACTIONS))
        };

        let now = unix_now();
        let mut transactions = vec![Transaction::coinbase(
            address,
            reward(height).saturating_add(fees),
            now,
        )];
        transactions.extend(selected);

        let block = Block::assemble(last.hash(), now, transactions);
        Ok((last.header, block, chain_revision, pool_revision))
    }

    fn on_chain_changed(&self) -> Result<(), StoreError> {
        self.chain_revision.fetch_add(1, Ordering::SeqCst);
        let utxos = self.store.get_utxos()?;
        self.pool().prune(&utxos);
        Ok(())
    }

    fn pool(&self) -> MutexGuard<'_, TransactionPool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn known_nodes(&self) -> MutexGuard<'_, HashSet<SocketAddr>> {
        self.known_nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KeyPair, TxOutput};
    use std::time::Duration;

    fn test_config() -> NodeConfig {
        NodeConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            request_timeout_ms: 2_000,
            ..NodeConfig::default()
        }
    }

    async fn started_node(store: ChainStore) -> (Arc<Node>, SocketAddr) {
        let node = Node::new(test_config(), store);
        let addr = node.start().await.unwrap();
        (node, addr)
    }

    fn extend_chain(store: &ChainStore, count: usize) {
        for _ in 0..count {
            let last = store.last_block().unwrap();
            let block = Block::assemble(last.hash(), last.timestamp() + 1000, vec![]);
            store.append(&block).unwrap();
        }
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..250 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_answers_requests() {
        let store = ChainStore::memory().unwrap();
        extend_chain(&store, 2);
        let (node, addr) = started_node(store).await;

        let (events, _events_rx) = mpsc::channel(16);
        let client = PeerHandle::connect(addr, events, Duration::from_secs(2)).await.unwrap();

        match client.request(Command::ChainInfoRequest).await.unwrap() {
            Command::ChainInfo(info) => {
                assert_eq!(info.length, 3);
                assert_eq!(info.genesis_hash, Block::genesis().hash());
            }
            other => panic!("unexpected response {:?}", other),
        }

        let tip = node.store().tip_hash().unwrap();
        let exists = client.request(Command::HaveBlockRequest { hash: tip }).await.unwrap();
        assert_eq!(exists, Command::HaveBlock { exists: true });

        let block = client.request(Command::BlockRequest { height: 2 }).await.unwrap();
        assert_eq!(block, Command::Block { block: node.store().get(2).unwrap() });

        let missing = client.request(Command::BlockRequest { height: 9 }).await.unwrap();
        assert_eq!(missing, Command::Block { block: None });
    }

    #[tokio::test]
    async fn test_block_gossip_reaches_peer() {
        let (a, _) = started_node(ChainStore::memory().unwrap()).await;
        let (b, b_addr) = started_node(ChainStore::memory().unwrap()).await;
        a.connect(b_addr).await.unwrap();

        let last = a.store().last_block().unwrap();
        let block = Block::assemble(last.hash(), last.timestamp() + 1000, vec![]);
        let outcome = a.handle_new_block(block.clone(), None).await.unwrap();
        assert_eq!(outcome, AppendOutcome::Accepted { height: 1 });

        assert!(eventually(|| b.store().length().unwrap() == 2).await);
        assert_eq!(b.store().tip_hash().unwrap(), block.hash());

        // duplicate delivery is a no-op
        let again = a.handle_new_block(block, None).await.unwrap();
        assert_eq!(again, AppendOutcome::AlreadyKnown);
    }

    #[tokio::test]
    async fn test_unlinked_block_triggers_sync() {
        let ahead = ChainStore::memory().unwrap();
        extend_chain(&ahead, 4);
        let tip = ahead.last_block().unwrap();
        let (a, a_addr) = started_node(ahead).await;
        let (b, _) = started_node(ChainStore::memory().unwrap()).await;
        b.connect(a_addr).await.unwrap();

        // B only hears about A's tip, which does not link to its genesis
        let outcome = b.handle_new_block(tip.clone(), None).await.unwrap();
        assert!(matches!(outcome, AppendOutcome::Rejected(ref r) if r.is_linkage()));

        assert!(eventually(|| b.store().tip_hash().unwrap() == tip.hash()).await);
        assert_eq!(b.store().length().unwrap(), a.store().length().unwrap());
    }

    #[tokio::test]
    async fn test_transaction_gossip() {
        let alice = KeyPair::generate();
        let store = ChainStore::memory().unwrap();
        let last = store.last_block().unwrap();
        let coinbase = Transaction::coinbase(alice.address(), 500, 1);
        store
            .append(&Block::assemble(last.hash(), last.timestamp() + 1000, vec![coinbase.clone()]))
            .unwrap();

        let (a, a_addr) = started_node(store).await;
        let (b, _) = started_node(ChainStore::memory().unwrap()).await;
        b.connect(a_addr).await.unwrap();
        assert_eq!(
            b.sync_with_peers().await.unwrap(),
            SyncOutcome::Extended { from: 1, to: 2 }
        );
        assert!(eventually(|| a.peers.try_read().map(|p| p.len() == 1).unwrap_or(false)).await);

        let mut tx = Transaction::new(
            coinbase.output_ids(),
            vec![TxOutput::new(KeyPair::generate().address(), 400)],
            2,
        );
        tx.sign(&alice);

        assert_eq!(a.handle_new_transaction(tx.clone(), None).await.unwrap(), Ok(100));
        assert_eq!(
            a.handle_new_transaction(tx.clone(), None).await.unwrap(),
            Err(PoolError::Duplicate(tx.hash()))
        );
        assert_eq!(a.pending_transactions(), vec![tx.clone()]);
        assert!(eventually(|| b.pending_transactions() == vec![tx.clone()]).await);
    }

    #[tokio::test]
    async fn test_accepted_block_prunes_pool() {
        let alice = KeyPair::generate();
        let (node, _) = started_node(ChainStore::memory().unwrap()).await;

        let last = node.store().last_block().unwrap();
        let coinbase = Transaction::coinbase(alice.address(), 500, 1);
        node.insert_block(&Block::assemble(last.hash(), last.timestamp() + 1000, vec![coinbase.clone()]))
            .unwrap();

        let mut tx = Transaction::new(
            coinbase.output_ids(),
            vec![TxOutput::new(alice.address(), 500)],
            2,
        );
        tx.sign(&alice);
        assert_eq!(node.handle_new_transaction(tx.clone(), None).await.unwrap(), Ok(0));

        let last = node.store().last_block().unwrap();
        let including = Block::assemble(
            last.hash(),
            last.timestamp() + 1000,
            vec![Transaction::coinbase(alice.address(), 1, 3), tx],
        );
        assert_eq!(
            node.insert_block(&including).unwrap(),
            AppendOutcome::Accepted { height: 2 }
        );
        assert!(node.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_new_node_propagation() {
        let (a, a_addr) = started_node(ChainStore::memory().unwrap()).await;
        let (b, b_addr) = started_node(ChainStore::memory().unwrap()).await;
        let (c, _) = started_node(ChainStore::memory().unwrap()).await;

        // A <- B and A <- C; A relays each newcomer to the other
        b.connect(a_addr).await.unwrap();
        assert!(eventually(|| a.known_nodes().contains(&b_addr)).await);
        c.connect(a_addr).await.unwrap();

        assert!(eventually(|| c.known_nodes().contains(&b_addr)).await);
        assert!(eventually(|| b.known_nodes().len() >= 2).await);
    }

    #[tokio::test]
    async fn test_connect_announces_before_anything_else() {
        let (node, node_addr) = started_node(ChainStore::memory().unwrap()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let (connected, accepted) = tokio::join!(node.connect(remote), listener.accept());
        connected.unwrap();
        let (mut stream, _) = accepted.unwrap();

        let first = Message::from_stream(&mut stream).await.unwrap();
        assert_eq!(first.command, Command::NewNode { address: node_addr });
        assert_eq!(node.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_block_with_invalid_transaction_triggers_sync() {
        let longer = ChainStore::memory().unwrap();
        extend_chain(&longer, 4);
        let (a, a_addr) = started_node(longer).await;
        let (b, _) = started_node(ChainStore::memory().unwrap()).await;
        b.connect(a_addr).await.unwrap();

        // correctly linked, but the coinbase claims more than the reward
        let genesis = Block::genesis();
        let miner = KeyPair::generate().address();
        let block = Block::assemble(
            genesis.hash(),
            genesis.timestamp() + 1000,
            vec![Transaction::coinbase(miner, reward(1) + 1, 1)],
        );
        let outcome = b.handle_new_block(block, None).await.unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::Rejected(Rejection::InvalidTransaction { .. })
        ));

        let target = a.store().tip_hash().unwrap();
        assert!(eventually(|| b.store().tip_hash().unwrap() == target).await);
        assert_eq!(b.store().length().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_silent_peer_is_skipped_and_evicted_during_sync() {
        let longer = ChainStore::memory().unwrap();
        extend_chain(&longer, 2);
        let (a, a_addr) = started_node(longer).await;

        // accepts the connection and never answers
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let config = NodeConfig {
            request_timeout_ms: 200,
            ..test_config()
        };
        let b = Node::new(config, ChainStore::memory().unwrap());
        b.start().await.unwrap();
        b.connect(silent_addr).await.unwrap();
        b.connect(a_addr).await.unwrap();
        assert_eq!(b.peer_count().await, 2);

        let outcome = b.sync_with_peers().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Extended { from: 1, to: 3 });
        assert_eq!(b.store().tip_hash().unwrap(), a.store().tip_hash().unwrap());

        assert!(
            eventually(|| b.peers.try_read().map(|peers| peers.len() == 1).unwrap_or(false))
                .await
        );
        assert!(!b.peers.try_read().unwrap().contains_key(&silent_addr));
    }

    #[tokio::test]
    async fn test_mining_extends_chain() {
        let miner = KeyPair::generate();
        let config = NodeConfig {
            miner_address: Some(miner.address()),
            ..test_config()
        };
        let node = Node::new(config, ChainStore::memory().unwrap());
        node.start().await.unwrap();
        tokio::spawn(node.clone().mine_forever(miner.address()));

        assert!(eventually(|| node.store().length().unwrap() >= 2).await);
        node.stop();
        let utxos = node.store().get_utxos().unwrap();
        assert_eq!(utxos.balance(&miner.address()), reward(1));
    }
}
