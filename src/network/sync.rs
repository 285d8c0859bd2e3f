// Chain synchronization: compare chain quality and replicate the best one

use crate::consensus::Rejection;
use crate::core::{Block, Hash256, unix_now};
use crate::network::message::{ChainInfo, Command};
use crate::network::peer::{PeerError, PeerHandle};
use crate::storage::{AppendOutcome, ChainStore, StoreError};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer did not respond in time")]
    PeerTimeout,

    #[error("peer error: {0}")]
    Peer(PeerError),

    #[error("expected {expected} response, got {found}")]
    UnexpectedResponse {
        expected: &'static str,
        found: &'static str,
    },

    #[error("peer has no block at height {0}")]
    MissingBlock(u64),

    #[error("peer served an already stored block as height {0}")]
    AlreadyKnown(u64),

    #[error("block at height {height} rejected: {rejection}")]
    Replication { height: u64, rejection: Rejection },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<PeerError> for SyncError {
    fn from(error: PeerError) -> Self {
        match error {
            PeerError::Timeout => SyncError::PeerTimeout,
            other => SyncError::Peer(other),
        }
    }
}

/// Anything a chain can be replicated from
pub trait ChainSource {
    /// Label used in log lines
    fn name(&self) -> String;

    fn chain_info(&self) -> impl Future<Output = Result<ChainInfo, SyncError>> + Send;

    fn has_block(&self, hash: Hash256) -> impl Future<Output = Result<bool, SyncError>> + Send;

    fn block(&self, height: u64) -> impl Future<Output = Result<Option<Block>, SyncError>> + Send;
}

impl ChainSource for PeerHandle {
    fn name(&self) -> String {
        self.addr.to_string()
    }

    async fn chain_info(&self) -> Result<ChainInfo, SyncError> {
        match self.request(Command::ChainInfoRequest).await? {
            Command::ChainInfo(info) => Ok(info),
            other => Err(unexpected("CHAIN_INFO", &other)),
        }
    }

    async fn has_block(&self, hash: Hash256) -> Result<bool, SyncError> {
        match self.request(Command::HaveBlockRequest { hash }).await? {
            Command::HaveBlock { exists } => Ok(exists),
            other => Err(unexpected("HAVE_THIS_BLOCK_HASH", &other)),
        }
    }

    async fn block(&self, height: u64) -> Result<Option<Block>, SyncError> {
        match self.request(Command::BlockRequest { height }).await? {
            Command::Block { block } => Ok(block),
            other => Err(unexpected("BLOCK", &other)),
        }
    }
}

impl ChainSource for ChainStore {
    fn name(&self) -> String {
        "local store".to_string()
    }

    async fn chain_info(&self) -> Result<ChainInfo, SyncError> {
        Ok(chain_info(self)?)
    }

    async fn has_block(&self, hash: Hash256) -> Result<bool, SyncError> {
        Ok(self.block_exists(&hash)?)
    }

    async fn block(&self, height: u64) -> Result<Option<Block>, SyncError> {
        Ok(self.get(height)?)
    }
}

fn unexpected(expected: &'static str, found: &Command) -> SyncError {
    SyncError::UnexpectedResponse {
        expected,
        found: found.code(),
    }
}

/// Summary of a local store, as answered to `CHAIN_INFO?`
pub fn chain_info(store: &ChainStore) -> Result<ChainInfo, StoreError> {
    let (genesis, length) = store.summary()?;
    Ok(ChainInfo {
        length,
        genesis_hash: genesis.hash(),
        genesis_time: genesis.timestamp,
    })
}

/// Chain quality ordering. Every node must use the same one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ForkChoice {
    /// Strictly more blocks wins
    #[default]
    Length,
    /// Blocks per minute since genesis; minutes are floored at 1
    Density,
}

impl ForkChoice {
    /// Whether `candidate` is strictly better than `current` at time `now`
    pub fn is_better(&self, candidate: &ChainInfo, current: &ChainInfo, now: u64) -> bool {
        match self {
            ForkChoice::Length => candidate.length > current.length,
            ForkChoice::Density => {
                let minutes = |info: &ChainInfo| (now.saturating_sub(info.genesis_time) / 60).max(1);
                // compare length/minutes without division
                candidate.length as u128 * minutes(current) as u128
                    > current.length as u128 * minutes(candidate) as u128
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No peer offered a better chain
    UpToDate,
    /// Missing blocks were appended on top of the local tip
    Extended { from: u64, to: u64 },
    /// The local chain was discarded for the peer's
    Replaced { length: u64 },
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, SyncOutcome::UpToDate)
    }
}

/// One round of `query peers -> pick best -> replicate`
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainSync {
    fork_choice: ForkChoice,
}

impl ChainSync {
    pub fn new(fork_choice: ForkChoice) -> Self {
        Self { fork_choice }
    }

    pub fn fork_choice(&self) -> ForkChoice {
        self.fork_choice
    }

    /// Query every peer and converge `store` to the best chain found.
    ///
    /// Peers failing to answer the summary are skipped. Any failure while
    /// replicating aborts this attempt; a replacement only touches `store`
    /// once the whole chain has been validated.
    pub async fn sync<S: ChainSource>(
        &self,
        store: &ChainStore,
        peers: &[S],
    ) -> Result<SyncOutcome, SyncError> {
        let now = unix_now();
        let local = chain_info(store)?;

        let mut best: Option<(&S, ChainInfo)> = None;
        for peer in peers {
            let info = match peer.chain_info().await {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("Skipping peer {}: {}", peer.name(), e);
                    continue;
                }
            };
            let current = best.as_ref().map(|(_, info)| info).unwrap_or(&local);
            if self.fork_choice.is_better(&info, current, now) {
                best = Some((peer, info));
            }
        }

        let Some((peer, info)) = best else {
            log::info!("No better chain found");
            return Ok(SyncOutcome::UpToDate);
        };
        log::info!(
            "Better chain found at {} ({} blocks, local {})",
            peer.name(),
            info.length,
            local.length
        );

        let tip = store.tip_hash()?;
        if peer.has_block(tip).await? {
            self.extend(store, peer, local.length, info.length).await
        } else {
            log::info!("Local tip {} unknown to {}, rebuilding from genesis", tip, peer.name());
            self.replace(store, peer, info.length).await
        }
    }

    async fn extend<S: ChainSource>(
        &self,
        store: &ChainStore,
        peer: &S,
        from: u64,
        to: u64,
    ) -> Result<SyncOutcome, SyncError> {
        // a denser but not longer chain sharing our tip has nothing to add
        if to <= from {
            return Ok(SyncOutcome::UpToDate);
        }
        for height in from..to {
            log::info!("Updating chain ({}/{})", height, to);
            let block = fetch(peer, height).await?;
            replicate(store, height, &block)?;
        }
        log::info!("Chain updated to {} blocks", to);
        Ok(SyncOutcome::Extended { from, to })
    }

    async fn replace<S: ChainSource>(
        &self,
        store: &ChainStore,
        peer: &S,
        length: u64,
    ) -> Result<SyncOutcome, SyncError> {
        let genesis = fetch(peer, 0).await?;
        let staged = ChainStore::memory_with_genesis(&genesis)?;

        for height in 1..length {
            log::info!("Rebuilding chain ({}/{})", height, length);
            let block = fetch(peer, height).await?;
            replicate(&staged, height, &block)?;
        }

        store.replace_with(&staged)?;
        log::info!("Chain replaced with {} blocks from {}", length, peer.name());
        Ok(SyncOutcome::Replaced { length })
    }
}

async fn fetch<S: ChainSource>(peer: &S, height: u64) -> Result<Block, SyncError> {
    peer.block(height)
        .await?
        .ok_or(SyncError::MissingBlock(height))
}

/// Append through full local validation; a peer's word is never trusted
fn replicate(store: &ChainStore, height: u64, block: &Block) -> Result<(), SyncError> {
    match store.append(block)? {
        AppendOutcome::Accepted { .. } => Ok(()),
        AppendOutcome::AlreadyKnown => Err(SyncError::AlreadyKnown(height)),
        AppendOutcome::Rejected(rejection) => Err(SyncError::Replication { height, rejection }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockHeader, KeyPair, Transaction};

    /// Append `count` empty blocks spaced `1000 + skew` seconds apart
    fn extend_chain(store: &ChainStore, count: usize, skew: u64) {
        for _ in 0..count {
            let last = store.last_block().unwrap();
            let block = Block::assemble(last.hash(), last.timestamp() + 1000 + skew, vec![]);
            assert!(matches!(store.append(&block).unwrap(), AppendOutcome::Accepted { .. }));
        }
    }

    fn info(length: u64, genesis_time: u64) -> ChainInfo {
        ChainInfo {
            length,
            genesis_hash: Hash256::default(),
            genesis_time,
        }
    }

    /// Serves a chain but hands out a doctored block at one height
    struct Doctored {
        inner: ChainStore,
        height: u64,
    }

    impl ChainSource for Doctored {
        fn name(&self) -> String {
            "doctored".to_string()
        }

        async fn chain_info(&self) -> Result<ChainInfo, SyncError> {
            self.inner.chain_info().await
        }

        async fn has_block(&self, hash: Hash256) -> Result<bool, SyncError> {
            self.inner.has_block(hash).await
        }

        async fn block(&self, height: u64) -> Result<Option<Block>, SyncError> {
            let mut block = self.inner.block(height).await?;
            if height == self.height {
                if let Some(block) = block.as_mut() {
                    block.header.nonce += 1;
                }
            }
            Ok(block)
        }
    }

    #[test]
    fn test_length_fork_choice() {
        let choice = ForkChoice::Length;
        assert!(choice.is_better(&info(5, 0), &info(4, 0), 0));
        assert!(!choice.is_better(&info(4, 0), &info(4, 0), 0));
        assert!(!choice.is_better(&info(3, 0), &info(4, 0), 0));
    }

    #[test]
    fn test_density_fork_choice() {
        let choice = ForkChoice::Density;
        let now = 100 * 60;

        // 10 blocks in 10 minutes beats 20 blocks in 100 minutes
        assert!(choice.is_better(&info(10, now - 600), &info(20, 0), now));
        assert!(!choice.is_better(&info(20, 0), &info(10, now - 600), now));

        // a chain younger than a minute counts as one minute old
        assert!(choice.is_better(&info(3, now), &info(2, now - 30), now));
        assert!(!choice.is_better(&info(2, now), &info(2, now - 59), now));
    }

    #[tokio::test]
    async fn test_sync_extends_with_missing_suffix() {
        let a = ChainStore::memory().unwrap();
        let b = ChainStore::memory().unwrap();
        extend_chain(&a, 2, 0);
        extend_chain(&b, 2, 0);
        extend_chain(&b, 3, 0);

        let outcome = ChainSync::default().sync(&a, &[b]).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Extended { from: 3, to: 6 });
    }

    #[tokio::test]
    async fn test_sync_matches_longer_peer_tip() {
        let a = ChainStore::memory().unwrap();
        let b = ChainStore::memory().unwrap();
        extend_chain(&a, 1, 0);
        extend_chain(&b, 4, 0);

        let outcome = ChainSync::default().sync(&a, std::slice::from_ref(&b)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Extended { from: 2, to: 5 });
        assert_eq!(a.length().unwrap(), b.length().unwrap());
        assert_eq!(a.tip_hash().unwrap(), b.tip_hash().unwrap());
    }

    #[tokio::test]
    async fn test_sync_replaces_forked_chain() {
        let a = ChainStore::memory().unwrap();
        let b = ChainStore::memory().unwrap();
        let miner = KeyPair::generate();

        // same genesis, diverging right after it
        let last = a.last_block().unwrap();
        let coinbase = Transaction::coinbase(miner.address(), 10, 1);
        a.append(&Block::assemble(last.hash(), last.timestamp() + 1000, vec![coinbase]))
            .unwrap();
        extend_chain(&a, 1, 0);
        extend_chain(&b, 4, 7);

        let outcome = ChainSync::default().sync(&a, std::slice::from_ref(&b)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Replaced { length: 5 });
        assert_eq!(a.tip_hash().unwrap(), b.tip_hash().unwrap());
        for height in 0..5 {
            assert_eq!(a.get(height).unwrap(), b.get(height).unwrap());
        }
        // the discarded coinbase no longer counts
        assert_eq!(a.get_utxos().unwrap().balance(&miner.address()), 0);
    }

    #[tokio::test]
    async fn test_sync_adopts_peer_genesis() {
        let a = ChainStore::memory().unwrap();
        let other_genesis = Block::new(
            BlockHeader::new(None, Block::genesis().timestamp() + 1, 0, None),
            vec![],
        );
        let b = ChainStore::memory_with_genesis(&other_genesis).unwrap();
        extend_chain(&b, 2, 0);

        let outcome = ChainSync::default().sync(&a, std::slice::from_ref(&b)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Replaced { length: 3 });
        assert_eq!(a.genesis().unwrap(), other_genesis);

        let info = chain_info(&a).unwrap();
        assert_eq!(info.length, 3);
        assert_eq!(info.genesis_hash, other_genesis.hash());
        assert_eq!(info.genesis_time, other_genesis.timestamp());
    }

    #[tokio::test]
    async fn test_sync_ignores_shorter_or_equal_peers() {
        let a = ChainStore::memory().unwrap();
        let b = ChainStore::memory().unwrap();
        extend_chain(&a, 3, 0);
        extend_chain(&b, 3, 5);
        let tip = a.tip_hash().unwrap();

        let outcome = ChainSync::default().sync(&a, &[b]).await.unwrap();
        assert_eq!(outcome, SyncOutcome::UpToDate);
        assert_eq!(a.tip_hash().unwrap(), tip);
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_store_intact() {
        let a = ChainStore::memory().unwrap();
        extend_chain(&a, 1, 3);
        let tip = a.tip_hash().unwrap();

        let b = ChainStore::memory().unwrap();
        extend_chain(&b, 4, 0);
        let doctored = Doctored { inner: b, height: 2 };

        let result = ChainSync::default().sync(&a, &[doctored]).await;

        // the altered block links fine, its successor no longer does
        assert!(matches!(
            result,
            Err(SyncError::Replication { height: 3, ref rejection }) if rejection.is_linkage()
        ));
        assert_eq!(a.length().unwrap(), 2);
        assert_eq!(a.tip_hash().unwrap(), tip);
    }

    #[tokio::test]
    async fn test_best_of_several_peers() {
        let a = ChainStore::memory().unwrap();
        let peers: Vec<ChainStore> = [2, 5, 3]
            .into_iter()
            .map(|count| {
                let store = ChainStore::memory().unwrap();
                extend_chain(&store, count, 0);
                store
            })
            .collect();

        ChainSync::default().sync(&a, &peers).await.unwrap();
        assert_eq!(a.tip_hash().unwrap(), peers[1].tip_hash().unwrap());
    }
}
