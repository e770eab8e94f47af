// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! In-memory chain and network implementations for exercising the sync process without a node.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tari_sync_types::{Block, BlockHash, BlockHeader, Transaction};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    chain::{BlockAddResult, Chain, ChainError},
    messages::{ChainMessage, ChainStatus, GetBlockBy},
    peers::{PeerId, PeerNetwork, PeerNetworkError},
    sync::{locate_blocks, locate_headers},
};

/// Creates a linked chain of `n` blocks starting with genesis
pub fn create_chain(n: u64) -> Vec<Arc<Block>> {
    let mut blocks = Vec::with_capacity(n as usize);
    let mut header = BlockHeader::genesis(1_700_000_000_000);
    for height in 0..n {
        if height > 0 {
            header = BlockHeader::from_previous(&header);
            header.timestamp += 60_000;
        }
        let tx = Transaction::new(height.to_le_bytes().to_vec());
        header.transaction_root = tx.hash();
        blocks.push(Arc::new(Block::new(header.clone(), vec![tx])));
    }
    blocks
}

#[derive(Default)]
struct MockChainState {
    main_chain: Vec<Arc<Block>>,
    known: HashMap<BlockHash, Arc<Block>>,
    justified_height: Option<u64>,
    processed: Vec<u64>,
    orphan_once: HashSet<u64>,
    always_orphan: HashSet<u64>,
    reject: HashSet<u64>,
    dust: HashSet<u64>,
}

impl MockChainState {
    fn tip(&self) -> Result<&Arc<Block>, ChainError> {
        self.main_chain
            .last()
            .ok_or_else(|| ChainError::AccessError("chain has no genesis block".to_string()))
    }

    fn header_at(&self, height: u64) -> Result<&Arc<Block>, ChainError> {
        self.main_chain
            .get(height as usize)
            .ok_or_else(|| ChainError::ValueNotFound {
                entity: "BlockHeader",
                field: "height",
                value: height.to_string(),
            })
    }

    fn by_hash(&self, hash: &BlockHash) -> Result<&Arc<Block>, ChainError> {
        self.known.get(hash).ok_or_else(|| ChainError::ValueNotFound {
            entity: "Block",
            field: "hash",
            value: hash.to_hex(),
        })
    }
}

/// A chain that accepts blocks which extend its tip. Individual heights can be configured to be reported as orphans,
/// rejected, or accepted without advancing the tip.
#[derive(Default)]
pub struct MockChain {
    state: RwLock<MockChainState>,
}

impl MockChain {
    pub fn new(blocks: Vec<Arc<Block>>) -> Self {
        let known = blocks.iter().map(|b| (b.hash(), b.clone())).collect();
        Self {
            state: RwLock::new(MockChainState {
                main_chain: blocks,
                known,
                ..Default::default()
            }),
        }
    }

    /// Heights passed to `process_block`, in call order
    pub fn processed_heights(&self) -> Vec<u64> {
        acquire_read_lock!(self.state).processed.clone()
    }

    pub fn height(&self) -> u64 {
        (acquire_read_lock!(self.state).main_chain.len() as u64).saturating_sub(1)
    }

    /// Defaults to the best height
    pub fn set_justified_height(&self, height: u64) {
        acquire_write_lock!(self.state).justified_height = Some(height);
    }

    pub fn set_orphan_once(&self, height: u64) {
        acquire_write_lock!(self.state).orphan_once.insert(height);
    }

    pub fn set_always_orphan(&self, height: u64) {
        acquire_write_lock!(self.state).always_orphan.insert(height);
    }

    pub fn set_reject(&self, height: u64) {
        acquire_write_lock!(self.state).reject.insert(height);
    }

    /// Blocks at `height` are accepted without becoming the new tip
    pub fn set_dust(&self, height: u64) {
        acquire_write_lock!(self.state).dust.insert(height);
    }

    pub fn status(&self) -> Result<ChainStatus, ChainError> {
        let state = acquire_read_lock!(self.state);
        let best = state.tip()?;
        let justified_height = state.justified_height.unwrap_or(best.height()).min(best.height());
        let justified = state.header_at(justified_height)?;
        Ok(ChainStatus::new(&best.header, &justified.header))
    }
}

#[async_trait]
impl Chain for MockChain {
    async fn best_block_height(&self) -> Result<u64, ChainError> {
        Ok(acquire_read_lock!(self.state).tip()?.height())
    }

    async fn best_block_header(&self) -> Result<BlockHeader, ChainError> {
        Ok(acquire_read_lock!(self.state).tip()?.header.clone())
    }

    async fn last_justified_header(&self) -> Result<BlockHeader, ChainError> {
        let state = acquire_read_lock!(self.state);
        let best_height = state.tip()?.height();
        let height = state.justified_height.unwrap_or(best_height).min(best_height);
        Ok(state.header_at(height)?.header.clone())
    }

    async fn get_block_by_height(&self, height: u64) -> Result<Block, ChainError> {
        Ok(acquire_read_lock!(self.state).header_at(height)?.as_ref().clone())
    }

    async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        Ok(acquire_read_lock!(self.state).by_hash(hash)?.as_ref().clone())
    }

    async fn get_header_by_height(&self, height: u64) -> Result<BlockHeader, ChainError> {
        Ok(acquire_read_lock!(self.state).header_at(height)?.header.clone())
    }

    async fn get_header_by_hash(&self, hash: &BlockHash) -> Result<BlockHeader, ChainError> {
        Ok(acquire_read_lock!(self.state).by_hash(hash)?.header.clone())
    }

    async fn in_main_chain(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        let state = acquire_read_lock!(self.state);
        let in_main_chain = match state.known.get(hash) {
            Some(block) => state
                .main_chain
                .get(block.height() as usize)
                .map(|b| b.hash() == *hash)
                .unwrap_or(false),
            None => false,
        };
        Ok(in_main_chain)
    }

    async fn process_block(&self, block: Arc<Block>) -> Result<BlockAddResult, ChainError> {
        let mut state = acquire_write_lock!(self.state);
        let height = block.height();
        state.processed.push(height);

        if state.reject.contains(&height) {
            return Err(ChainError::InvalidBlock(format!("block #{} rejected", height)));
        }
        if state.orphan_once.remove(&height) || state.always_orphan.contains(&height) {
            return Ok(BlockAddResult::OrphanBlock);
        }
        let hash = block.hash();
        if state.known.contains_key(&hash) {
            return Ok(BlockAddResult::BlockExists);
        }
        if state.dust.contains(&height) {
            return Ok(BlockAddResult::Ok);
        }
        let tip = state.tip()?;
        if !tip.header.is_parent_of(&block.header) {
            return Ok(BlockAddResult::OrphanBlock);
        }
        state.known.insert(hash, block.clone());
        state.main_chain.push(block);
        Ok(BlockAddResult::Ok)
    }

    async fn validate_tx(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.payload.is_empty() {
            return Err(ChainError::InvalidTransaction("empty payload".to_string()));
        }
        Ok(false)
    }
}

/// How a simulated remote peer answers requests
#[derive(Debug, Clone, Default)]
pub struct RemoteBehaviour {
    /// Never answer
    pub silent: bool,
    /// Never answer block range requests
    pub silent_blocks: bool,
    /// Alter the header at this skeleton index before answering
    pub tamper_skeleton_index: Option<usize>,
    /// Truncate header responses to this many headers
    pub max_skeleton_len: Option<usize>,
    /// Drop the second block of every block batch
    pub break_links: bool,
}

struct RemotePeer {
    chain: Arc<MockChain>,
    behaviour: RemoteBehaviour,
}

#[derive(Default)]
struct MockNetworkState {
    sent: Vec<(PeerId, ChainMessage)>,
    bans: Vec<(PeerId, Duration)>,
    unreachable: HashSet<PeerId>,
    remotes: HashMap<PeerId, RemotePeer>,
}

/// Records outgoing messages and bans. Registered remote peers answer requests from their own chain, with replies
/// delivered to the inbound channel.
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<MockNetworkState>,
    inbound: Option<mpsc::UnboundedSender<(PeerId, ChainMessage)>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbound() -> (Self, mpsc::UnboundedReceiver<(PeerId, ChainMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let network = Self {
            state: Mutex::new(MockNetworkState::default()),
            inbound: Some(tx),
        };
        (network, rx)
    }

    pub fn add_remote(&self, peer_id: PeerId, chain: Arc<MockChain>, behaviour: RemoteBehaviour) {
        acquire_lock!(self.state)
            .remotes
            .insert(peer_id, RemotePeer { chain, behaviour });
    }

    pub fn set_unreachable(&self, peer_id: PeerId) {
        acquire_lock!(self.state).unreachable.insert(peer_id);
    }

    pub fn sent(&self) -> Vec<(PeerId, ChainMessage)> {
        acquire_lock!(self.state).sent.clone()
    }

    /// Heights of every `GetBlock` by height sent to `peer_id`, in order
    pub fn block_requests(&self, peer_id: &PeerId) -> Vec<u64> {
        acquire_lock!(self.state)
            .sent
            .iter()
            .filter(|(p, _)| p == peer_id)
            .filter_map(|(_, msg)| match msg {
                ChainMessage::GetBlock(GetBlockBy::Height(height)) => Some(*height),
                _ => None,
            })
            .collect()
    }

    pub fn bans(&self) -> Vec<(PeerId, Duration)> {
        acquire_lock!(self.state).bans.clone()
    }

    pub fn banned_peers(&self) -> Vec<PeerId> {
        acquire_lock!(self.state).bans.iter().map(|(p, _)| p.clone()).collect()
    }

    async fn answer(chain: &MockChain, behaviour: &RemoteBehaviour, msg: ChainMessage) -> Option<ChainMessage> {
        match msg {
            ChainMessage::GetBlock(GetBlockBy::Height(height)) => {
                chain.get_block_by_height(height).await.ok().map(|b| ChainMessage::Block(Arc::new(b)))
            },
            ChainMessage::GetBlock(GetBlockBy::Hash(hash)) => {
                chain.get_block_by_hash(&hash).await.ok().map(|b| ChainMessage::Block(Arc::new(b)))
            },
            ChainMessage::GetHeaders {
                locator,
                stop_hash,
                skip,
            } => {
                let mut headers = locate_headers(chain, &locator, &stop_hash, skip, 1000).await.ok()?;
                if let Some(len) = behaviour.max_skeleton_len {
                    headers.truncate(len);
                }
                if let Some(index) = behaviour.tamper_skeleton_index {
                    if let Some(header) = headers.get_mut(index) {
                        header.nonce += 1;
                    }
                }
                Some(ChainMessage::Headers(headers))
            },
            ChainMessage::GetBlocks { .. } if behaviour.silent_blocks => None,
            ChainMessage::GetBlocks { locator, stop_hash } => {
                let deadline = Instant::now() + Duration::from_secs(9);
                let mut blocks = locate_blocks(chain, &locator, &stop_hash, 64, deadline).await.ok()?;
                if behaviour.break_links && blocks.len() > 2 {
                    blocks.remove(1);
                }
                Some(ChainMessage::Blocks(blocks))
            },
            _ => None,
        }
    }
}

#[async_trait]
impl PeerNetwork for MockNetwork {
    async fn send_message(&self, peer_id: &PeerId, msg: ChainMessage) -> Result<(), PeerNetworkError> {
        let remote = {
            let mut state = acquire_lock!(self.state);
            if state.unreachable.contains(peer_id) {
                return Err(PeerNetworkError::SendFailed {
                    peer: peer_id.clone(),
                    details: "unreachable".to_string(),
                });
            }
            state.sent.push((peer_id.clone(), msg.clone()));
            state
                .remotes
                .get(peer_id)
                .map(|r| (r.chain.clone(), r.behaviour.clone()))
        };

        if let (Some((chain, behaviour)), Some(inbound)) = (remote, self.inbound.as_ref()) {
            if behaviour.silent {
                return Ok(());
            }
            if let Some(reply) = Self::answer(&chain, &behaviour, msg).await {
                let _ = inbound.send((peer_id.clone(), reply));
            }
        }
        Ok(())
    }

    async fn ban_peer_until(
        &self,
        peer_id: &PeerId,
        duration: Duration,
        _reason: String,
    ) -> Result<(), PeerNetworkError> {
        acquire_lock!(self.state).bans.push((peer_id.clone(), duration));
        Ok(())
    }
}
