//! The block tree and canonical chain.
//!
//! Blocks form a tree rooted at genesis; edges point from child to parent by
//! hash, so nodes live in a flat arena and traversal is hash lookup. The
//! canonical chain is the unique path from genesis to the current tail.

use crate::core::address::Address;
use crate::core::block::{Block, BlockError};
use crate::core::block_pool::{BlockPool, ForkChoice, NoActionForkChoice, PoolError};
use crate::core::payload::ContractEngine;
use crate::core::transaction::{Transaction, TransactionError, TRANSACTION_GAS_PRICE};
use crate::state::StateDB;
use crate::types::hash::Hash;
use crate::types::uint128::Uint128;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

/// Process-wide chain parameters, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct ChainConfig {
    pub chain_id: u32,
    /// Spacing between consecutive block timestamps, in seconds.
    pub block_interval: i64,
}

impl ChainConfig {
    pub fn new(chain_id: u32, block_interval: i64) -> Self {
        Self {
            chain_id,
            block_interval,
        }
    }
}

/// Errors produced by tree operations.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block not found in chain")]
    UnknownBlock,

    #[error("missing parent block")]
    MissingParent,

    #[error("block is not on the canonical chain")]
    NotCanonical,

    #[error("only sealed blocks may enter the chain")]
    NotSealed,

    #[error("invalid block timestamp")]
    InvalidTimestamp,

    #[error("irreversible block may only advance along the canonical chain")]
    InvalidLib,

    #[error(transparent)]
    Block(#[from] BlockError),
}

struct BlockNode {
    block: Arc<Block>,
    parent: Option<Hash>,
    children: HashSet<Hash>,
}

struct ChainInner {
    nodes: HashMap<Hash, BlockNode>,
    tail: Hash,
    lib: Hash,
}

impl ChainInner {
    fn block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.nodes.get(hash).map(|node| node.block.clone())
    }

    fn parent_of(&self, hash: &Hash) -> Option<Hash> {
        self.nodes.get(hash).and_then(|node| node.parent)
    }

    fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.nodes.get(hash).map(|node| node.block.height())
    }

    /// Walks both blocks up to equal height, then steps them in lockstep
    /// until they meet.
    fn common_ancestor(&self, a: &Hash, b: &Hash) -> Result<Hash, ChainError> {
        let mut a = *a;
        let mut b = *b;
        let mut height_a = self.height_of(&a).ok_or(ChainError::UnknownBlock)?;
        let mut height_b = self.height_of(&b).ok_or(ChainError::UnknownBlock)?;

        while height_a > height_b {
            a = self.parent_of(&a).ok_or(ChainError::MissingParent)?;
            height_a -= 1;
        }
        while height_b > height_a {
            b = self.parent_of(&b).ok_or(ChainError::MissingParent)?;
            height_b -= 1;
        }

        while a != b {
            a = self.parent_of(&a).ok_or(ChainError::MissingParent)?;
            b = self.parent_of(&b).ok_or(ChainError::MissingParent)?;
        }
        Ok(a)
    }

    /// True if `ancestor` lies on the path from `descendant` to genesis.
    fn is_ancestor(&self, ancestor: &Hash, descendant: &Hash) -> bool {
        let Some(target_height) = self.height_of(ancestor) else {
            return false;
        };

        let mut cursor = *descendant;
        loop {
            let Some(height) = self.height_of(&cursor) else {
                return false;
            };
            if height < target_height {
                return false;
            }
            if height == target_height {
                return cursor == *ancestor;
            }
            match self.parent_of(&cursor) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}

/// The fork-aware chain: a block tree with a canonical tail and a finality
/// marker.
///
/// One reader-writer lock guards the tree: attachments and tail changes
/// serialize, read-only queries run in parallel with each other.
pub struct BlockChain {
    config: ChainConfig,
    genesis: Hash,
    engine: Arc<dyn ContractEngine>,
    pool: BlockPool,
    inner: RwLock<ChainInner>,
}

impl BlockChain {
    /// Creates a chain from its genesis allocations, with manual fork
    /// choice: the tail only moves through [`BlockChain::set_tail_block`].
    pub fn new(config: ChainConfig, genesis_state: StateDB, engine: Arc<dyn ContractEngine>) -> Self {
        Self::with_fork_choice(config, genesis_state, engine, Box::new(NoActionForkChoice))
    }

    /// Creates a chain whose pool drives the given fork-choice policy after
    /// each attachment.
    pub fn with_fork_choice(
        config: ChainConfig,
        genesis_state: StateDB,
        engine: Arc<dyn ContractEngine>,
        fork_choice: Box<dyn ForkChoice>,
    ) -> Self {
        let genesis = Block::genesis(config.chain_id, genesis_state);
        let genesis_hash = genesis.hash();

        info!(chain_id = config.chain_id, genesis = %genesis_hash, "initializing blockchain");

        let mut nodes = HashMap::new();
        nodes.insert(
            genesis_hash,
            BlockNode {
                block: Arc::new(genesis),
                parent: None,
                children: HashSet::new(),
            },
        );

        BlockChain {
            config,
            genesis: genesis_hash,
            engine,
            pool: BlockPool::new(fork_choice),
            inner: RwLock::new(ChainInner {
                nodes,
                tail: genesis_hash,
                lib: genesis_hash,
            }),
        }
    }

    pub fn chain_id(&self) -> u32 {
        self.config.chain_id
    }

    pub fn block_interval(&self) -> i64 {
        self.config.block_interval
    }

    /// Returns the genesis block.
    pub fn genesis_block(&self) -> Arc<Block> {
        let inner = self.inner.read().unwrap();
        inner.block(&self.genesis).expect("genesis always present")
    }

    /// Returns the current canonical tail.
    pub fn tail_block(&self) -> Arc<Block> {
        let inner = self.inner.read().unwrap();
        let tail = inner.tail;
        inner.block(&tail).expect("tail always present")
    }

    /// Returns the latest irreversible block.
    pub fn lib_block(&self) -> Arc<Block> {
        let inner = self.inner.read().unwrap();
        let lib = inner.lib;
        inner.block(&lib).expect("lib always present")
    }

    /// Returns true if a block with the given hash is in the tree.
    pub fn has_block(&self, hash: &Hash) -> bool {
        self.inner.read().unwrap().nodes.contains_key(hash)
    }

    /// Returns the block with the given hash, if present.
    pub fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.inner.read().unwrap().block(hash)
    }

    /// Produces an unsealed block parented on the current tail.
    ///
    /// The timestamp defaults to one block interval past the tail; callers
    /// may adjust it before sealing.
    pub fn new_block(&self, coinbase: Address) -> Block {
        let tail = self.tail_block();
        Block::new(&tail, coinbase, tail.timestamp() + self.config.block_interval)
    }

    /// Admits a block arriving from the network into the pool.
    pub fn push_block(&self, block: Block) -> Result<(), PoolError> {
        self.pool.push(self, block)
    }

    /// Attaches a sealed block under its parent, replaying its body against
    /// the parent state to validate the header roots.
    pub(crate) fn attach_block(&self, mut block: Block) -> Result<Arc<Block>, ChainError> {
        if !block.is_sealed() {
            return Err(ChainError::NotSealed);
        }

        let mut inner = self.inner.write().unwrap();

        let parent_hash = block.parent_hash();
        let parent = inner
            .nodes
            .get(&parent_hash)
            .map(|node| node.block.clone())
            .ok_or(ChainError::MissingParent)?;

        let delta = block.timestamp() - parent.timestamp();
        if delta <= 0 || delta % self.config.block_interval != 0 {
            return Err(ChainError::InvalidTimestamp);
        }

        block.set_height(parent.height() + 1);
        block.verify_execution(parent.state(), self.engine.as_ref())?;

        let hash = block.hash();
        let arc = Arc::new(block);
        inner.nodes.insert(
            hash,
            BlockNode {
                block: arc.clone(),
                parent: Some(parent_hash),
                children: HashSet::new(),
            },
        );
        if let Some(parent_node) = inner.nodes.get_mut(&parent_hash) {
            parent_node.children.insert(hash);
        }

        info!(
            hash = %hash,
            height = arc.height(),
            txs = arc.transactions().len(),
            "attached block to the chain"
        );
        Ok(arc)
    }

    /// Moves the canonical tip to `hash`.
    ///
    /// On a fork switch the common ancestor with the old tail is located and
    /// the reorganization is logged; the finality marker must remain an
    /// ancestor of the new tail.
    pub fn set_tail_block(&self, hash: &Hash) -> Result<(), ChainError> {
        let mut inner = self.inner.write().unwrap();

        if !inner.nodes.contains_key(hash) {
            return Err(ChainError::UnknownBlock);
        }

        let old_tail = inner.tail;
        if old_tail == *hash {
            return Ok(());
        }

        if !inner.is_ancestor(&inner.lib, hash) {
            return Err(ChainError::InvalidLib);
        }

        let ancestor = inner.common_ancestor(&old_tail, hash)?;

        let reverted = inner.height_of(&old_tail).unwrap_or(0)
            - inner.height_of(&ancestor).unwrap_or(0);
        let applied =
            inner.height_of(hash).unwrap_or(0) - inner.height_of(&ancestor).unwrap_or(0);
        if reverted > 0 {
            info!(
                old_tail = %old_tail,
                new_tail = %hash,
                ancestor = %ancestor,
                reverted,
                applied,
                "chain reorganization"
            );
        }

        inner.tail = *hash;
        Ok(())
    }

    /// Advances the latest irreversible block.
    ///
    /// The target must lie on the canonical chain and never move backwards;
    /// the advancement policy itself belongs to the consensus producer.
    pub fn set_lib(&self, hash: &Hash) -> Result<(), ChainError> {
        let mut inner = self.inner.write().unwrap();

        if !inner.nodes.contains_key(hash) {
            return Err(ChainError::UnknownBlock);
        }

        let tail = inner.tail;
        if !inner.is_ancestor(hash, &tail) {
            return Err(ChainError::InvalidLib);
        }

        let current = inner.height_of(&inner.lib).unwrap_or(0);
        let proposed = inner.height_of(hash).unwrap_or(0);
        if proposed < current {
            return Err(ChainError::InvalidLib);
        }

        inner.lib = *hash;
        Ok(())
    }

    /// Finds the deepest block lying on both the path from genesis to
    /// `hash` and the path from genesis to the tail.
    pub fn find_common_ancestor_with_tail(&self, hash: &Hash) -> Result<Arc<Block>, ChainError> {
        let inner = self.inner.read().unwrap();
        let tail = inner.tail;
        let ancestor = inner.common_ancestor(hash, &tail)?;
        inner.block(&ancestor).ok_or(ChainError::UnknownBlock)
    }

    /// Returns up to `n` successive canonical descendants of `from`.
    ///
    /// Empty when `from` is the tail; fails when `from` does not lie on the
    /// canonical chain.
    pub fn fetch_descendant_in_canonical_chain(
        &self,
        n: usize,
        from: &Hash,
    ) -> Result<Vec<Arc<Block>>, ChainError> {
        let inner = self.inner.read().unwrap();

        let mut path = Vec::new();
        let mut cursor = inner.tail;
        loop {
            if cursor == *from {
                break;
            }
            match inner.parent_of(&cursor) {
                Some(parent) => {
                    path.push(cursor);
                    cursor = parent;
                }
                None => return Err(ChainError::NotCanonical),
            }
        }

        path.reverse();
        Ok(path
            .into_iter()
            .take(n)
            .filter_map(|hash| inner.block(&hash))
            .collect())
    }

    /// Enumerates the leaves of the tree: every sealed block without a
    /// child, the canonical tail included when it is one.
    pub fn detached_tail_blocks(&self) -> Vec<Arc<Block>> {
        let inner = self.inner.read().unwrap();
        inner
            .nodes
            .values()
            .filter(|node| node.children.is_empty())
            .map(|node| node.block.clone())
            .collect()
    }

    /// Renders the last `count` canonical blocks, newest first.
    pub fn dump(&self, count: usize) -> String {
        let inner = self.inner.read().unwrap();

        let mut rendered = Vec::new();
        let mut cursor = Some(inner.tail);
        while let Some(hash) = cursor {
            if rendered.len() >= count {
                break;
            }
            match inner.block(&hash) {
                Some(block) => {
                    rendered.push(block.to_string());
                    cursor = inner.parent_of(&hash);
                }
                None => break,
            }
        }

        format!("[{}]", rendered.join(","))
    }

    /// Observes the gas price of the canonical tail: the minimum price among
    /// its transactions, or the default when the block carries none.
    pub fn gas_price(&self) -> Uint128 {
        self.tail_block()
            .transactions()
            .iter()
            .map(|tx| tx.gas_price())
            .min()
            .unwrap_or(TRANSACTION_GAS_PRICE)
    }

    /// Estimates the gas a transaction would consume on top of the tail.
    pub fn estimate_gas(&self, tx: &Transaction) -> Result<Uint128, TransactionError> {
        let tail = self.tail_block();
        let result = tx.simulate_execution(&tail.context(), tail.state(), self.engine.as_ref())?;
        if let Some(error) = &result.execution_error {
            warn!(tx = %tx.hash(), error = %error, "simulated execution reported an error");
        }
        Ok(result.gas_used)
    }
}
