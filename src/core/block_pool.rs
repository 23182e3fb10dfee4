//! Staging area for blocks arriving from the network.
//!
//! The pool rejects duplicates by block hash, verifies integrity before any
//! tree mutation, parks blocks whose parent has not arrived yet in a bounded
//! orphan cache, and replays orphan descendants transitively once their
//! ancestor attaches. After every successful attachment the fork-choice
//! policy decides whether the canonical tail moves.

use crate::core::block::{Block, BlockError};
use crate::core::blockchain::{BlockChain, ChainError};
use crate::types::hash::Hash;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Recently seen block fingerprints kept for duplicate rejection.
const SEEN_CACHE_SIZE: usize = 4096;
/// Bound on parked orphan entries, keyed by the missing parent hash.
const ORPHAN_CACHE_SIZE: usize = 128;

/// Errors produced by pool admission.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("duplicated block")]
    DuplicatedBlock,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Policy selecting which leaf becomes the canonical tail.
///
/// Invoked by the pool after each attachment, outside the chain lock, so an
/// implementation may freely call back into the chain.
pub trait ForkChoice: Send + Sync {
    fn on_block_attached(&self, chain: &BlockChain, block: &Arc<Block>);
}

/// Leaves the tail where it is; the node operator (or the consensus
/// producer) moves it explicitly.
pub struct NoActionForkChoice;

impl ForkChoice for NoActionForkChoice {
    fn on_block_attached(&self, _chain: &BlockChain, _block: &Arc<Block>) {}
}

/// Advances the tail to any strictly higher attached block.
pub struct LongestChain;

impl ForkChoice for LongestChain {
    fn on_block_attached(&self, chain: &BlockChain, block: &Arc<Block>) {
        if block.height() > chain.tail_block().height() {
            if let Err(e) = chain.set_tail_block(&block.hash()) {
                warn!(hash = %block.hash(), error = %e, "fork choice could not move the tail");
            }
        }
    }
}

/// Admission queue between the network and the block tree.
pub struct BlockPool {
    seen: Mutex<LruCache<Hash, ()>>,
    orphans: Mutex<LruCache<Hash, Vec<Block>>>,
    fork_choice: Box<dyn ForkChoice>,
}

impl BlockPool {
    pub(crate) fn new(fork_choice: Box<dyn ForkChoice>) -> Self {
        BlockPool {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            orphans: Mutex::new(LruCache::new(
                NonZeroUsize::new(ORPHAN_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            fork_choice,
        }
    }

    /// Admits one network block.
    ///
    /// Duplicates fail; verified blocks either attach (replaying any parked
    /// descendants) or wait in the orphan cache for their parent.
    pub(crate) fn push(&self, chain: &BlockChain, block: Block) -> Result<(), PoolError> {
        let hash = block.hash();

        {
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&hash) || chain.has_block(&hash) {
                return Err(PoolError::DuplicatedBlock);
            }
            seen.put(hash, ());
        }

        block.verify_integrity(chain.chain_id())?;

        let parent_hash = block.parent_hash();
        if !chain.has_block(&parent_hash) {
            // Parked until the parent arrives; fetching the parent from
            // peers is the sync layer's job.
            debug!(hash = %hash, parent = %parent_hash, "parking orphan block");
            {
                let mut orphans = self.orphans.lock().unwrap();
                let mut children = orphans.pop(&parent_hash).unwrap_or_default();
                children.push(block);
                orphans.put(parent_hash, children);
            }
            // The parent may have attached while parking.
            if chain.has_block(&parent_hash) {
                self.replay_orphans(chain, parent_hash);
            }
            return Ok(());
        }

        let attached = chain.attach_block(block)?;
        self.fork_choice.on_block_attached(chain, &attached);
        self.replay_orphans(chain, hash);
        Ok(())
    }

    /// Attaches every parked descendant of `parent`, transitively.
    fn replay_orphans(&self, chain: &BlockChain, parent: Hash) {
        let mut queue = vec![parent];

        while let Some(hash) = queue.pop() {
            let children = { self.orphans.lock().unwrap().pop(&hash) };
            let Some(children) = children else { continue };

            for child in children {
                let child_hash = child.hash();
                match chain.attach_block(child) {
                    Ok(attached) => {
                        self.fork_choice.on_block_attached(chain, &attached);
                        queue.push(child_hash);
                    }
                    Err(e) => {
                        warn!(hash = %child_hash, error = %e, "dropping parked block");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        build_child, from_network, new_chain, new_chain_with_fork_choice, TEST_INTERVAL,
    };
    use crate::types::hash::Hash;

    #[test]
    fn push_attaches_block_with_known_parent() {
        let chain = new_chain();
        let block = build_child(&chain.genesis_block(), TEST_INTERVAL);

        chain.push_block(from_network(&block)).unwrap();
        assert!(chain.has_block(&block.hash()));
    }

    #[test]
    fn push_rejects_duplicates() {
        let chain = new_chain();
        let block = build_child(&chain.genesis_block(), TEST_INTERVAL);

        chain.push_block(from_network(&block)).unwrap();
        assert!(matches!(
            chain.push_block(from_network(&block)),
            Err(PoolError::DuplicatedBlock)
        ));
    }

    #[test]
    fn push_rejects_tampered_blocks() {
        let chain = new_chain();
        let block = build_child(&chain.genesis_block(), TEST_INTERVAL);

        let mut msg = block.to_proto();
        if let Some(header) = msg.header.as_mut() {
            header.timestamp += 1;
        }
        let tampered = Block::from_proto(&msg).unwrap();

        assert!(matches!(
            chain.push_block(tampered),
            Err(PoolError::Block(BlockError::InvalidHash))
        ));
    }

    #[test]
    fn push_rejects_misaligned_timestamps() {
        let chain = new_chain();
        let block = build_child(&chain.genesis_block(), TEST_INTERVAL + 1);

        assert!(matches!(
            chain.push_block(from_network(&block)),
            Err(PoolError::Chain(ChainError::InvalidTimestamp))
        ));
    }

    #[test]
    fn orphans_attach_when_parent_arrives() {
        let chain = new_chain();
        let genesis = chain.genesis_block();

        let parent = build_child(&genesis, TEST_INTERVAL);
        let child = build_child(&parent, TEST_INTERVAL * 2);
        let grandchild = build_child(&child, TEST_INTERVAL * 3);

        // Deepest first: everything parks.
        chain.push_block(from_network(&grandchild)).unwrap();
        chain.push_block(from_network(&child)).unwrap();
        assert!(!chain.has_block(&child.hash()));
        assert!(!chain.has_block(&grandchild.hash()));

        // The missing ancestor pulls the whole parked line in.
        chain.push_block(from_network(&parent)).unwrap();
        assert!(chain.has_block(&parent.hash()));
        assert!(chain.has_block(&child.hash()));
        assert!(chain.has_block(&grandchild.hash()));
    }

    #[test]
    fn longest_chain_fork_choice_moves_the_tail() {
        let chain = new_chain_with_fork_choice(Box::new(LongestChain));
        let genesis = chain.genesis_block();

        let b1 = build_child(&genesis, TEST_INTERVAL);
        chain.push_block(from_network(&b1)).unwrap();
        assert_eq!(chain.tail_block().hash(), b1.hash());

        let b2 = build_child(&b1, TEST_INTERVAL * 2);
        chain.push_block(from_network(&b2)).unwrap();
        assert_eq!(chain.tail_block().hash(), b2.hash());

        // A shorter fork does not displace the tail.
        let fork = build_child(&genesis, TEST_INTERVAL * 4);
        chain.push_block(from_network(&fork)).unwrap();
        assert_eq!(chain.tail_block().hash(), b2.hash());
    }

    #[test]
    fn parked_blocks_survive_even_with_unknown_lineage() {
        let chain = new_chain();
        let genesis = chain.genesis_block();

        // Build a block whose parent the chain will never see.
        let orphan_parent = build_child(&genesis, TEST_INTERVAL);
        let orphan = build_child(&orphan_parent, TEST_INTERVAL * 2);

        chain.push_block(from_network(&orphan)).unwrap();
        assert!(!chain.has_block(&orphan.hash()));

        // Pushing an unrelated hash replays nothing and panics nowhere.
        let unrelated = Hash::sha3().chain(b"unrelated").finalize();
        assert!(!chain.has_block(&unrelated));
    }
}

