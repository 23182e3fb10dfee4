//! Blocks: ordered transaction containers with parent linkage.
//!
//! Blocks exist in two phases. An unsealed block owns a mutable body and a
//! working world state inherited from its parent; sealing fixes the
//! transaction, state and event roots together with the header hash, after
//! which the block never changes.

use crate::core::address::Address;
use crate::core::payload::ContractEngine;
use crate::core::pb;
use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::{recover_signer, Algorithm, CryptoError, PrivateKey};
use crate::state::{StateDB, StateError, WorldState};
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use prost::Message;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Errors produced by the block lifecycle.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block is not sealed")]
    NotSealed,

    #[error("block is already sealed")]
    AlreadySealed,

    #[error("invalid block chainID")]
    InvalidChainId,

    #[error("invalid block hash")]
    InvalidHash,

    #[error("invalid block signer")]
    InvalidSigner,

    #[error("invalid proto block")]
    InvalidProto,

    #[error("block state root mismatch")]
    StateRootMismatch,

    #[error("block txs root mismatch")]
    TxsRootMismatch,

    #[error("block events root mismatch")]
    EventsRootMismatch,

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Block header: parent linkage, coinbase and cryptographic commitments.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub hash: Hash,
    pub parent_hash: Hash,
    pub coinbase: Address,
    pub timestamp: i64,
    pub chain_id: u32,
    pub state_root: Hash,
    pub txs_root: Hash,
    pub events_root: Hash,
    pub alg: u32,
    pub sign: Vec<u8>,
}

/// Block-level facts visible to transaction execution and the contract
/// engine.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub coinbase: Address,
    pub height: u64,
    pub timestamp: i64,
    pub chain_id: u32,
}

/// A block in the chain, carrying its post-execution world state.
#[derive(Debug, Clone)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
    height: u64,
    state: StateDB,
    sealed: bool,
}

impl Block {
    /// Creates an unsealed block parented on `parent`.
    ///
    /// The block starts from a copy of the parent's post-execution state and
    /// an empty body; the caller picks the timestamp before sealing.
    pub fn new(parent: &Block, coinbase: Address, timestamp: i64) -> Block {
        Block {
            header: BlockHeader {
                hash: Hash::zero(),
                parent_hash: parent.hash(),
                coinbase,
                timestamp,
                chain_id: parent.chain_id(),
                state_root: Hash::zero(),
                txs_root: Hash::zero(),
                events_root: Hash::zero(),
                alg: 0,
                sign: Vec::new(),
            },
            transactions: Vec::new(),
            height: parent.height + 1,
            state: parent.state.clone(),
            sealed: false,
        }
    }

    /// Creates the sealed genesis block for a chain.
    ///
    /// The genesis parent hash is all zeros, its timestamp is zero and it
    /// carries no signature; `state` holds the initial allocations.
    pub fn genesis(chain_id: u32, state: StateDB) -> Block {
        let mut block = Block {
            header: BlockHeader {
                hash: Hash::zero(),
                parent_hash: Hash::zero(),
                coinbase: Address::zero_user(),
                timestamp: 0,
                chain_id,
                state_root: state.root(),
                txs_root: Hash::zero(),
                events_root: Hash::zero(),
                alg: 0,
                sign: Vec::new(),
            },
            transactions: Vec::new(),
            height: 0,
            state,
            sealed: true,
        };
        block.header.hash = block.cal_hash();
        block
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn coinbase(&self) -> Address {
        self.header.coinbase
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn chain_id(&self) -> u32 {
        self.header.chain_id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub(crate) fn set_height(&mut self, height: u64) {
        self.height = height;
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn state(&self) -> &StateDB {
        &self.state
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns true for the genesis block (zero parent hash).
    pub fn is_genesis(&self) -> bool {
        self.header.parent_hash.is_zero() && self.height == 0
    }

    /// Returns the block facts handed to transaction execution.
    pub fn context(&self) -> BlockContext {
        BlockContext {
            coinbase: self.header.coinbase,
            height: self.height,
            timestamp: self.header.timestamp,
            chain_id: self.header.chain_id,
        }
    }

    /// Adjusts the timestamp of an unsealed block.
    pub fn set_timestamp(&mut self, timestamp: i64) -> Result<(), BlockError> {
        if self.sealed {
            return Err(BlockError::AlreadySealed);
        }
        self.header.timestamp = timestamp;
        Ok(())
    }

    /// Admits, executes and appends a transaction to this unsealed block.
    ///
    /// The transaction runs under its own world-state checkpoint: a rejected
    /// transaction leaves no trace, an accepted one (including on-chain
    /// failures) is committed and appended to the body.
    pub fn execute_transaction(
        &mut self,
        tx: &Transaction,
        engine: &dyn ContractEngine,
    ) -> Result<(), BlockError> {
        if self.sealed {
            return Err(BlockError::AlreadySealed);
        }

        let ctx = self.context();
        self.state.checkpoint();

        let outcome = tx
            .check_transaction(&mut self.state)
            .and_then(|_| tx.verify_execution(&ctx, &mut self.state, engine))
            .and_then(|_| tx.accept_transaction(&mut self.state));

        match outcome {
            Ok(()) => {
                self.state.commit();
                self.transactions.push(tx.clone());
                Ok(())
            }
            Err(e) => {
                self.state.reset()?;
                self.state.commit();
                debug!(tx = %tx.hash(), error = %e, giveback = e.gives_back(), "transaction rejected");
                Err(e.into())
            }
        }
    }

    /// Seals the block: fixes the transaction, event and state roots and
    /// computes the header hash. The block is immutable afterwards.
    pub fn seal(&mut self) -> Result<(), BlockError> {
        if self.sealed {
            return Err(BlockError::AlreadySealed);
        }

        self.header.txs_root = Self::txs_root(&self.transactions);
        self.header.events_root = Self::events_root(&self.state, &self.transactions)?;
        self.header.state_root = self.state.root();
        self.header.hash = self.cal_hash();
        self.sealed = true;
        Ok(())
    }

    /// Signs the sealed block hash with the producer's key.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), BlockError> {
        if !self.sealed {
            return Err(BlockError::NotSealed);
        }
        self.header.sign = key.sign_hash(&self.header.hash)?;
        self.header.alg = Algorithm::Secp256k1 as u32;
        Ok(())
    }

    /// Computes the header hash over every field except `hash` and `sign`.
    pub fn cal_hash(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(self.header.parent_hash.as_slice());
        h.update(self.header.coinbase.as_slice());
        h.update(&self.header.timestamp.to_be_bytes());
        h.update(&self.header.chain_id.to_be_bytes());
        h.update(self.header.state_root.as_slice());
        h.update(self.header.txs_root.as_slice());
        h.update(self.header.events_root.as_slice());
        h.finalize()
    }

    /// Verifies hash integrity, the producer signature and every contained
    /// transaction. Genesis carries no signature and skips recovery.
    pub fn verify_integrity(&self, chain_id: u32) -> Result<(), BlockError> {
        if self.header.chain_id != chain_id {
            return Err(BlockError::InvalidChainId);
        }

        if self.cal_hash() != self.header.hash {
            return Err(BlockError::InvalidHash);
        }

        if !self.is_genesis() {
            let signer = recover_signer(self.header.alg, &self.header.hash, &self.header.sign)?;
            if signer != self.header.coinbase {
                return Err(BlockError::InvalidSigner);
            }
        }

        for tx in &self.transactions {
            tx.verify_integrity(chain_id)?;
        }

        Ok(())
    }

    /// Replays the body against the parent's state and requires the header
    /// roots to reproduce exactly. On success the block adopts the replayed
    /// state as its own.
    pub fn verify_execution(
        &mut self,
        parent_state: &StateDB,
        engine: &dyn ContractEngine,
    ) -> Result<(), BlockError> {
        let ctx = self.context();
        let mut state = parent_state.clone();

        for tx in &self.transactions {
            state.checkpoint();
            let outcome = tx
                .check_transaction(&mut state)
                .and_then(|_| tx.verify_execution(&ctx, &mut state, engine))
                .and_then(|_| tx.accept_transaction(&mut state));
            match outcome {
                Ok(()) => state.commit(),
                Err(e) => {
                    state.reset()?;
                    state.commit();
                    return Err(e.into());
                }
            }
        }

        if Self::txs_root(&self.transactions) != self.header.txs_root {
            return Err(BlockError::TxsRootMismatch);
        }
        if Self::events_root(&state, &self.transactions)? != self.header.events_root {
            return Err(BlockError::EventsRootMismatch);
        }
        if state.root() != self.header.state_root {
            return Err(BlockError::StateRootMismatch);
        }

        self.state = state;
        Ok(())
    }

    fn txs_root(transactions: &[Transaction]) -> Hash {
        MerkleTree::from_raw(transactions.iter().map(|tx| tx.hash()).collect())
    }

    fn events_root(state: &StateDB, transactions: &[Transaction]) -> Result<Hash, BlockError> {
        let mut leaves = Vec::new();
        for tx in transactions {
            for event in state.fetch_events(&tx.hash())? {
                let mut h = Hash::sha3();
                h.update(event.topic.as_bytes());
                h.update(event.data.as_bytes());
                leaves.push(h.finalize());
            }
        }
        Ok(MerkleTree::from_raw(leaves))
    }

    /// Converts to the wire representation.
    pub fn to_proto(&self) -> pb::Block {
        pb::Block {
            header: Some(pb::BlockHeader {
                hash: self.header.hash.to_vec(),
                parent_hash: self.header.parent_hash.to_vec(),
                coinbase: self.header.coinbase.to_vec(),
                timestamp: self.header.timestamp,
                chain_id: self.header.chain_id,
                state_root: self.header.state_root.to_vec(),
                txs_root: self.header.txs_root.to_vec(),
                events_root: self.header.events_root.to_vec(),
                alg: self.header.alg,
                sign: self.header.sign.clone(),
            }),
            body: self.transactions.iter().map(|tx| tx.to_proto()).collect(),
        }
    }

    /// Builds a sealed block from its wire representation.
    ///
    /// The block arrives without a world state; attaching it to the tree
    /// replays the body to reconstruct one.
    pub fn from_proto(msg: &pb::Block) -> Result<Block, BlockError> {
        let header = msg.header.as_ref().ok_or(BlockError::InvalidProto)?;

        let mut transactions = Vec::with_capacity(msg.body.len());
        for tx in &msg.body {
            transactions.push(Transaction::from_proto(tx)?);
        }

        Ok(Block {
            header: BlockHeader {
                hash: Hash::from_slice(&header.hash).ok_or(BlockError::InvalidProto)?,
                parent_hash: Hash::from_slice(&header.parent_hash)
                    .ok_or(BlockError::InvalidProto)?,
                coinbase: Address::parse_from_bytes(&header.coinbase)
                    .map_err(TransactionError::Address)?,
                timestamp: header.timestamp,
                chain_id: header.chain_id,
                state_root: Hash::from_slice(&header.state_root)
                    .ok_or(BlockError::InvalidProto)?,
                txs_root: Hash::from_slice(&header.txs_root).ok_or(BlockError::InvalidProto)?,
                events_root: Hash::from_slice(&header.events_root)
                    .ok_or(BlockError::InvalidProto)?,
                alg: header.alg,
                sign: header.sign.clone(),
            },
            transactions,
            height: 0,
            state: StateDB::new(),
            sealed: true,
        })
    }

    /// Serializes the block for network transfer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    /// Deserializes a block received from the network.
    pub fn from_bytes(bytes: &[u8]) -> Result<Block, BlockError> {
        let msg = pb::Block::decode(bytes).map_err(|_| BlockError::InvalidProto)?;
        Block::from_proto(&msg)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"height":{}, "hash":"{}", "parent":"{}", "timestamp":{}, "tx":{}}}"#,
            self.height,
            self.header.hash,
            self.header.parent_hash,
            self.header.timestamp,
            self.transactions.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload::NoopEngine;
    use crate::core::transaction::TRANSACTION_GAS_PRICE;
    use crate::test_utils::{
        funded_genesis, mock_address, new_binary_tx_with_value, TEST_CHAIN_ID,
    };
    use crate::types::uint128::Uint128;

    #[test]
    fn genesis_is_sealed_with_zero_parent() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());

        assert!(genesis.is_sealed());
        assert!(genesis.is_genesis());
        assert!(genesis.parent_hash().is_zero());
        assert!(!genesis.hash().is_zero());
        assert!(genesis.verify_integrity(TEST_CHAIN_ID).is_ok());
    }

    #[test]
    fn new_block_is_unsealed_and_parented_on_tail() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        let block = Block::new(&genesis, mock_address(), 5);

        assert!(!block.is_sealed());
        assert_eq!(block.parent_hash(), genesis.hash());
        assert_eq!(block.height(), 1);
        assert!(block.hash().is_zero());
    }

    #[test]
    fn seal_fixes_hash_and_roots() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        let mut block = Block::new(&genesis, mock_address(), 5);

        block.seal().unwrap();

        assert!(block.is_sealed());
        assert_eq!(block.hash(), block.cal_hash());
        assert!(matches!(block.seal(), Err(BlockError::AlreadySealed)));
    }

    #[test]
    fn sealed_hash_is_deterministic() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        let coinbase = mock_address();

        let mut a = Block::new(&genesis, coinbase, 5);
        let mut b = Block::new(&genesis, coinbase, 5);
        a.seal().unwrap();
        b.seal().unwrap();

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn timestamp_changes_the_sealed_hash() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        let coinbase = mock_address();

        let mut a = Block::new(&genesis, coinbase, 5);
        let mut b = Block::new(&genesis, coinbase, 10);
        a.seal().unwrap();
        b.seal().unwrap();

        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn set_timestamp_requires_unsealed_block() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        let mut block = Block::new(&genesis, mock_address(), 5);

        block.set_timestamp(10).unwrap();
        block.seal().unwrap();
        assert!(matches!(
            block.set_timestamp(15),
            Err(BlockError::AlreadySealed)
        ));
    }

    #[test]
    fn sign_requires_sealed_block() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        let mut block = Block::new(&genesis, mock_address(), 5);

        assert!(matches!(
            block.sign(&PrivateKey::new()),
            Err(BlockError::NotSealed)
        ));
    }

    #[test]
    fn signed_block_passes_integrity() {
        let key = PrivateKey::new();
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());

        let mut block = Block::new(&genesis, key.public_key().address(), 5);
        block.seal().unwrap();
        block.sign(&key).unwrap();

        assert!(block.verify_integrity(TEST_CHAIN_ID).is_ok());
    }

    #[test]
    fn integrity_rejects_foreign_producer() {
        let key = PrivateKey::new();
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());

        // Signed by a key that does not own the coinbase address.
        let mut block = Block::new(&genesis, mock_address(), 5);
        block.seal().unwrap();
        block.sign(&key).unwrap();

        assert!(matches!(
            block.verify_integrity(TEST_CHAIN_ID),
            Err(BlockError::InvalidSigner)
        ));
    }

    #[test]
    fn integrity_rejects_tampered_header() {
        let key = PrivateKey::new();
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());

        let mut block = Block::new(&genesis, key.public_key().address(), 5);
        block.seal().unwrap();
        block.sign(&key).unwrap();
        block.header.timestamp = 99;

        assert!(matches!(
            block.verify_integrity(TEST_CHAIN_ID),
            Err(BlockError::InvalidHash)
        ));
    }

    #[test]
    fn integrity_rejects_wrong_chain() {
        let genesis = Block::genesis(TEST_CHAIN_ID, StateDB::new());
        assert!(matches!(
            genesis.verify_integrity(TEST_CHAIN_ID + 1),
            Err(BlockError::InvalidChainId)
        ));
    }

    #[test]
    fn execute_transaction_appends_to_body() {
        let key = PrivateKey::new();
        let (genesis, _) = funded_genesis(&key, 100_000_000_000_000);

        let mut block = Block::new(&genesis, mock_address(), 5);
        let tx = new_binary_tx_with_value(&key, mock_address(), 1, Uint128::new(10));

        block.execute_transaction(&tx, &NoopEngine).unwrap();
        assert_eq!(block.transactions().len(), 1);
    }

    #[test]
    fn execute_transaction_rejects_nonce_gap_without_trace() {
        let key = PrivateKey::new();
        let (genesis, from) = funded_genesis(&key, 100_000_000_000_000);

        let mut block = Block::new(&genesis, mock_address(), 5);
        let tx = new_binary_tx_with_value(&key, mock_address(), 7, Uint128::new(10));

        let err = block.execute_transaction(&tx, &NoopEngine).unwrap_err();
        match err {
            BlockError::Transaction(e) => assert!(e.gives_back()),
            other => panic!("unexpected error: {other}"),
        }

        assert!(block.transactions().is_empty());
        let mut state = block.state().clone();
        let account = state.get_or_create_user_account(&from).unwrap();
        assert_eq!(account.nonce(), 0);
    }

    #[test]
    fn proto_roundtrip_preserves_hash_and_integrity() {
        let key = PrivateKey::new();
        let (genesis, _) = funded_genesis(&key, 100_000_000_000_000);

        let mut block = Block::new(&genesis, key.public_key().address(), 5);
        let tx = new_binary_tx_with_value(&key, mock_address(), 1, Uint128::new(10));
        block.execute_transaction(&tx, &NoopEngine).unwrap();
        block.seal().unwrap();
        block.sign(&key).unwrap();

        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();

        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded.header(), block.header());
        assert_eq!(decoded.transactions().len(), 1);
        assert!(decoded.verify_integrity(TEST_CHAIN_ID).is_ok());
    }

    #[test]
    fn replaying_a_network_block_reproduces_roots() {
        let key = PrivateKey::new();
        let (genesis, _) = funded_genesis(&key, 100_000_000_000_000);

        let mut block = Block::new(&genesis, key.public_key().address(), 5);
        let tx = new_binary_tx_with_value(&key, mock_address(), 1, Uint128::new(10));
        block.execute_transaction(&tx, &NoopEngine).unwrap();
        block.seal().unwrap();
        block.sign(&key).unwrap();

        let mut from_network = Block::from_bytes(&block.to_bytes()).unwrap();
        from_network.set_height(1);

        from_network
            .verify_execution(genesis.state(), &NoopEngine)
            .unwrap();
        assert_eq!(from_network.state().root(), block.state().root());
    }

    #[test]
    fn replay_detects_state_root_mismatch() {
        let key = PrivateKey::new();
        let (genesis, _) = funded_genesis(&key, 100_000_000_000_000);

        let mut block = Block::new(&genesis, key.public_key().address(), 5);
        let tx = new_binary_tx_with_value(&key, mock_address(), 1, Uint128::new(10));
        block.execute_transaction(&tx, &NoopEngine).unwrap();
        block.seal().unwrap();

        let mut from_network = Block::from_bytes(&block.to_bytes()).unwrap();
        from_network.set_height(1);
        from_network.header.state_root = Hash::sha3().chain(b"bogus").finalize();

        assert!(matches!(
            from_network.verify_execution(genesis.state(), &NoopEngine),
            Err(BlockError::StateRootMismatch)
        ));
    }

    #[test]
    fn execute_transaction_charges_fees_into_block_state() {
        let key = PrivateKey::new();
        let (genesis, from) = funded_genesis(&key, 100_000_000_000_000);

        let mut block = Block::new(&genesis, key.public_key().address(), 5);
        let tx = new_binary_tx_with_value(&key, mock_address(), 1, Uint128::zero());
        block.execute_transaction(&tx, &NoopEngine).unwrap();

        let fee = TRANSACTION_GAS_PRICE
            .mul(tx.gas_count_of_tx_base().unwrap())
            .unwrap();
        let mut state = block.state().clone();
        let account = state.get_or_create_user_account(&from).unwrap();
        assert_eq!(
            account.balance(),
            Uint128::new(100_000_000_000_000 - fee.value())
        );
    }
}
