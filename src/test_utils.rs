//! Shared test constructors.

use crate::core::address::Address;
use crate::core::block::Block;
use crate::core::block_pool::ForkChoice;
use crate::core::blockchain::{BlockChain, ChainConfig};
use crate::core::payload::{NoopEngine, TX_PAYLOAD_BINARY_TYPE};
use crate::core::transaction::{Transaction, TRANSACTION_GAS_PRICE};
use crate::crypto::PrivateKey;
use crate::state::{Account, StateDB};
use crate::types::uint128::Uint128;
use std::sync::Arc;

pub const TEST_CHAIN_ID: u32 = 100;
pub const TEST_INTERVAL: i64 = 5;

const TEST_GAS_LIMIT: u128 = 200_000;

/// A fresh user address backed by a throwaway key.
pub fn mock_address() -> Address {
    PrivateKey::new().public_key().address()
}

fn new_tx(
    key: &PrivateKey,
    to: Address,
    nonce: u64,
    value: Uint128,
    data: &[u8],
) -> Transaction {
    let mut tx = Transaction::new(
        TEST_CHAIN_ID,
        key.public_key().address(),
        to,
        value,
        nonce,
        TX_PAYLOAD_BINARY_TYPE,
        data.to_vec(),
        TRANSACTION_GAS_PRICE,
        Uint128::new(TEST_GAS_LIMIT),
    )
    .expect("valid test transaction");
    tx.sign(key).expect("signing failed");
    tx
}

/// A signed binary transaction carrying the given payload bytes.
pub fn new_binary_tx(key: &PrivateKey, to: Address, nonce: u64, data: &[u8]) -> Transaction {
    new_tx(key, to, nonce, Uint128::zero(), data)
}

/// A signed binary value transfer with an empty payload.
pub fn new_binary_tx_with_value(
    key: &PrivateKey,
    to: Address,
    nonce: u64,
    value: Uint128,
) -> Transaction {
    new_tx(key, to, nonce, value, b"")
}

/// A genesis block whose state funds the key's address.
pub fn funded_genesis(key: &PrivateKey, balance: u128) -> (Block, Address) {
    let addr = key.public_key().address();
    let mut state = StateDB::new();
    state.set_account(addr, Account::new(Uint128::new(balance)));
    (Block::genesis(TEST_CHAIN_ID, state), addr)
}

/// A chain over an empty genesis state with manual fork choice.
pub fn new_chain() -> BlockChain {
    BlockChain::new(
        ChainConfig::new(TEST_CHAIN_ID, TEST_INTERVAL),
        StateDB::new(),
        Arc::new(NoopEngine),
    )
}

/// A chain whose genesis state funds the key's address.
pub fn new_chain_with_funds(key: &PrivateKey, balance: u128) -> BlockChain {
    let mut state = StateDB::new();
    state.set_account(
        key.public_key().address(),
        Account::new(Uint128::new(balance)),
    );
    BlockChain::new(
        ChainConfig::new(TEST_CHAIN_ID, TEST_INTERVAL),
        state,
        Arc::new(NoopEngine),
    )
}

/// A chain with the given fork-choice policy.
pub fn new_chain_with_fork_choice(fork_choice: Box<dyn ForkChoice>) -> BlockChain {
    BlockChain::with_fork_choice(
        ChainConfig::new(TEST_CHAIN_ID, TEST_INTERVAL),
        StateDB::new(),
        Arc::new(NoopEngine),
        fork_choice,
    )
}

/// Builds a sealed, signed, empty child of `parent` at the given timestamp.
///
/// Each call uses a fresh producer key whose address is the coinbase.
pub fn build_child(parent: &Block, timestamp: i64) -> Block {
    let key = PrivateKey::new();
    let mut block = Block::new(parent, key.public_key().address(), timestamp);
    block.seal().expect("seal failed");
    block.sign(&key).expect("signing failed");
    block
}

/// Simulates network transfer: serializes and reparses the block, losing
/// its in-memory state.
pub fn from_network(block: &Block) -> Block {
    Block::from_bytes(&block.to_bytes()).expect("roundtrip failed")
}

/// Pushes a network copy of `block` into the chain.
pub fn push_from_network(chain: &BlockChain, block: &Block) {
    chain
        .push_block(from_network(block))
        .expect("push from network failed");
}
