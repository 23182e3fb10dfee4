//! World-state adapter: accounts, stored transactions, events and gas records.
//!
//! The execution pipeline mutates state exclusively through the [`WorldState`]
//! trait. [`StateDB`] is the in-memory implementation; the persistent storage
//! engine behind a production node is an external collaborator and plugs in
//! behind the same trait.

use crate::core::address::Address;
use crate::types::hash::Hash;
use crate::types::uint128::{ArithmeticError, Uint128};
use std::collections::HashMap;
use thiserror::Error;

/// Event topic for transaction execution results.
pub const TOPIC_TRANSACTION_EXECUTION_RESULT: &str = "chain.transactionResult";

/// Errors produced by world-state operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("account not found: {0}")]
    AccountNotFound(Address),

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("no checkpoint to reset to")]
    NoCheckpoint,

    #[error(transparent)]
    Arithmetic(#[from] ArithmeticError),

    /// Transient backing-store failure; callers may retry the operation.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StateError {
    /// Returns true for transient I/O failures where retrying is meaningful.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Storage(_))
    }
}

/// An entry in the on-chain event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    pub data: String,
}

/// Account state: spendable balance, replay-protection nonce and, for
/// contracts, the hash of the deploying transaction (its birth place).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Account {
    balance: Uint128,
    nonce: u64,
    birth_place: Option<Hash>,
}

impl Account {
    /// Creates a user account with the given balance.
    pub fn new(balance: Uint128) -> Self {
        Self {
            balance,
            nonce: 0,
            birth_place: None,
        }
    }

    /// Returns the account's current balance.
    pub fn balance(&self) -> Uint128 {
        self.balance
    }

    /// Returns the account's current nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Returns the hash of the deploying transaction for contract accounts.
    pub fn birth_place(&self) -> Option<Hash> {
        self.birth_place
    }

    /// Returns true if this account was created by a contract deployment.
    pub fn is_contract(&self) -> bool {
        self.birth_place.is_some()
    }
}

/// Mutable view of the ledger state used by transaction execution.
///
/// Accounts fetched through this trait are value copies; all mutations go
/// through the trait so the checkpoint stack observes every write.
pub trait WorldState {
    /// Loads the account at `addr`, creating an empty user account if absent.
    fn get_or_create_user_account(&mut self, addr: &Address) -> Result<Account, StateError>;

    /// Loads a contract account; fails if the address is unknown.
    fn get_contract_account(&self, addr: &Address) -> Result<Account, StateError>;

    /// Creates a contract account recording the deploying transaction hash.
    fn create_contract_account(
        &mut self,
        addr: &Address,
        birth_place: Hash,
    ) -> Result<Account, StateError>;

    /// Credits `value` to `addr`, creating the account if absent.
    fn add_balance(&mut self, addr: &Address, value: Uint128) -> Result<(), StateError>;

    /// Debits `value` from `addr`; fails with `Underflow` when insufficient.
    fn sub_balance(&mut self, addr: &Address, value: Uint128) -> Result<(), StateError>;

    /// Increments the account nonce.
    fn incr_nonce(&mut self, addr: &Address) -> Result<(), StateError>;

    /// Persists a serialized transaction under its hash.
    fn put_tx(&mut self, hash: Hash, bytes: Vec<u8>) -> Result<(), StateError>;

    /// Loads a serialized transaction by hash.
    fn get_tx(&self, hash: &Hash) -> Result<Vec<u8>, StateError>;

    /// Debits the gas fee from `from` and records it against the sender.
    ///
    /// The debit happens outside checkpoint rollback semantics in the
    /// pipeline: gas recorded after a reset stays charged.
    fn record_gas(&mut self, from: &Address, gas_cost: Uint128) -> Result<(), StateError>;

    /// Appends an event to the log of the given transaction.
    fn record_event(&mut self, tx_hash: Hash, event: Event) -> Result<(), StateError>;

    /// Returns the events recorded for a transaction, oldest first.
    fn fetch_events(&self, tx_hash: &Hash) -> Result<Vec<Event>, StateError>;

    /// Captures a savepoint of the current state.
    fn checkpoint(&mut self);

    /// Rolls uncommitted mutations back to the most recent savepoint.
    ///
    /// The savepoint survives the reset, so execution can roll back more
    /// than once within the same transaction.
    fn reset(&mut self) -> Result<(), StateError>;

    /// Discards the most recent savepoint, keeping its mutations.
    fn commit(&mut self);
}

#[derive(Debug, Clone)]
struct Snapshot {
    accounts: HashMap<Address, Account>,
    txs: HashMap<Hash, Vec<u8>>,
    events: HashMap<Hash, Vec<Event>>,
    gas_consumed: HashMap<Address, Uint128>,
}

/// In-memory world state with an explicit checkpoint stack.
#[derive(Debug, Clone, Default)]
pub struct StateDB {
    accounts: HashMap<Address, Account>,
    txs: HashMap<Hash, Vec<u8>>,
    events: HashMap<Hash, Vec<Event>>,
    gas_consumed: HashMap<Address, Uint128>,
    checkpoints: Vec<Snapshot>,
}

impl StateDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an account, for genesis allocations and tests.
    pub fn set_account(&mut self, addr: Address, account: Account) {
        self.accounts.insert(addr, account);
    }

    /// Returns the gas recorded against a sender, if any.
    pub fn gas_consumed(&self, addr: &Address) -> Option<Uint128> {
        self.gas_consumed.get(addr).copied()
    }

    /// Computes a deterministic digest of the account state.
    ///
    /// Accounts are folded in address order so the root is independent of
    /// insertion order.
    pub fn root(&self) -> Hash {
        let mut addresses: Vec<&Address> = self.accounts.keys().collect();
        addresses.sort();

        let mut h = Hash::sha3();
        h.update(b"STATE_ROOT");
        for addr in addresses {
            let account = &self.accounts[addr];
            h.update(addr.as_slice());
            h.update(&account.balance.to_fixed_bytes());
            h.update(&account.nonce.to_be_bytes());
            h.update(account.birth_place.unwrap_or(Hash::zero()).as_slice());
        }
        h.finalize()
    }

    fn account_mut(&mut self, addr: &Address) -> &mut Account {
        self.accounts.entry(*addr).or_default()
    }
}

impl WorldState for StateDB {
    fn get_or_create_user_account(&mut self, addr: &Address) -> Result<Account, StateError> {
        Ok(self.account_mut(addr).clone())
    }

    fn get_contract_account(&self, addr: &Address) -> Result<Account, StateError> {
        self.accounts
            .get(addr)
            .cloned()
            .ok_or(StateError::AccountNotFound(*addr))
    }

    fn create_contract_account(
        &mut self,
        addr: &Address,
        birth_place: Hash,
    ) -> Result<Account, StateError> {
        let account = self.account_mut(addr);
        account.birth_place = Some(birth_place);
        Ok(account.clone())
    }

    fn add_balance(&mut self, addr: &Address, value: Uint128) -> Result<(), StateError> {
        let account = self.account_mut(addr);
        account.balance = account.balance.add(value)?;
        Ok(())
    }

    fn sub_balance(&mut self, addr: &Address, value: Uint128) -> Result<(), StateError> {
        let account = self.account_mut(addr);
        account.balance = account.balance.sub(value)?;
        Ok(())
    }

    fn incr_nonce(&mut self, addr: &Address) -> Result<(), StateError> {
        let account = self.account_mut(addr);
        account.nonce += 1;
        Ok(())
    }

    fn put_tx(&mut self, hash: Hash, bytes: Vec<u8>) -> Result<(), StateError> {
        self.txs.insert(hash, bytes);
        Ok(())
    }

    fn get_tx(&self, hash: &Hash) -> Result<Vec<u8>, StateError> {
        self.txs
            .get(hash)
            .cloned()
            .ok_or(StateError::TransactionNotFound)
    }

    fn record_gas(&mut self, from: &Address, gas_cost: Uint128) -> Result<(), StateError> {
        self.sub_balance(from, gas_cost)?;
        let recorded = self.gas_consumed.entry(*from).or_insert(Uint128::zero());
        *recorded = recorded.add(gas_cost)?;
        Ok(())
    }

    fn record_event(&mut self, tx_hash: Hash, event: Event) -> Result<(), StateError> {
        self.events.entry(tx_hash).or_default().push(event);
        Ok(())
    }

    fn fetch_events(&self, tx_hash: &Hash) -> Result<Vec<Event>, StateError> {
        Ok(self.events.get(tx_hash).cloned().unwrap_or_default())
    }

    fn checkpoint(&mut self) {
        self.checkpoints.push(Snapshot {
            accounts: self.accounts.clone(),
            txs: self.txs.clone(),
            events: self.events.clone(),
            gas_consumed: self.gas_consumed.clone(),
        });
    }

    fn reset(&mut self) -> Result<(), StateError> {
        let snapshot = self.checkpoints.last().ok_or(StateError::NoCheckpoint)?;
        self.accounts = snapshot.accounts.clone();
        self.txs = snapshot.txs.clone();
        self.events = snapshot.events.clone();
        self.gas_consumed = snapshot.gas_consumed.clone();
        Ok(())
    }

    fn commit(&mut self) {
        self.checkpoints.pop();
    }
}
