//! Transactions: construction, canonical hashing, recoverable signing and
//! the deterministic execution pipeline with gas accounting.

use crate::core::address::{Address, AddressError};
use crate::core::block::BlockContext;
use crate::core::payload::{ContractEngine, PayloadError, TxPayload, TX_PAYLOAD_CALL_TYPE, TX_PAYLOAD_DEPLOY_TYPE};
use crate::core::pb;
use crate::crypto::{recover_signer, Algorithm, CryptoError, PrivateKey};
use crate::state::{Event, StateDB, StateError, WorldState, TOPIC_TRANSACTION_EXECUTION_RESULT};
use crate::types::hash::Hash;
use crate::types::uint128::{ArithmeticError, Uint128};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Expected byte length of a transaction hash.
pub const TX_HASH_BYTE_LENGTH: usize = 32;

/// Max gas price a transaction may offer: 50 * 10^9.
pub const TRANSACTION_MAX_GAS_PRICE: Uint128 = Uint128::new(50_000_000_000);

/// Max gas a transaction may consume: 50 * 10^9.
pub const TRANSACTION_MAX_GAS: Uint128 = Uint128::new(50_000_000_000);

/// Default gas price: 10^6.
pub const TRANSACTION_GAS_PRICE: Uint128 = Uint128::new(1_000_000);

/// Base gas for any transaction.
pub const MIN_GAS_COUNT_PER_TRANSACTION: Uint128 = Uint128::new(20_000);

/// Gas cost per byte of payload data.
pub const GAS_COUNT_PER_BYTE: Uint128 = Uint128::new(1);

/// Max payload data length in bytes (128 KiB).
pub const MAX_DATA_PAYLOAD_LENGTH: usize = 128 * 1024;

/// Result-event status for a successfully executed transaction.
pub const TX_EXECUTION_SUCCESS: i32 = 0;
/// Result-event status for a transaction accepted with failure.
pub const TX_EXECUTION_FAILED: i32 = 1;

/// Errors produced across the transaction lifecycle.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("invalid chainID")]
    InvalidChainId,

    #[error("invalid transaction hash")]
    InvalidHash,

    #[error("invalid transaction signer")]
    InvalidSigner,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("data payload is out of max data length")]
    PayloadOutOfMaxLength,

    #[error("gas price should be greater than zero")]
    ZeroGasPrice,

    #[error("gas limit should be greater than zero")]
    ZeroGasLimit,

    #[error("gas price is out of bound")]
    GasPriceOutOfBound,

    #[error("gas limit is out of bound")]
    GasLimitOutOfBound,

    #[error("out of gas limit")]
    OutOfGasLimit,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("transaction nonce is too small")]
    SmallNonce,

    #[error("transaction nonce is too large")]
    LargeNonce,

    #[error("invalid proto transaction")]
    InvalidProto,

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Arithmetic(#[from] ArithmeticError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl TransactionError {
    /// Whether the rejected transaction should go back to the pending pool.
    ///
    /// Only transient world-state failures and too-large nonces are worth a
    /// retry; every validation and arithmetic failure is final.
    pub fn gives_back(&self) -> bool {
        match self {
            TransactionError::LargeNonce => true,
            TransactionError::State(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// On-chain transaction result, logged as a JSON event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub hash: String,
    pub status: i32,
    pub gas_used: String,
    pub error: String,
}

/// Outcome of a simulated execution against a scratch world state.
#[derive(Debug)]
pub struct SimulationResult {
    pub gas_used: Uint128,
    pub result: String,
    pub execution_error: Option<String>,
}

/// A signed value transfer with an optional contract payload.
///
/// The hash covers every field except itself and the signature, so a
/// transaction is immutable once signed: any field change invalidates both.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    hash: Hash,
    from: Address,
    to: Address,
    value: Uint128,
    nonce: u64,
    timestamp: i64,
    data: pb::Data,
    chain_id: u32,
    gas_price: Uint128,
    gas_limit: Uint128,
    alg: u32,
    sign: Vec<u8>,
}

impl Transaction {
    /// Creates an unsigned transaction stamped with the current unix time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u32,
        from: Address,
        to: Address,
        value: Uint128,
        nonce: u64,
        payload_type: &str,
        payload: Vec<u8>,
        gas_price: Uint128,
        gas_limit: Uint128,
    ) -> Result<Transaction, TransactionError> {
        if gas_price.is_zero() {
            return Err(TransactionError::ZeroGasPrice);
        }
        if gas_limit.is_zero() {
            return Err(TransactionError::ZeroGasLimit);
        }
        if gas_price > TRANSACTION_MAX_GAS_PRICE {
            return Err(TransactionError::GasPriceOutOfBound);
        }
        if gas_limit > TRANSACTION_MAX_GAS {
            return Err(TransactionError::GasLimitOutOfBound);
        }
        if payload.len() > MAX_DATA_PAYLOAD_LENGTH {
            return Err(TransactionError::PayloadOutOfMaxLength);
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(Transaction {
            hash: Hash::zero(),
            from,
            to,
            value,
            nonce,
            timestamp,
            data: pb::Data {
                payload_type: payload_type.to_string(),
                payload,
            },
            chain_id,
            gas_price,
            gas_limit,
            alg: 0,
            sign: Vec::new(),
        })
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn from(&self) -> Address {
        self.from
    }

    pub fn to(&self) -> Address {
        self.to
    }

    pub fn value(&self) -> Uint128 {
        self.value
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn gas_price(&self) -> Uint128 {
        self.gas_price
    }

    pub fn gas_limit(&self) -> Uint128 {
        self.gas_limit
    }

    /// Returns the payload type tag.
    pub fn payload_type(&self) -> &str {
        &self.data.payload_type
    }

    /// Returns the raw payload bytes.
    pub fn payload_data(&self) -> &[u8] {
        &self.data.payload
    }

    /// Returns the length of the payload in bytes.
    pub fn data_len(&self) -> usize {
        self.data.payload.len()
    }

    /// Computes the canonical hash over every consensus field.
    ///
    /// Layout: `from || to || value16 || nonce_be || timestamp_be ||
    /// proto(data) || chain_id_be || gas_price16 || gas_limit16`. The stored
    /// hash and signature are deliberately excluded.
    pub fn cal_hash(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(self.from.as_slice());
        h.update(self.to.as_slice());
        h.update(&self.value.to_fixed_bytes());
        h.update(&self.nonce.to_be_bytes());
        h.update(&self.timestamp.to_be_bytes());
        h.update(&self.data.encode_to_vec());
        h.update(&self.chain_id.to_be_bytes());
        h.update(&self.gas_price.to_fixed_bytes());
        h.update(&self.gas_limit.to_fixed_bytes());
        h.finalize()
    }

    /// Signs the transaction, fixing its hash.
    ///
    /// Idempotent: re-signing after a field mutation refreshes the hash and
    /// signature together.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), TransactionError> {
        let hash = self.cal_hash();
        let sign = key.sign_hash(&hash)?;
        self.hash = hash;
        self.alg = Algorithm::Secp256k1 as u32;
        self.sign = sign;
        Ok(())
    }

    /// Verifies chain binding, hash integrity and signer identity, in order.
    pub fn verify_integrity(&self, chain_id: u32) -> Result<(), TransactionError> {
        if self.chain_id != chain_id {
            return Err(TransactionError::InvalidChainId);
        }

        if self.cal_hash() != self.hash {
            return Err(TransactionError::InvalidHash);
        }

        let signer = recover_signer(self.alg, &self.hash, &self.sign)?;
        if signer != self.from {
            return Err(TransactionError::InvalidSigner);
        }

        Ok(())
    }

    /// Base gas for this transaction: a fixed floor plus a per-byte charge.
    pub fn gas_count_of_tx_base(&self) -> Result<Uint128, TransactionError> {
        let mut gas = MIN_GAS_COUNT_PER_TRANSACTION;
        if self.data_len() > 0 {
            let data_gas = Uint128::new(self.data_len() as u128).mul(GAS_COUNT_PER_BYTE)?;
            gas = gas.add(data_gas)?;
        }
        Ok(gas)
    }

    /// Min balance required to admit this transaction:
    /// `gas_price * gas_limit + value`.
    pub fn min_balance_required(&self) -> Result<Uint128, TransactionError> {
        let total = self.gas_price.mul(self.gas_limit)?;
        Ok(total.add(self.value)?)
    }

    /// Parses the payload carried in the data field.
    pub fn load_payload(&self) -> Result<TxPayload, PayloadError> {
        TxPayload::load(&self.data)
    }

    /// Min gas expected for this transaction to enter the chain:
    /// base gas plus the payload's fixed cost.
    pub fn calculate_min_gas_expected(
        &self,
    ) -> Result<(Uint128, TxPayload), TransactionError> {
        let base = self.gas_count_of_tx_base()?;
        let payload = self.load_payload()?;
        let expected = base.add(payload.base_gas_count())?;
        Ok((expected, payload))
    }

    /// Derives the contract address a deploy transaction will create.
    pub fn generate_contract_address(&self) -> Result<Address, TransactionError> {
        if self.data.payload_type != TX_PAYLOAD_DEPLOY_TYPE {
            return Err(TransactionError::InvalidArgument);
        }
        Ok(Address::for_contract(&self.from, self.nonce))
    }

    /// Executes the transaction against `ws` and settles gas.
    ///
    /// Returns `Ok(())` when the transaction enters the chain, either
    /// successfully or with an on-chain failure event. An `Err` means the
    /// transaction must not be included; consult
    /// [`TransactionError::gives_back`] to decide whether to retry it later.
    pub fn verify_execution<W: WorldState>(
        &self,
        ctx: &BlockContext,
        ws: &mut W,
        engine: &dyn ContractEngine,
    ) -> Result<(), TransactionError> {
        // step 1: balance precheck against the worst-case charge.
        let from_acc = ws.get_or_create_user_account(&self.from)?;
        let min_balance = self.min_balance_required()?;
        if from_acc.balance() < min_balance {
            return Err(TransactionError::InsufficientBalance);
        }

        // step 2: base gas must fit in the limit, otherwise the transaction
        // never enters the chain.
        let base_gas = self.gas_count_of_tx_base()?;
        if self.gas_limit < base_gas {
            return Err(TransactionError::OutOfGasLimit);
        }

        // step 3: a malformed payload enters the chain as a failure, with
        // base gas charged.
        let payload = match self.load_payload() {
            Ok(payload) => payload,
            Err(payload_err) => {
                debug!(tx = %self.hash, error = %payload_err, "failed to load payload");
                self.record_gas(base_gas, ws)?;
                self.record_result_event(base_gas, Some(payload_err.to_string()), ws)?;
                return Ok(());
            }
        };

        // step 4: the payload's fixed cost must fit too; here the full
        // limit is burned.
        let min_gas = base_gas.add(payload.base_gas_count())?;
        if self.gas_limit < min_gas {
            self.record_gas(self.gas_limit, ws)?;
            self.record_result_event(
                self.gas_limit,
                Some(TransactionError::OutOfGasLimit.to_string()),
                ws,
            )?;
            return Ok(());
        }

        // step 5: value transfer. Missing accounts come to life with zero
        // balance; a self-transfer nets out.
        ws.sub_balance(&self.from, self.value)?;
        ws.add_balance(&self.to, self.value)?;

        // step 6: payload execution; failures roll the state back to the
        // checkpoint but keep the gas the engine consumed.
        let (gas_execution, exec_error) = match payload.execute(self, ctx, ws, engine) {
            Ok((gas, _result)) => (gas, None),
            Err(failure) => {
                debug!(tx = %self.hash, error = %failure, "payload execution failed, resetting");
                ws.reset()?;
                (failure.gas, Some(failure.error.to_string()))
            }
        };

        // step 7: total gas check; exceeding the limit voids the execution
        // but still burns the whole limit.
        let total_gas = min_gas.add(gas_execution)?;
        if self.gas_limit < total_gas {
            ws.reset()?;
            self.record_gas(self.gas_limit, ws)?;
            self.record_result_event(
                self.gas_limit,
                Some(TransactionError::OutOfGasLimit.to_string()),
                ws,
            )?;
            return Ok(());
        }

        // step 8: settle gas and log the outcome.
        self.record_gas(total_gas, ws)?;
        self.record_result_event(total_gas, exec_error, ws)?;
        Ok(())
    }

    /// Simulates execution against a scratch copy of `state`.
    ///
    /// The gas limit is raised to [`TRANSACTION_MAX_GAS`] and no signature is
    /// required; the canonical world state is never touched.
    pub fn simulate_execution(
        &self,
        ctx: &BlockContext,
        state: &StateDB,
        engine: &dyn ContractEngine,
    ) -> Result<SimulationResult, TransactionError> {
        let mut tx = self.clone();
        tx.gas_limit = TRANSACTION_MAX_GAS;
        tx.hash = tx.cal_hash();

        let mut scratch = state.clone();
        let (mut gas_used, payload) = tx.calculate_min_gas_expected()?;

        let mut result = String::new();
        let mut execution_error = None;

        if tx.data.payload_type == TX_PAYLOAD_CALL_TYPE
            || tx.data.payload_type == TX_PAYLOAD_DEPLOY_TYPE
        {
            scratch.add_balance(&tx.to, tx.value)?;

            match payload.execute(&tx, ctx, &mut scratch, engine) {
                Ok((gas_execution, engine_result)) => {
                    gas_used = gas_used.add(gas_execution)?;
                    result = engine_result;
                }
                Err(failure) => {
                    gas_used = gas_used.add(failure.gas)?;
                    return Ok(SimulationResult {
                        gas_used,
                        result,
                        execution_error: Some(failure.error.to_string()),
                    });
                }
            }
        }

        let from_acc = scratch.get_or_create_user_account(&tx.from)?;
        let required = tx.gas_price.mul(gas_used)?.add(tx.value)?;
        if from_acc.balance() < required {
            execution_error = Some(TransactionError::InsufficientBalance.to_string());
        }

        Ok(SimulationResult {
            gas_used,
            result,
            execution_error,
        })
    }

    /// Nonce admission check: the transaction must follow the account's
    /// current nonce exactly.
    pub fn check_transaction<W: WorldState>(&self, ws: &mut W) -> Result<(), TransactionError> {
        let from_acc = ws.get_or_create_user_account(&self.from)?;
        let current = from_acc.nonce();

        if self.nonce < current + 1 {
            Err(TransactionError::SmallNonce)
        } else if self.nonce > current + 1 {
            Err(TransactionError::LargeNonce)
        } else {
            Ok(())
        }
    }

    /// Persists the transaction under its hash and bumps the sender nonce.
    pub fn accept_transaction<W: WorldState>(&self, ws: &mut W) -> Result<(), TransactionError> {
        let bytes = self.to_proto().encode_to_vec();
        ws.put_tx(self.hash, bytes)?;
        ws.incr_nonce(&self.from)?;
        Ok(())
    }

    fn record_gas<W: WorldState>(&self, gas: Uint128, ws: &mut W) -> Result<(), TransactionError> {
        let cost = self.gas_price.mul(gas)?;
        ws.record_gas(&self.from, cost)?;
        Ok(())
    }

    fn record_result_event<W: WorldState>(
        &self,
        gas_used: Uint128,
        error: Option<String>,
        ws: &mut W,
    ) -> Result<(), TransactionError> {
        let event = TransactionEvent {
            hash: self.hash.to_string(),
            status: if error.is_some() {
                TX_EXECUTION_FAILED
            } else {
                TX_EXECUTION_SUCCESS
            },
            gas_used: gas_used.to_string(),
            error: error.unwrap_or_default(),
        };

        let data = serde_json::to_string(&event)
            .map_err(|e| StateError::Storage(e.to_string()))?;
        ws.record_event(
            self.hash,
            Event {
                topic: TOPIC_TRANSACTION_EXECUTION_RESULT.to_string(),
                data,
            },
        )?;
        Ok(())
    }

    /// Converts to the wire representation.
    pub fn to_proto(&self) -> pb::Transaction {
        pb::Transaction {
            hash: self.hash.to_vec(),
            from: self.from.to_vec(),
            to: self.to.to_vec(),
            value: self.value.to_fixed_bytes().to_vec(),
            nonce: self.nonce,
            timestamp: self.timestamp,
            data: Some(self.data.clone()),
            chain_id: self.chain_id,
            gas_price: self.gas_price.to_fixed_bytes().to_vec(),
            gas_limit: self.gas_limit.to_fixed_bytes().to_vec(),
            alg: self.alg,
            sign: self.sign.clone(),
        }
    }

    /// Builds a transaction from its wire representation, validating field
    /// shapes and the payload length cap.
    pub fn from_proto(msg: &pb::Transaction) -> Result<Transaction, TransactionError> {
        let data = msg.data.clone().ok_or(TransactionError::InvalidProto)?;
        if data.payload.len() > MAX_DATA_PAYLOAD_LENGTH {
            return Err(TransactionError::PayloadOutOfMaxLength);
        }

        Ok(Transaction {
            hash: Hash::from_slice(&msg.hash).ok_or(TransactionError::InvalidProto)?,
            from: Address::parse_from_bytes(&msg.from)?,
            to: Address::parse_from_bytes(&msg.to)?,
            value: Uint128::from_fixed_bytes(&msg.value).ok_or(TransactionError::InvalidProto)?,
            nonce: msg.nonce,
            timestamp: msg.timestamp,
            data,
            chain_id: msg.chain_id,
            gas_price: Uint128::from_fixed_bytes(&msg.gas_price)
                .ok_or(TransactionError::InvalidProto)?,
            gas_limit: Uint128::from_fixed_bytes(&msg.gas_limit)
                .ok_or(TransactionError::InvalidProto)?,
            alg: msg.alg,
            sign: msg.sign.clone(),
        })
    }
}

/// Loads a stored transaction from the world state by its raw hash bytes.
pub fn get_transaction<W: WorldState>(
    hash: &[u8],
    ws: &W,
) -> Result<Transaction, TransactionError> {
    if hash.len() != TX_HASH_BYTE_LENGTH {
        return Err(TransactionError::InvalidArgument);
    }
    let hash = Hash::from_slice(hash).ok_or(TransactionError::InvalidArgument)?;

    let bytes = ws.get_tx(&hash)?;
    let msg = pb::Transaction::decode(bytes.as_slice())
        .map_err(|_| TransactionError::InvalidProto)?;
    Transaction::from_proto(&msg)
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"chainID":{}, "hash":"{}", "from":"{}", "to":"{}", "nonce":{}, "value":"{}", "timestamp":{}, "gasprice":"{}", "gaslimit":"{}", "type":"{}"}}"#,
            self.chain_id,
            self.hash,
            self.from,
            self.to,
            self.nonce,
            self.value,
            self.timestamp,
            self.gas_price,
            self.gas_limit,
            self.data.payload_type,
        )
    }
}
