//! Polymorphic transaction payloads.
//!
//! Binary, Deploy and Call payloads share the capability set
//! `{base_gas_count, execute}`. Deploy and Call dispatch into the external
//! virtual machine behind the [`ContractEngine`] trait; the binary variant
//! settles without touching the engine.

use crate::core::address::Address;
use crate::core::block::BlockContext;
use crate::core::pb;
use crate::core::transaction::{Transaction, TransactionEvent, TX_EXECUTION_SUCCESS};
use crate::state::{Account, StateError, WorldState, TOPIC_TRANSACTION_EXECUTION_RESULT};
use crate::types::uint128::Uint128;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload type tag for plain value transfers with opaque data.
pub const TX_PAYLOAD_BINARY_TYPE: &str = "binary";
/// Payload type tag for contract deployments.
pub const TX_PAYLOAD_DEPLOY_TYPE: &str = "deploy";
/// Payload type tag for contract calls.
pub const TX_PAYLOAD_CALL_TYPE: &str = "call";

/// Fixed gas cost of a deploy payload, independent of execution.
const DEPLOY_BASE_GAS: Uint128 = Uint128::new(60);
/// Fixed gas cost of a call payload, independent of execution.
const CALL_BASE_GAS: Uint128 = Uint128::new(60);

/// Errors produced while parsing or executing payloads.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid transaction payload type: {0}")]
    InvalidType(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid call function name: {0}")]
    InvalidFunctionName(String),

    #[error("contract check failed")]
    ContractCheckFailed,

    #[error("contract execution failed: {0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Gas consumed and error reported by a failed payload execution.
///
/// The engine may have burned gas before failing; that gas still counts
/// toward the transaction total.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    pub gas: Uint128,
    pub error: PayloadError,
}

/// Contract deployment payload: source plus constructor arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPayload {
    pub source_type: String,
    pub source: String,
    pub args: String,
}

/// Contract call payload: function name plus arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPayload {
    pub function: String,
    pub args: String,
}

/// Opaque binary payload carried by plain transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPayload {
    pub data: Vec<u8>,
}

/// The smart-contract virtual machine, seen from the core as a pure
/// collaborator: it consumes gas and produces a result string or an error.
pub trait ContractEngine: Send + Sync {
    fn deploy(
        &self,
        ctx: &BlockContext,
        tx: &Transaction,
        payload: &DeployPayload,
        ws: &mut dyn WorldState,
    ) -> Result<(Uint128, String), ExecutionFailure>;

    fn call(
        &self,
        ctx: &BlockContext,
        tx: &Transaction,
        payload: &CallPayload,
        ws: &mut dyn WorldState,
    ) -> Result<(Uint128, String), ExecutionFailure>;
}

/// Engine that accepts every deploy and call without consuming gas.
///
/// Stands in for the real virtual machine in nodes that do not execute
/// contract code, and in unit tests.
pub struct NoopEngine;

impl ContractEngine for NoopEngine {
    fn deploy(
        &self,
        _ctx: &BlockContext,
        _tx: &Transaction,
        _payload: &DeployPayload,
        _ws: &mut dyn WorldState,
    ) -> Result<(Uint128, String), ExecutionFailure> {
        Ok((Uint128::zero(), String::new()))
    }

    fn call(
        &self,
        _ctx: &BlockContext,
        _tx: &Transaction,
        _payload: &CallPayload,
        _ws: &mut dyn WorldState,
    ) -> Result<(Uint128, String), ExecutionFailure> {
        Ok((Uint128::zero(), String::new()))
    }
}

/// A parsed transaction payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPayload {
    Binary(BinaryPayload),
    Deploy(DeployPayload),
    Call(CallPayload),
}

impl TxPayload {
    /// Parses the payload carried by a wire `Data` message.
    pub fn load(data: &pb::Data) -> Result<TxPayload, PayloadError> {
        match data.payload_type.as_str() {
            TX_PAYLOAD_BINARY_TYPE => Ok(TxPayload::Binary(BinaryPayload {
                data: data.payload.clone(),
            })),
            TX_PAYLOAD_DEPLOY_TYPE => serde_json::from_slice(&data.payload)
                .map(TxPayload::Deploy)
                .map_err(|e| PayloadError::Malformed(e.to_string())),
            TX_PAYLOAD_CALL_TYPE => {
                let payload: CallPayload = serde_json::from_slice(&data.payload)
                    .map_err(|e| PayloadError::Malformed(e.to_string()))?;
                check_function_name(&payload.function)?;
                Ok(TxPayload::Call(payload))
            }
            other => Err(PayloadError::InvalidType(other.to_string())),
        }
    }

    /// Serializes the payload into the byte form carried on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        match self {
            TxPayload::Binary(payload) => Ok(payload.data.clone()),
            TxPayload::Deploy(payload) => {
                serde_json::to_vec(payload).map_err(|e| PayloadError::Malformed(e.to_string()))
            }
            TxPayload::Call(payload) => {
                serde_json::to_vec(payload).map_err(|e| PayloadError::Malformed(e.to_string()))
            }
        }
    }

    /// Returns the wire type tag of this payload.
    pub fn payload_type(&self) -> &'static str {
        match self {
            TxPayload::Binary(_) => TX_PAYLOAD_BINARY_TYPE,
            TxPayload::Deploy(_) => TX_PAYLOAD_DEPLOY_TYPE,
            TxPayload::Call(_) => TX_PAYLOAD_CALL_TYPE,
        }
    }

    /// Fixed gas cost of this payload variant, independent of execution cost.
    pub fn base_gas_count(&self) -> Uint128 {
        match self {
            TxPayload::Binary(_) => Uint128::zero(),
            TxPayload::Deploy(_) => DEPLOY_BASE_GAS,
            TxPayload::Call(_) => CALL_BASE_GAS,
        }
    }

    /// Executes the payload, returning consumed gas and the engine result.
    pub fn execute<W: WorldState>(
        &self,
        tx: &Transaction,
        ctx: &BlockContext,
        ws: &mut W,
        engine: &dyn ContractEngine,
    ) -> Result<(Uint128, String), ExecutionFailure> {
        match self {
            TxPayload::Binary(_) => Ok((Uint128::zero(), String::new())),
            TxPayload::Deploy(payload) => {
                let contract = Address::for_contract(&tx.from(), tx.nonce());
                ws.create_contract_account(&contract, tx.hash())
                    .map_err(|e| ExecutionFailure {
                        gas: Uint128::zero(),
                        error: e.into(),
                    })?;
                engine.deploy(ctx, tx, payload, ws)
            }
            TxPayload::Call(payload) => {
                check_contract(&tx.to(), ws).map_err(|e| ExecutionFailure {
                    gas: Uint128::zero(),
                    error: e,
                })?;
                engine.call(ctx, tx, payload, ws)
            }
        }
    }
}

/// Validates a contract callee before dispatching a call into the engine.
///
/// The contract must exist, carry a birth place, and its deployment must
/// have succeeded: the judgment is made on the last transaction-result
/// event recorded for the deploying transaction.
pub fn check_contract<W: WorldState>(addr: &Address, ws: &W) -> Result<Account, PayloadError> {
    let contract = ws
        .get_contract_account(addr)
        .map_err(|_| PayloadError::ContractCheckFailed)?;

    let birth_place = contract
        .birth_place()
        .ok_or(PayloadError::ContractCheckFailed)?;

    let events = ws.fetch_events(&birth_place)?;
    let last_result = events
        .iter()
        .rev()
        .find(|event| event.topic == TOPIC_TRANSACTION_EXECUTION_RESULT)
        .ok_or(PayloadError::ContractCheckFailed)?;

    let event: TransactionEvent = serde_json::from_str(&last_result.data)
        .map_err(|e| PayloadError::Malformed(e.to_string()))?;
    if event.status != TX_EXECUTION_SUCCESS {
        return Err(PayloadError::ContractCheckFailed);
    }

    Ok(contract)
}

/// Validates an exported contract function name.
///
/// Names must start with a letter or `$`, continue with `[A-Za-z0-9_$]`,
/// and must not collide with the reserved constructor name.
fn check_function_name(name: &str) -> Result<(), PayloadError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '$')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

    if !valid_start || !valid_rest || name == "init" {
        return Err(PayloadError::InvalidFunctionName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Event, StateDB};
    use crate::test_utils::mock_address;
    use crate::types::hash::Hash;

    fn data(payload_type: &str, payload: &[u8]) -> pb::Data {
        pb::Data {
            payload_type: payload_type.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn load_binary_payload() {
        let payload = TxPayload::load(&data(TX_PAYLOAD_BINARY_TYPE, b"blob")).unwrap();
        assert_eq!(
            payload,
            TxPayload::Binary(BinaryPayload {
                data: b"blob".to_vec()
            })
        );
        assert!(payload.base_gas_count().is_zero());
    }

    #[test]
    fn load_deploy_payload() {
        let deploy = DeployPayload {
            source_type: "js".to_string(),
            source: "module.exports = {}".to_string(),
            args: "[]".to_string(),
        };
        let bytes = serde_json::to_vec(&deploy).unwrap();

        let payload = TxPayload::load(&data(TX_PAYLOAD_DEPLOY_TYPE, &bytes)).unwrap();
        assert_eq!(payload, TxPayload::Deploy(deploy));
        assert_eq!(payload.base_gas_count(), DEPLOY_BASE_GAS);
    }

    #[test]
    fn load_call_payload() {
        let call = CallPayload {
            function: "transfer".to_string(),
            args: "[\"a\",\"1\"]".to_string(),
        };
        let bytes = serde_json::to_vec(&call).unwrap();

        let payload = TxPayload::load(&data(TX_PAYLOAD_CALL_TYPE, &bytes)).unwrap();
        assert_eq!(payload, TxPayload::Call(call));
        assert_eq!(payload.base_gas_count(), CALL_BASE_GAS);
    }

    #[test]
    fn load_rejects_unknown_type() {
        assert!(matches!(
            TxPayload::load(&data("vote", b"")),
            Err(PayloadError::InvalidType(_))
        ));
    }

    #[test]
    fn load_rejects_malformed_deploy_json() {
        assert!(matches!(
            TxPayload::load(&data(TX_PAYLOAD_DEPLOY_TYPE, b"not-json")),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn load_rejects_reserved_function_name() {
        let call = CallPayload {
            function: "init".to_string(),
            args: String::new(),
        };
        let bytes = serde_json::to_vec(&call).unwrap();

        assert!(matches!(
            TxPayload::load(&data(TX_PAYLOAD_CALL_TYPE, &bytes)),
            Err(PayloadError::InvalidFunctionName(_))
        ));
    }

    #[test]
    fn function_names_validate_charset() {
        assert!(check_function_name("transfer").is_ok());
        assert!(check_function_name("$balanceOf").is_ok());
        assert!(check_function_name("get_value2").is_ok());

        assert!(check_function_name("").is_err());
        assert!(check_function_name("2fast").is_err());
        assert!(check_function_name("with-dash").is_err());
        assert!(check_function_name("with space").is_err());
    }

    #[test]
    fn payload_bytes_roundtrip() {
        let original = TxPayload::Deploy(DeployPayload {
            source_type: "js".to_string(),
            source: "code".to_string(),
            args: "[1]".to_string(),
        });

        let bytes = original.to_bytes().unwrap();
        let reloaded = TxPayload::load(&data(TX_PAYLOAD_DEPLOY_TYPE, &bytes)).unwrap();
        assert_eq!(original, reloaded);
    }

    fn birth_event(status: i32) -> Event {
        let event = TransactionEvent {
            hash: String::new(),
            status,
            gas_used: "0".to_string(),
            error: String::new(),
        };
        Event {
            topic: TOPIC_TRANSACTION_EXECUTION_RESULT.to_string(),
            data: serde_json::to_string(&event).unwrap(),
        }
    }

    #[test]
    fn check_contract_accepts_successful_birth() {
        let mut ws = StateDB::new();
        let contract = mock_address();
        let birth = Hash::sha3().chain(b"deploy").finalize();

        ws.create_contract_account(&contract, birth).unwrap();
        ws.record_event(birth, birth_event(TX_EXECUTION_SUCCESS))
            .unwrap();

        assert!(check_contract(&contract, &ws).is_ok());
    }

    #[test]
    fn check_contract_rejects_unknown_address() {
        let ws = StateDB::new();
        assert!(matches!(
            check_contract(&mock_address(), &ws),
            Err(PayloadError::ContractCheckFailed)
        ));
    }

    #[test]
    fn check_contract_rejects_failed_birth() {
        let mut ws = StateDB::new();
        let contract = mock_address();
        let birth = Hash::sha3().chain(b"deploy").finalize();

        ws.create_contract_account(&contract, birth).unwrap();
        ws.record_event(birth, birth_event(crate::core::transaction::TX_EXECUTION_FAILED))
            .unwrap();

        assert!(matches!(
            check_contract(&contract, &ws),
            Err(PayloadError::ContractCheckFailed)
        ));
    }

    #[test]
    fn check_contract_judges_the_last_result_event() {
        let mut ws = StateDB::new();
        let contract = mock_address();
        let birth = Hash::sha3().chain(b"deploy").finalize();

        // An earlier success must not mask the final failure.
        ws.create_contract_account(&contract, birth).unwrap();
        ws.record_event(birth, birth_event(TX_EXECUTION_SUCCESS))
            .unwrap();
        ws.record_event(birth, birth_event(crate::core::transaction::TX_EXECUTION_FAILED))
            .unwrap();

        assert!(matches!(
            check_contract(&contract, &ws),
            Err(PayloadError::ContractCheckFailed)
        ));
    }
}
