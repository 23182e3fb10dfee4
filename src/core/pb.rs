//! Protobuf wire messages.
//!
//! Field numbering is part of the consensus surface: the transaction hash
//! covers the encoded `Data` message, so any tag change breaks hash
//! compatibility with existing chains.

/// Typed transaction payload: a type string plus opaque payload bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(string, tag = "1")]
    pub payload_type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Wire form of a transaction.
///
/// `value`, `gas_price` and `gas_limit` are fixed 16-byte big-endian slices.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Transaction {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub from: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub to: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub value: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub nonce: u64,
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "7")]
    pub data: Option<Data>,
    #[prost(uint32, tag = "8")]
    pub chain_id: u32,
    #[prost(bytes = "vec", tag = "9")]
    pub gas_price: Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub gas_limit: Vec<u8>,
    #[prost(uint32, tag = "11")]
    pub alg: u32,
    #[prost(bytes = "vec", tag = "12")]
    pub sign: Vec<u8>,
}

/// Wire form of a block header; all roots are 32-byte digests.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub parent_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub coinbase: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(uint32, tag = "5")]
    pub chain_id: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub state_root: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub txs_root: Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub events_root: Vec<u8>,
    #[prost(uint32, tag = "9")]
    pub alg: u32,
    #[prost(bytes = "vec", tag = "10")]
    pub sign: Vec<u8>,
}

/// Wire form of a block: header plus ordered transaction body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Block {
    #[prost(message, optional, tag = "1")]
    pub header: Option<BlockHeader>,
    #[prost(message, repeated, tag = "2")]
    pub body: Vec<Transaction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn data_roundtrip() {
        let data = Data {
            payload_type: "binary".to_string(),
            payload: vec![1, 2, 3],
        };

        let bytes = data.encode_to_vec();
        let decoded = Data::decode(bytes.as_slice()).expect("decode failed");
        assert_eq!(data, decoded);
    }

    #[test]
    fn data_encoding_is_deterministic() {
        let data = Data {
            payload_type: "deploy".to_string(),
            payload: b"{}".to_vec(),
        };

        assert_eq!(data.encode_to_vec(), data.encode_to_vec());
    }

    #[test]
    fn empty_data_encodes_to_no_bytes() {
        // Proto3 default values are skipped on the wire.
        let data = Data::default();
        assert!(data.encode_to_vec().is_empty());
    }

    #[test]
    fn transaction_roundtrip() {
        let tx = Transaction {
            hash: vec![0xAA; 32],
            from: vec![0x57; 24],
            to: vec![0x57; 24],
            value: vec![0; 16],
            nonce: 7,
            timestamp: 1_500_000_000,
            data: Some(Data {
                payload_type: "binary".to_string(),
                payload: vec![],
            }),
            chain_id: 100,
            gas_price: vec![0; 16],
            gas_limit: vec![0; 16],
            alg: 1,
            sign: vec![0xCC; 65],
        };

        let bytes = tx.encode_to_vec();
        let decoded = Transaction::decode(bytes.as_slice()).expect("decode failed");
        assert_eq!(tx, decoded);
    }

    #[test]
    fn block_roundtrip() {
        let block = Block {
            header: Some(BlockHeader {
                hash: vec![1; 32],
                parent_hash: vec![2; 32],
                coinbase: vec![0x57; 24],
                timestamp: 10,
                chain_id: 100,
                state_root: vec![3; 32],
                txs_root: vec![4; 32],
                events_root: vec![5; 32],
                alg: 1,
                sign: vec![6; 65],
            }),
            body: vec![],
        };

        let bytes = block.encode_to_vec();
        let decoded = Block::decode(bytes.as_slice()).expect("decode failed");
        assert_eq!(block, decoded);
    }
}
