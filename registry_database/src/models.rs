use alloy_primitives::{Address, FixedBytes, B256};
use serde::{Deserialize, Serialize};

/// BLS12-381 public key of a signing key record.
pub type SigningPubkey = FixedBytes<48>;
/// Deposit signature accompanying a signing key.
pub type DepositSignature = FixedBytes<96>;

/// Block snapshot pinning the mirrored state of one registry module to a
/// chain state. At most one row per module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub module_address: Address,
    pub block_number: u64,
    pub block_hash: B256,
    pub timestamp: u64,
    pub keys_op_index: u64,
}

/// A node operator registered in the on-chain registry module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub module_address: Address,
    pub index: u32,
    pub active: bool,
    pub name: String,
    pub reward_address: Address,
    pub staking_limit: u64,
    pub stopped_validators: u64,
    pub total_signing_keys: u64,
    pub used_signing_keys: u64,
}

/// A signing key owned by an operator. Keys at indices below the operator's
/// `used_signing_keys` are immutable on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub module_address: Address,
    pub operator_index: u32,
    pub index: u32,
    pub key: SigningPubkey,
    pub deposit_signature: DepositSignature,
    pub used: bool,
}
