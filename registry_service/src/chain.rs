use crate::error::IndexerError;
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types::{BlockId, BlockNumberOrTag, BlockTransactionsKind};
use alloy_sol_macro::sol;
use alloy_transport_http::{Client, Http};
use async_trait::async_trait;
use futures::future::try_join_all;
use registry_database::models::{DepositSignature, Key, Operator, SigningPubkey};

sol!(
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract NodeOperatorsRegistry {
        function getKeysOpIndex() external view returns (uint256 keysOpIndex);
        function getNodeOperatorsCount() external view returns (uint256 count);
        function getNodeOperator(uint256 operatorId, bool fullInfo) external view returns (
            bool active,
            string name,
            address rewardAddress,
            uint64 stakingLimit,
            uint64 stoppedValidators,
            uint64 totalSigningKeys,
            uint64 usedSigningKeys
        );
        function getSigningKey(uint256 operatorId, uint256 keyIndex) external view returns (
            bytes key,
            bytes depositSignature,
            bool used
        );
    }
);

type T = Http<Client>;
type P = RootProvider<T>;
type RegistryInstance = NodeOperatorsRegistry::NodeOperatorsRegistryInstance<T, P>;

/// Upper bound on `eth_call`s issued concurrently within one fetch batch.
pub const CALL_BATCH_SIZE: u64 = 100;

/// A block reference accepted by [`RegistryReader::resolve_block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Hash(B256),
    Finalized,
    Latest,
}

/// Canonical block coordinates every read in one update cycle pins on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

/// Read-only access to the registry contract, pinned per call to a block
/// hash so a reorg during a cycle cannot splice in an inconsistent read.
#[async_trait]
pub trait RegistryReader: Send + Sync {
    async fn resolve_block(&self, block_ref: BlockRef) -> Result<BlockInfo, IndexerError>;

    async fn fetch_keys_op_index(&self, block_hash: B256) -> Result<u64, IndexerError>;

    async fn fetch_operators(&self, block_hash: B256) -> Result<Vec<Operator>, IndexerError>;

    /// Fetch the half-open signing-key range `[from, to)` of one operator.
    async fn fetch_keys(
        &self,
        operator_index: u32,
        from: u64,
        to: u64,
        block_hash: B256,
    ) -> Result<Vec<Key>, IndexerError>;
}

pub struct RegistryContract {
    module_address: Address,
    provider: P,
    instance: RegistryInstance,
}

impl RegistryContract {
    pub fn new(rpc_url: &str, module_address: Address) -> Result<Self, IndexerError> {
        let url = rpc_url
            .parse::<reqwest::Url>()
            .map_err(|e| IndexerError::ChainUnavailable(e.to_string()))?;
        let provider: P = ProviderBuilder::new().on_http(url);
        let instance = NodeOperatorsRegistry::new(module_address, provider.clone());
        Ok(Self {
            module_address,
            provider,
            instance,
        })
    }

    async fn query_operator(
        &self,
        operator_index: u64,
        block_hash: B256,
    ) -> Result<Operator, IndexerError> {
        let NodeOperatorsRegistry::getNodeOperatorReturn {
            active,
            name,
            rewardAddress: reward_address,
            stakingLimit: staking_limit,
            stoppedValidators: stopped_validators,
            totalSigningKeys: total_signing_keys,
            usedSigningKeys: used_signing_keys,
        } = self
            .instance
            .getNodeOperator(U256::from(operator_index), true)
            .block(BlockId::hash(block_hash))
            .call()
            .await
            .map_err(|e| IndexerError::ChainUnavailable(e.to_string()))?;
        Ok(Operator {
            module_address: self.module_address,
            index: operator_index as u32,
            active,
            name,
            reward_address,
            staking_limit,
            stopped_validators,
            total_signing_keys,
            used_signing_keys,
        })
    }

    async fn query_signing_key(
        &self,
        operator_index: u32,
        key_index: u64,
        block_hash: B256,
    ) -> Result<Key, IndexerError> {
        let NodeOperatorsRegistry::getSigningKeyReturn {
            key,
            depositSignature: deposit_signature,
            used,
        } = self
            .instance
            .getSigningKey(U256::from(operator_index), U256::from(key_index))
            .block(BlockId::hash(block_hash))
            .call()
            .await
            .map_err(|e| IndexerError::ChainUnavailable(e.to_string()))?;
        let key = SigningPubkey::try_from(key.as_ref()).map_err(|_| {
            IndexerError::ChainUnavailable(format!(
                "operator {} key {} has an invalid pubkey length",
                operator_index, key_index
            ))
        })?;
        let deposit_signature =
            DepositSignature::try_from(deposit_signature.as_ref()).map_err(|_| {
                IndexerError::ChainUnavailable(format!(
                    "operator {} key {} has an invalid deposit signature length",
                    operator_index, key_index
                ))
            })?;
        Ok(Key {
            module_address: self.module_address,
            operator_index,
            index: key_index as u32,
            key,
            deposit_signature,
            used,
        })
    }
}

#[async_trait]
impl RegistryReader for RegistryContract {
    async fn resolve_block(&self, block_ref: BlockRef) -> Result<BlockInfo, IndexerError> {
        let id = match block_ref {
            BlockRef::Number(number) => BlockId::Number(BlockNumberOrTag::Number(number)),
            BlockRef::Hash(hash) => BlockId::hash(hash),
            BlockRef::Finalized => BlockId::Number(BlockNumberOrTag::Finalized),
            BlockRef::Latest => BlockId::Number(BlockNumberOrTag::Latest),
        };
        let block = self
            .provider
            .get_block(id, BlockTransactionsKind::Hashes)
            .await
            .map_err(|e| IndexerError::ChainUnavailable(e.to_string()))?
            .ok_or_else(|| IndexerError::UnknownBlock(format!("{:?}", block_ref)))?;
        Ok(BlockInfo {
            number: block.header.inner.number,
            hash: block.header.hash,
            timestamp: block.header.inner.timestamp,
        })
    }

    async fn fetch_keys_op_index(&self, block_hash: B256) -> Result<u64, IndexerError> {
        let NodeOperatorsRegistry::getKeysOpIndexReturn {
            keysOpIndex: keys_op_index,
        } = self
            .instance
            .getKeysOpIndex()
            .block(BlockId::hash(block_hash))
            .call()
            .await
            .map_err(|e| IndexerError::ChainUnavailable(e.to_string()))?;
        keys_op_index
            .try_into()
            .map_err(|_| IndexerError::ChainUnavailable("keys op index exceeds u64".to_string()))
    }

    async fn fetch_operators(&self, block_hash: B256) -> Result<Vec<Operator>, IndexerError> {
        let NodeOperatorsRegistry::getNodeOperatorsCountReturn { count } = self
            .instance
            .getNodeOperatorsCount()
            .block(BlockId::hash(block_hash))
            .call()
            .await
            .map_err(|e| IndexerError::ChainUnavailable(e.to_string()))?;
        let count: u64 = count
            .try_into()
            .map_err(|_| IndexerError::ChainUnavailable("operator count exceeds u64".to_string()))?;

        let mut operators = Vec::with_capacity(count as usize);
        let mut start = 0;
        while start < count {
            let end = std::cmp::min(start + CALL_BATCH_SIZE, count);
            let batch =
                try_join_all((start..end).map(|index| self.query_operator(index, block_hash)))
                    .await?;
            operators.extend(batch);
            start = end;
        }
        Ok(operators)
    }

    async fn fetch_keys(
        &self,
        operator_index: u32,
        from: u64,
        to: u64,
        block_hash: B256,
    ) -> Result<Vec<Key>, IndexerError> {
        if to <= from {
            return Ok(vec![]);
        }
        let mut keys = Vec::with_capacity((to - from) as usize);
        let mut start = from;
        while start < to {
            let end = std::cmp::min(start + CALL_BATCH_SIZE, to);
            let batch = try_join_all(
                (start..end).map(|index| self.query_signing_key(operator_index, index, block_hash)),
            )
            .await?;
            keys.extend(batch);
            start = end;
        }
        Ok(keys)
    }
}
