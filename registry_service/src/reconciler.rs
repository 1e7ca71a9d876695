use crate::chain::{BlockRef, RegistryReader};
use crate::diff::{self, MirrorKind};
use crate::error::IndexerError;
use alloy_primitives::Address;
use registry_database::models::Meta;
use registry_database::RegistryDatabase;
use slog::{info, warn, Logger};
use std::collections::HashMap;

/// Makes the mirrored tables equal to the contract's view at a single block
/// hash, refetching only the operator key ranges that may have changed.
pub struct Reconciler<R> {
    logger: Logger,
    reader: R,
    db: RegistryDatabase,
    module_address: Address,
    kind: MirrorKind,
}

impl<R: RegistryReader> Reconciler<R> {
    pub fn new(
        logger: Logger,
        reader: R,
        db: RegistryDatabase,
        module_address: Address,
        kind: MirrorKind,
    ) -> Self {
        Self {
            logger,
            reader,
            db,
            module_address,
            kind,
        }
    }

    /// Run one update cycle against `block_ref`.
    ///
    /// Returns the committed meta snapshot, or `None` when the resolved
    /// block is older than the stored one and the cycle was skipped.
    pub async fn update(&self, block_ref: BlockRef) -> Result<Option<Meta>, IndexerError> {
        let prev_meta = self
            .db
            .with_transaction(|tx| self.db.get_meta(tx, &self.module_address))?;

        let block = self.reader.resolve_block(block_ref).await?;
        let keys_op_index = self.reader.fetch_keys_op_index(block.hash).await?;
        let curr_meta = Meta {
            module_address: self.module_address,
            block_number: block.number,
            block_hash: block.hash,
            timestamp: block.timestamp,
            keys_op_index,
        };

        if let Some(prev) = &prev_meta {
            if prev.block_number > curr_meta.block_number {
                warn!(
                    self.logger,
                    "observed block older than stored meta, skipping update";
                    "stored block" => prev.block_number,
                    "observed block" => curr_meta.block_number,
                );
                return Ok(None);
            }
        }

        if diff::meta_unchanged(prev_meta.as_ref(), &curr_meta) {
            self.db
                .with_transaction(|tx| self.db.replace_meta(tx, &curr_meta))?;
            info!(
                self.logger,
                "registry state unchanged";
                "block" => curr_meta.block_number,
                "keys op index" => curr_meta.keys_op_index,
            );
            return Ok(Some(curr_meta));
        }

        let prev_operators = self
            .db
            .with_transaction(|tx| self.db.find_all_operators(tx, &self.module_address))?;
        let curr_operators = self.reader.fetch_operators(block.hash).await?;

        // Commit operators and meta first. Keys above each operator's
        // advertised total are gone on chain, so their rows go with the same
        // transaction; used keys always sit below the total and survive.
        self.db.with_transaction(|tx| {
            for operator in &curr_operators {
                self.db.delete_keys_from(
                    tx,
                    &self.module_address,
                    operator.index,
                    operator.total_signing_keys,
                )?;
                self.db.upsert_operator(tx, operator)?;
            }
            self.db.replace_meta(tx, &curr_meta)
        })?;

        let prev_by_index: HashMap<u32, _> = prev_operators
            .into_iter()
            .map(|operator| (operator.index, operator))
            .collect();

        for curr in &curr_operators {
            let prev = prev_by_index.get(&curr.index);
            let to = diff::to_index(self.kind, curr);
            let mut from = diff::from_index(prev, curr, to);
            if from > 0 {
                // An aborted earlier cycle may have committed the operator
                // without its keys; refetch from 0 unless the immutable
                // prefix is actually present.
                let stored_prefix = self.db.with_transaction(|tx| {
                    self.db
                        .count_keys_below(tx, &self.module_address, curr.index, from)
                })?;
                if stored_prefix < from {
                    from = 0;
                }
            }
            if to <= from {
                continue;
            }
            let fetched = self
                .reader
                .fetch_keys(curr.index, from, to, block.hash)
                .await?;
            self.db
                .with_transaction(|tx| self.db.upsert_keys(tx, &fetched))?;
            info!(
                self.logger,
                "operator keys updated";
                "operator" => curr.index,
                "from" => from,
                "to" => to,
                "fetched" => fetched.len(),
            );
        }

        info!(
            self.logger,
            "registry update complete";
            "block" => curr_meta.block_number,
            "keys op index" => curr_meta.keys_op_index,
            "operators" => curr_operators.len(),
        );
        Ok(Some(curr_meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockInfo;
    use alloy_primitives::B256;
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use registry_database::models::{DepositSignature, Key, Operator, SigningPubkey};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const MODULE: Address = Address::repeat_byte(0x11);

    struct MockChain {
        block: RwLock<BlockInfo>,
        keys_op_index: RwLock<u64>,
        operators: RwLock<Vec<Operator>>,
        keys: RwLock<HashMap<u32, Vec<Key>>>,
        operator_fetches: AtomicUsize,
        key_fetches: AtomicUsize,
        key_ranges: RwLock<Vec<(u32, u64, u64)>>,
        fail_key_fetches: AtomicBool,
    }

    impl MockChain {
        fn new(block: BlockInfo, keys_op_index: u64) -> Arc<Self> {
            Arc::new(Self {
                block: RwLock::new(block),
                keys_op_index: RwLock::new(keys_op_index),
                operators: RwLock::new(vec![]),
                keys: RwLock::new(HashMap::new()),
                operator_fetches: AtomicUsize::new(0),
                key_fetches: AtomicUsize::new(0),
                key_ranges: RwLock::new(vec![]),
                fail_key_fetches: AtomicBool::new(false),
            })
        }

        fn set_state(&self, block: BlockInfo, keys_op_index: u64) {
            *self.block.write() = block;
            *self.keys_op_index.write() = keys_op_index;
        }

        fn reset_counters(&self) {
            self.operator_fetches.store(0, Ordering::SeqCst);
            self.key_fetches.store(0, Ordering::SeqCst);
            self.key_ranges.write().clear();
        }
    }

    // The mock serves its configured head for any reference.
    #[async_trait]
    impl RegistryReader for Arc<MockChain> {
        async fn resolve_block(&self, _block_ref: BlockRef) -> Result<BlockInfo, IndexerError> {
            Ok(*self.block.read())
        }

        async fn fetch_keys_op_index(&self, _block_hash: B256) -> Result<u64, IndexerError> {
            Ok(*self.keys_op_index.read())
        }

        async fn fetch_operators(&self, _block_hash: B256) -> Result<Vec<Operator>, IndexerError> {
            self.operator_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.operators.read().clone())
        }

        async fn fetch_keys(
            &self,
            operator_index: u32,
            from: u64,
            to: u64,
            _block_hash: B256,
        ) -> Result<Vec<Key>, IndexerError> {
            self.key_fetches.fetch_add(1, Ordering::SeqCst);
            self.key_ranges.write().push((operator_index, from, to));
            if self.fail_key_fetches.load(Ordering::SeqCst) {
                return Err(IndexerError::ChainUnavailable("injected".to_string()));
            }
            if to <= from {
                return Ok(vec![]);
            }
            Ok(self
                .keys
                .read()
                .get(&operator_index)
                .map(|keys| {
                    keys.iter()
                        .filter(|key| (key.index as u64) >= from && (key.index as u64) < to)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn block(number: u64, hash_byte: u8, timestamp: u64) -> BlockInfo {
        BlockInfo {
            number,
            hash: B256::repeat_byte(hash_byte),
            timestamp,
        }
    }

    fn operator(index: u32, total: u64, used: u64) -> Operator {
        Operator {
            module_address: MODULE,
            index,
            active: true,
            name: format!("operator {}", index),
            reward_address: Address::repeat_byte(0x22),
            staking_limit: 10,
            stopped_validators: 0,
            total_signing_keys: total,
            used_signing_keys: used,
        }
    }

    fn key(operator_index: u32, index: u32, used: bool, seed: u8) -> Key {
        Key {
            module_address: MODULE,
            operator_index,
            index,
            key: SigningPubkey::repeat_byte(seed),
            deposit_signature: DepositSignature::repeat_byte(seed),
            used,
        }
    }

    fn new_reconciler(
        kind: MirrorKind,
        chain: Arc<MockChain>,
    ) -> (TempDir, RegistryDatabase, Reconciler<Arc<MockChain>>) {
        let dir = TempDir::new().unwrap();
        let db = RegistryDatabase::open_or_create(&dir.path().join("registry.sqlite")).unwrap();
        let logger = Logger::root(slog::Discard, slog::o!());
        let reconciler = Reconciler::new(logger, chain, db.clone(), MODULE, kind);
        (dir, db, reconciler)
    }

    fn all_keys(db: &RegistryDatabase) -> Vec<Key> {
        db.with_transaction(|tx| db.find_all_keys(tx, &MODULE)).unwrap()
    }

    fn stored_meta(db: &RegistryDatabase) -> Option<Meta> {
        db.with_transaction(|tx| db.get_meta(tx, &MODULE)).unwrap()
    }

    /// Seed the mock with the bootstrap fixture: one operator with three
    /// keys, the first of them used.
    fn bootstrap_chain() -> Arc<MockChain> {
        let chain = MockChain::new(block(100, 0xaa, 1700), 7);
        *chain.operators.write() = vec![operator(0, 3, 1)];
        chain
            .keys
            .write()
            .insert(0, vec![key(0, 0, true, 1), key(0, 1, false, 2), key(0, 2, false, 3)]);
        chain
    }

    #[tokio::test]
    async fn bootstrap_fills_an_empty_store() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());

        let meta = reconciler
            .update(BlockRef::Number(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.block_number, 100);
        assert_eq!(meta.block_hash, B256::repeat_byte(0xaa));
        assert_eq!(meta.timestamp, 1700);
        assert_eq!(meta.keys_op_index, 7);

        assert_eq!(stored_meta(&db), Some(meta));
        let operators = db
            .with_transaction(|tx| db.find_all_operators(tx, &MODULE))
            .unwrap();
        assert_eq!(operators, vec![operator(0, 3, 1)]);

        let keys = all_keys(&db);
        assert_eq!(keys.len(), 3);
        let used: Vec<bool> = keys.iter().map(|key| key.used).collect();
        assert_eq!(used, vec![true, false, false]);
        assert_eq!(chain.key_ranges.read().as_slice(), &[(0, 0, 3)]);
    }

    #[tokio::test]
    async fn repeated_update_takes_the_fast_path() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());

        reconciler.update(BlockRef::Number(100)).await.unwrap();
        let before = all_keys(&db);
        chain.reset_counters();

        let meta = reconciler
            .update(BlockRef::Number(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chain.operator_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(chain.key_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(stored_meta(&db), Some(meta));
        assert_eq!(all_keys(&db), before);
    }

    #[tokio::test]
    async fn appended_key_is_fetched_without_touching_the_prefix() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();

        chain.set_state(block(101, 0xab, 1712), 8);
        *chain.operators.write() = vec![operator(0, 4, 1)];
        chain.keys.write().get_mut(&0).unwrap().push(key(0, 3, false, 4));
        chain.reset_counters();

        reconciler.update(BlockRef::Finalized).await.unwrap();

        // only the mutable tail is refetched
        assert_eq!(chain.key_ranges.read().as_slice(), &[(0, 1, 4)]);
        let keys = all_keys(&db);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], key(0, 0, true, 1));
    }

    #[tokio::test]
    async fn used_count_bump_refetches_from_zero() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();

        chain.set_state(block(101, 0xab, 1712), 8);
        *chain.operators.write() = vec![operator(0, 4, 1)];
        chain.keys.write().get_mut(&0).unwrap().push(key(0, 3, false, 4));
        reconciler.update(BlockRef::Finalized).await.unwrap();

        chain.set_state(block(102, 0xac, 1724), 9);
        *chain.operators.write() = vec![operator(0, 4, 2)];
        chain.keys.write().get_mut(&0).unwrap()[1].used = true;
        chain.reset_counters();

        reconciler.update(BlockRef::Finalized).await.unwrap();

        assert_eq!(chain.key_ranges.read().as_slice(), &[(0, 0, 4)]);
        let keys = all_keys(&db);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], key(0, 0, true, 1));
        assert!(keys[1].used);
    }

    #[tokio::test]
    async fn validator_mirror_tracks_used_keys_only() {
        let chain = MockChain::new(block(100, 0xaa, 1700), 8);
        *chain.operators.write() = vec![operator(0, 4, 1)];
        chain.keys.write().insert(
            0,
            vec![
                key(0, 0, true, 1),
                key(0, 1, false, 2),
                key(0, 2, false, 3),
                key(0, 3, false, 4),
            ],
        );
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Validator, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();
        assert_eq!(chain.key_ranges.read().as_slice(), &[(0, 0, 1)]);
        assert_eq!(all_keys(&db).len(), 1);

        chain.set_state(block(101, 0xab, 1712), 9);
        *chain.operators.write() = vec![operator(0, 4, 2)];
        chain.keys.write().get_mut(&0).unwrap()[1].used = true;
        chain.reset_counters();

        reconciler.update(BlockRef::Finalized).await.unwrap();
        assert_eq!(chain.key_ranges.read().as_slice(), &[(0, 0, 2)]);
        let keys = all_keys(&db);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|key| key.used));
    }

    #[tokio::test]
    async fn shrunken_total_deletes_the_tail() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();

        chain.set_state(block(101, 0xab, 1712), 8);
        *chain.operators.write() = vec![operator(0, 4, 1)];
        chain.keys.write().get_mut(&0).unwrap().push(key(0, 3, false, 4));
        reconciler.update(BlockRef::Finalized).await.unwrap();
        assert_eq!(all_keys(&db).len(), 4);

        chain.set_state(block(102, 0xac, 1724), 10);
        *chain.operators.write() = vec![operator(0, 2, 1)];
        chain.keys.write().get_mut(&0).unwrap().truncate(2);
        chain.reset_counters();

        reconciler.update(BlockRef::Finalized).await.unwrap();

        assert_eq!(chain.key_ranges.read().as_slice(), &[(0, 0, 2)]);
        let keys = all_keys(&db);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|key| (key.index as u64) < 2));
    }

    #[tokio::test]
    async fn older_block_is_skipped_without_mutation() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();
        chain.reset_counters();

        chain.set_state(block(90, 0x99, 1500), 7);
        let result = reconciler.update(BlockRef::Finalized).await.unwrap();
        assert!(result.is_none());

        assert_eq!(stored_meta(&db).unwrap().block_number, 100);
        assert_eq!(chain.operator_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(chain.key_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn meta_block_number_tracks_the_latest_input() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());

        for (number, hash_byte, keys_op_index) in [(100, 0xaa, 7), (101, 0xab, 7), (102, 0xac, 8)] {
            chain.set_state(block(number, hash_byte, 1700 + number), keys_op_index);
            reconciler.update(BlockRef::Finalized).await.unwrap();
            assert_eq!(stored_meta(&db).unwrap().block_number, number);
        }
    }

    #[tokio::test]
    async fn fresh_operator_inserts_exactly_its_keys() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();

        chain.set_state(block(101, 0xab, 1712), 8);
        chain.operators.write().push(operator(1, 5, 0));
        chain.keys.write().insert(
            1,
            (0..5).map(|i| key(1, i, false, 0x50 + i as u8)).collect(),
        );
        chain.reset_counters();

        reconciler.update(BlockRef::Finalized).await.unwrap();

        let ranges = chain.key_ranges.read().clone();
        assert!(ranges.contains(&(1, 0, 5)));
        let keys = all_keys(&db);
        assert_eq!(keys.len(), 8);
        assert_eq!(
            keys.iter().filter(|key| key.operator_index == 1).count(),
            5
        );
        // the existing operator's rows are untouched
        assert_eq!(keys[0], key(0, 0, true, 1));
    }

    #[tokio::test]
    async fn aborted_key_phase_converges_on_the_next_cycle() {
        let chain = bootstrap_chain();
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());
        reconciler.update(BlockRef::Finalized).await.unwrap();

        // the chain adds a key to operator 0 and a brand-new operator 1
        chain.set_state(block(101, 0xab, 1712), 8);
        *chain.operators.write() = vec![operator(0, 4, 1), operator(1, 2, 2)];
        chain.keys.write().get_mut(&0).unwrap().push(key(0, 3, false, 4));
        chain
            .keys
            .write()
            .insert(1, vec![key(1, 0, true, 5), key(1, 1, true, 6)]);

        // the key phase dies after the operator/meta commit
        chain.fail_key_fetches.store(true, Ordering::SeqCst);
        let err = reconciler.update(BlockRef::Finalized).await.unwrap_err();
        assert_eq!(err, IndexerError::ChainUnavailable("injected".to_string()));
        assert_eq!(stored_meta(&db).unwrap().block_number, 101);
        assert_eq!(all_keys(&db).len(), 3);

        // next head: same contract payload, fresh block
        chain.fail_key_fetches.store(false, Ordering::SeqCst);
        chain.set_state(block(102, 0xac, 1724), 8);
        reconciler.update(BlockRef::Finalized).await.unwrap();

        let keys = all_keys(&db);
        let mut expected: Vec<Key> = chain.keys.read().values().flatten().cloned().collect();
        expected.sort_by_key(|key| (key.operator_index, key.index));
        assert_eq!(keys, expected);
        assert_eq!(keys.len(), 6);
    }

    #[tokio::test]
    async fn zero_key_operator_skips_the_fetch() {
        let chain = MockChain::new(block(100, 0xaa, 1700), 1);
        *chain.operators.write() = vec![operator(0, 0, 0)];
        let (_dir, db, reconciler) = new_reconciler(MirrorKind::Key, chain.clone());

        reconciler.update(BlockRef::Finalized).await.unwrap();
        assert_eq!(chain.key_fetches.load(Ordering::SeqCst), 0);
        assert!(all_keys(&db).is_empty());
        assert_eq!(
            db.with_transaction(|tx| db.find_all_operators(tx, &MODULE))
                .unwrap()
                .len(),
            1
        );
    }
}
