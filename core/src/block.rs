//! Batched operations, proof-of-work, miner signature, operation-tree
//! check (spec §4.4).

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::codec::{double_sha256, Id, Reader, Writer, HASH_LEN};
use crate::error::{ChainKind, CoreError};
use crate::keys::{PublicKey, Signature};
use crate::operation::Operation;
use crate::revision::Revision;
use crate::signed_object::SignedObject;
use crate::store::Store;

pub const VERSION: u32 = 1;
pub const MIN_OPERATIONS: u32 = 2;
pub const MAX_OPERATIONS: u32 = 10;

/// A batch of operations, proof-of-work mined and signed by its miner.
pub struct Block {
    pub previous_block_rev: Revision<Block>,
    pub timestamp: u32,
    pub operations_limit: u32,
    pub operation_ids: Vec<Id>,
    pub difficulty: u32,
    pub padding: u32,
    pub checksum: Option<[u8; HASH_LEN]>,
    public_key: Option<PublicKey>,
    signature: Option<Signature>,
    /// Resolved operations, in the same order as `operation_ids`, when
    /// available (constructed locally, or decoded via
    /// `from_raw_with_operations`).
    pub operations: Vec<Operation>,
}

impl Block {
    /// Builds an unmined block from already-signed operations.
    pub fn new(
        previous_block_rev: Revision<Block>,
        timestamp: u32,
        operations_limit: u32,
        operations: Vec<Operation>,
        difficulty: u32,
    ) -> Result<Self, CoreError> {
        let mut operation_ids = Vec::with_capacity(operations.len());
        for op in &operations {
            operation_ids.push(op.id()?);
        }
        Ok(Block {
            previous_block_rev,
            timestamp,
            operations_limit,
            operation_ids,
            difficulty,
            padding: 0,
            checksum: None,
            public_key: None,
            signature: None,
            operations,
        })
    }

    fn unmined_raw_with_padding(&self, padding: u32) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(VERSION);
        w.write_fixed(&self.previous_block_rev.id());
        w.write_u32(self.timestamp);
        w.write_u32(self.operations_limit);
        w.write_u32(self.operation_ids.len() as u32);
        for id in &self.operation_ids {
            w.write_fixed(id);
        }
        w.write_u32(self.difficulty);
        w.write_u32(padding);
        w.into_bytes()
    }

    pub fn unmined_raw(&self) -> Vec<u8> {
        self.unmined_raw_with_padding(self.padding)
    }

    fn counted_checksum(&self) -> [u8; HASH_LEN] {
        double_sha256(&self.unmined_raw())
    }

    /// Mines by incrementing `padding` until `double_sha(unmined_raw) <
    /// 2^(256 - difficulty)`, then sets `checksum`.
    pub fn mine(&mut self) -> Result<(), CoreError> {
        if !(1..256).contains(&self.difficulty) {
            return Err(CoreError::Verify("difficulty out of range".into()));
        }
        let target = target_for_difficulty(self.difficulty as u8);
        self.padding = 0;
        loop {
            let digest = double_sha256(&self.unmined_raw_with_padding(self.padding));
            if meets_target(&digest, &target) {
                break;
            }
            self.padding += 1;
        }
        self.checksum = Some(self.counted_checksum());
        Ok(())
    }

    fn checksum_correct(&self) -> Result<(), CoreError> {
        let checksum = self
            .checksum
            .ok_or_else(|| CoreError::Verify("block is not mined".into()))?;
        if checksum != self.counted_checksum() {
            return Err(CoreError::Verify("wrong checksum".into()));
        }
        if !(1..256).contains(&self.difficulty) {
            return Err(CoreError::Verify("difficulty out of range".into()));
        }
        let target = target_for_difficulty(self.difficulty as u8);
        if !meets_target(&checksum, &target) {
            return Err(CoreError::Verify("checksum does not meet difficulty target".into()));
        }
        Ok(())
    }

    /// `uint32 M || M x sized_bytes operation_raw || <signed layout>`.
    pub fn raw_with_operations(&self) -> Result<Vec<u8>, CoreError> {
        let mut w = Writer::new();
        w.write_u32(self.operations.len() as u32);
        for op in &self.operations {
            w.write_sized(&op.raw()?);
        }
        w.write_fixed(&self.raw()?);
        Ok(w.into_bytes())
    }

    pub fn from_raw_with_operations(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut r = Reader::new(bytes);
        let m = r.read_u32()?;
        let mut operations = Vec::with_capacity(m as usize);
        for _ in 0..m {
            operations.push(Operation::from_raw(&r.read_sized()?)?);
        }
        let rest = &bytes[r.pos()..];
        let mut block = Block::from_raw(rest)?;
        block.operations = operations;
        Ok(block)
    }

    /// Decodes the signed layout (without the embedded operations).
    pub fn from_raw(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut r = Reader::new(bytes);
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(CoreError::RawFormat(format!("unsupported block version {version}")));
        }
        let prev_id: [u8; HASH_LEN] = r.read_fixed()?;
        let timestamp = r.read_u32()?;
        let operations_limit = r.read_u32()?;
        let n = r.read_u32()?;
        let mut operation_ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            operation_ids.push(r.read_fixed::<HASH_LEN>()?);
        }
        let difficulty = r.read_u32()?;
        let padding = r.read_u32()?;
        let checksum: [u8; HASH_LEN] = r.read_fixed()?;
        let signer_der = r.read_sized()?;
        let signature_bytes = r.read_sized()?;
        r.finish()?;

        Ok(Block {
            previous_block_rev: Revision::from_id(prev_id),
            timestamp,
            operations_limit,
            operation_ids,
            difficulty,
            padding,
            checksum: Some(checksum),
            public_key: Some(PublicKey::from_der(signer_der)),
            signature: Some(Signature::from_bytes(signature_bytes)),
            operations: Vec::new(),
        })
    }

    /// Store-dependent rules: predecessor resolution, per-operation chain
    /// verification against the store.
    pub fn verify_chain(&mut self, store: &Store) -> Result<(), CoreError> {
        if !self.previous_block_rev.is_sentinel() {
            self.previous_block_rev
                .resolve_with(|id| store.get_block(&id))?
                .ok_or_else(|| CoreError::chain(ChainKind::MissingPredecessor, "previous_block_rev does not exist"))?;
        }
        for op in &mut self.operations {
            op.verify_chain(store)?;
        }
        Ok(())
    }

    /// `put_verify`: a minting block may be the only child of the sentinel.
    pub fn put_verify(&self, store: &Store) -> Result<(), CoreError> {
        if self.previous_block_rev.is_sentinel() && store.tree().has_any_children(&crate::codec::SENTINEL) {
            return Err(CoreError::chain(ChainKind::GenesisBlockDuplication, "sentinel already has a child block"));
        }
        Ok(())
    }

    /// `remove_verify`: block has no children in the tree.
    pub fn remove_verify(&self, store: &Store) -> Result<(), CoreError> {
        let id = self.id()?;
        if store.tree().has_any_children(&id) {
            return Err(CoreError::chain(ChainKind::OperationBlocked, "block has following blocks"));
        }
        Ok(())
    }
}

/// Computes `2^(256-difficulty) - 1` as a 32-byte big-endian value: the top
/// `difficulty` bits are zero, the rest are one.
fn target_for_difficulty(difficulty: u8) -> [u8; HASH_LEN] {
    let mut target = [0xFFu8; HASH_LEN];
    let zero_bits = difficulty as usize;
    let full_bytes = zero_bits / 8;
    let remaining_bits = zero_bits % 8;
    for b in target.iter_mut().take(full_bytes) {
        *b = 0;
    }
    if remaining_bits > 0 && full_bytes < HASH_LEN {
        target[full_bytes] = 0xFFu8 >> remaining_bits;
    }
    target
}

fn meets_target(hash: &[u8; HASH_LEN], target: &[u8; HASH_LEN]) -> bool {
    hash.cmp(target) != Ordering::Greater
}

impl SignedObject for Block {
    fn unsigned_raw(&self) -> Result<Vec<u8>, CoreError> {
        self.checksum_correct()?;
        let mut w = Writer::new();
        w.write_fixed(&self.unmined_raw());
        w.write_fixed(&self.checksum.unwrap());
        Ok(w.into_bytes())
    }

    fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    fn set_signature(&mut self, public_key: PublicKey, signature: Signature) {
        self.public_key = Some(public_key);
        self.signature = Some(signature);
    }

    fn verify_semantics(&self) -> Result<(), CoreError> {
        self.checksum_correct()?;
        if !(MIN_OPERATIONS..=MAX_OPERATIONS).contains(&self.operations_limit) {
            return Err(CoreError::Verify("operations_limit out of bounds".into()));
        }
        let n = self.operation_ids.len() as u32;
        if n < MIN_OPERATIONS || n > self.operations_limit {
            return Err(CoreError::Verify("operation count out of bounds".into()));
        }

        // Only predecessor ids that are themselves operations in this block
        // count toward the fork check: two independent mintings (both
        // pointing at the sentinel) or two ops extending the same
        // already-persisted predecessor are not an in-block tree.
        let in_block_ids: std::collections::HashSet<Id> = self.operation_ids.iter().copied().collect();
        let mut predecessor_counts: HashMap<Id, u32> = HashMap::new();
        for op in &self.operations {
            let pred = op.previous_operation_rev.id();
            if in_block_ids.contains(&pred) {
                *predecessor_counts.entry(pred).or_insert(0) += 1;
            }
        }
        if predecessor_counts.values().any(|&count| count > 1) {
            return Err(CoreError::chain(ChainKind::InBlockFork, "operations are creating tree inside the block"));
        }

        for op in &self.operations {
            op.verify_signature()?;
            op.verify_semantics()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::User;
    use uuid::Uuid;

    fn minted_operations(user: &User, n: usize) -> Vec<Operation> {
        (0..n)
            .map(|_| {
                let mut op = Operation::new(
                    Revision::sentinel(),
                    Uuid::new_v4(),
                    "http://example.com/".into(),
                    vec![user.public_key().clone()],
                );
                op.sign(user).unwrap();
                op
            })
            .collect()
    }

    #[test]
    fn mined_block_meets_difficulty_target() {
        let user = User::generate();
        let miner = User::generate();
        let ops = minted_operations(&user, 2);
        let mut block = Block::new(Revision::sentinel(), 42, 5, ops, 1).unwrap();
        block.mine().unwrap();
        block.sign(&miner).unwrap();
        assert!(block.verify_semantics().is_ok());
    }

    #[test]
    fn block_with_too_few_operations_fails() {
        let user = User::generate();
        let miner = User::generate();
        let ops = minted_operations(&user, 1);
        let mut block = Block::new(Revision::sentinel(), 1, 5, ops, 1).unwrap();
        block.mine().unwrap();
        block.sign(&miner).unwrap();
        assert!(matches!(block.verify_semantics(), Err(CoreError::Verify(_))));
    }

    #[test]
    fn out_of_range_difficulty_does_not_wrap_into_a_trivial_target() {
        // A forged difficulty of 256 would wrap to 0 under a bare `as u8`
        // cast, making any checksum satisfy the target. Build a block whose
        // checksum is honestly consistent with difficulty=256 (no mining
        // needed, since the wrapped target would accept anything) and
        // confirm verification rejects it outright instead of silently
        // truncating the field.
        let user = User::generate();
        let miner = User::generate();
        let ops = minted_operations(&user, 2);
        let mut block = Block::new(Revision::sentinel(), 1, 5, ops, 256).unwrap();
        block.checksum = Some(block.counted_checksum());
        block.sign(&miner).unwrap();
        assert!(matches!(block.verify_semantics(), Err(CoreError::Verify(_))));
    }

    #[test]
    fn two_independent_mintings_in_one_block_are_not_a_fork() {
        // Both share the sentinel as previous_operation_rev, but the
        // sentinel is not itself an operation present in this block, so
        // this is not an in-block tree (S1's scenario).
        let user = User::generate();
        let miner = User::generate();
        let ops = minted_operations(&user, 2);
        let mut block = Block::new(Revision::sentinel(), 1, 5, ops, 1).unwrap();
        block.mine().unwrap();
        block.sign(&miner).unwrap();
        assert!(block.verify_semantics().is_ok());
    }

    #[test]
    fn two_children_of_the_same_in_block_parent_are_rejected() {
        let user = User::generate();
        let miner = User::generate();
        let mut root = Operation::new(Revision::sentinel(), Uuid::new_v4(), "root".into(), vec![user.public_key().clone()]);
        root.sign(&user).unwrap();
        let root_id = root.id().unwrap();

        let mut child_a =
            Operation::new(Revision::from_id(root_id), root.uuid, "a".into(), vec![user.public_key().clone()]);
        child_a.sign(&user).unwrap();
        let mut child_b =
            Operation::new(Revision::from_id(root_id), root.uuid, "b".into(), vec![user.public_key().clone()]);
        child_b.sign(&user).unwrap();

        let mut block = Block::new(Revision::sentinel(), 1, 5, vec![root, child_a, child_b], 1).unwrap();
        block.mine().unwrap();
        block.sign(&miner).unwrap();
        assert!(matches!(
            block.verify_semantics(),
            Err(CoreError::Chain(ChainKind::InBlockFork, _))
        ));
    }

    #[test]
    fn raw_with_operations_round_trips() {
        let user = User::generate();
        let miner = User::generate();
        let ops = minted_operations(&user, 2);
        let mut block = Block::new(Revision::sentinel(), 7, 5, ops, 1).unwrap();
        block.mine().unwrap();
        block.sign(&miner).unwrap();

        let wire = block.raw_with_operations().unwrap();
        let decoded = Block::from_raw_with_operations(&wire).unwrap();
        assert_eq!(decoded.operation_ids, block.operation_ids);
        assert_eq!(decoded.operations.len(), block.operations.len());
        assert!(decoded.verify_signature().is_ok());
    }
}
