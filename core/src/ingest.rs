//! Top-level `update_blocks`: validate, persist, rewire the identifier
//! table (spec §4.5).

use tracing::{debug, warn};

use crate::block::Block;
use crate::codec::Id;
use crate::error::CoreError;
use crate::identifier;
use crate::metrics::IngestMetrics;
use crate::signed_object::{SignedObject, Verified};
use crate::store::Store;

/// Validates and persists each block in iteration order, tracking the
/// deepest newly-accepted leaf, then moves the head at most once at the
/// end if that leaf is strictly deeper than the chain's previous
/// `max_depth` (spec §4.5, §5 "ordering guarantees").
///
/// Ingest of the batch stops at the first failing block but preserves
/// every earlier successful insertion (spec §7, propagation policy).
/// `metrics`, when given, gets its `head_switches` counter incremented on
/// every head move.
pub fn update_blocks<I: IntoIterator<Item = Block>>(
    store: &mut Store,
    blocks: I,
    metrics: Option<&IngestMetrics>,
) -> Result<(), CoreError> {
    let starting_max_depth = store.tree().max_depth();
    let mut new_max_depth = starting_max_depth;
    let mut new_head: Option<Id> = None;

    for block in blocks {
        let block_id = put_block(store, block)?;
        let depth = store.tree().get(&block_id)?.depth;
        if depth > new_max_depth {
            new_max_depth = depth;
            new_head = Some(block_id);
        }
    }

    if let Some(head) = new_head {
        if new_max_depth > starting_max_depth {
            debug!(?head, new_max_depth, "head switch triggered by update_blocks");
            identifier::set_head(store, head)?;
            if let Some(metrics) = metrics {
                metrics.head_switches.inc();
            }
        }
    }
    Ok(())
}

/// Verifies and persists one block and its operations: signature and
/// self-contained semantics first, then store-dependent chain checks,
/// then the tree/store mutation itself (spec §4.4, "On put"). The block
/// and its operations stay wrapped in `Verified<_>` all the way to the
/// `Store` calls, so the store's persistence API can require proof of
/// verification rather than trust the caller (spec §9).
pub fn put_block(store: &mut Store, block: Block) -> Result<Id, CoreError> {
    let mut verified_block = Verified::verify(block).map_err(|e| {
        warn!(error = %e, "block rejected during signature/semantic verification");
        e
    })?;

    verified_block.get_mut().verify_chain(store)?;
    verified_block.get().put_verify(store)?;
    for op in &verified_block.get().operations {
        op.put_verify(store)?;
    }

    let block_id = verified_block.get().id()?;
    let previous_id = verified_block.get().previous_block_rev.id();
    store.tree_mut().add_block(block_id, previous_id)?;
    store.put_block(&verified_block)?;

    // `Block::verify_semantics` (run inside `Verified::verify` above)
    // already checked the signature and semantics of every operation it
    // contains, so re-wrapping them here via `assume_verified` recognizes
    // work already done rather than skipping it.
    let operations = std::mem::take(&mut verified_block.get_mut().operations);
    for mut op in operations {
        op.containing_blocks.insert(block_id);
        store.upsert_operation(&Verified::assume_verified(op))?;
    }

    debug!(id = ?block_id, depth = store.tree().get(&block_id)?.depth, "block ingested");
    Ok(block_id)
}

/// Removes a previously-ingested block: if it is currently head, rewires
/// the identifier table to what head would become first (while the block
/// is still linked into the tree, so its ancestry is walkable), then
/// unwinds the tree link (which refuses if the block still has children),
/// then releases each operation's reference, deleting operations that
/// become unreferenced (spec §4.3/§4.4, "remove").
pub fn remove_block(store: &mut Store, block_id: Id) -> Result<(), CoreError> {
    let block = store.get_block(&block_id)?;
    block.remove_verify(store)?;

    if store.tree().head() == block_id {
        let new_head = store.tree().head_excluding(block_id);
        identifier::set_head(store, new_head)?;
    }

    store.tree_mut().remove_block(block_id)?;
    store.delete_block(&block_id)?;

    for op_id in &block.operation_ids {
        let mut op = store.get_operation(op_id)?;
        op.containing_blocks.remove(&block_id);
        if op.containing_blocks.is_empty() {
            store.delete_operation(op_id)?;
        } else {
            // `op` was fetched straight from the store, so it was already
            // verified when first persisted; `assume_verified` re-wraps
            // it for the upsert rather than re-checking it.
            store.upsert_operation(&Verified::assume_verified(op))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::User;
    use crate::operation::Operation;
    use crate::revision::Revision;
    use uuid::Uuid;

    fn mint(user: &User, uuid: Uuid, address: &str) -> Operation {
        let mut op = Operation::new(Revision::sentinel(), uuid, address.to_string(), vec![user.public_key().clone()]);
        op.sign(user).unwrap();
        op
    }

    fn mined_block(previous: Revision<Block>, ts: u32, ops: Vec<Operation>, miner: &User) -> Block {
        let mut block = Block::new(previous, ts, 5, ops, 1).unwrap();
        block.mine().unwrap();
        block.sign(miner).unwrap();
        block
    }

    #[test]
    fn scenario_s1_minting() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid_1 = Uuid::new_v4();
        let uuid_2 = Uuid::new_v4();

        let op_1 = mint(&owner, uuid_1, "http://example.com/");
        let op_1_id = op_1.id().unwrap();
        let op_2 = mint(&owner, uuid_2, "http://example.com/");
        let op_2_id = op_2.id().unwrap();

        let b0 = mined_block(Revision::sentinel(), 42, vec![op_1, op_2], &miner);
        let b0_id = b0.id().unwrap();

        update_blocks(&mut store, vec![b0], None).unwrap();

        assert_eq!(store.get_identifier(&uuid_1).unwrap(), op_1_id);
        assert_eq!(store.get_identifier(&uuid_2).unwrap(), op_2_id);
        assert_eq!(store.tree().head(), b0_id);
        assert_eq!(store.tree().max_depth(), 1);
    }

    #[test]
    fn scenario_s2_second_block_extends_head() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid_1 = Uuid::new_v4();
        let uuid_2 = Uuid::new_v4();

        let op_1 = mint(&owner, uuid_1, "http://example.com/");
        let op_1_id = op_1.id().unwrap();
        let op_2 = mint(&owner, uuid_2, "http://example.com/");

        let b0 = mined_block(Revision::sentinel(), 42, vec![op_1, op_2], &miner);
        let b0_id = b0.id().unwrap();
        update_blocks(&mut store, vec![b0], None).unwrap();

        let mut op_3 = Operation::new(
            Revision::from_id(op_1_id),
            uuid_1,
            "http://example.com/v2/".into(),
            vec![owner.public_key().clone()],
        );
        op_3.sign(&owner).unwrap();
        let op_3_id = op_3.id().unwrap();
        let op_4 = mint(&owner, Uuid::new_v4(), "http://example.com/");

        let b1 = mined_block(Revision::from_id(b0_id), 52, vec![op_3, op_4], &miner);
        let b1_id = b1.id().unwrap();
        update_blocks(&mut store, vec![b1], None).unwrap();

        assert_eq!(store.get_identifier(&uuid_1).unwrap(), op_3_id);
        assert_eq!(store.tree().head(), b1_id);
        assert_eq!(store.tree().max_depth(), 2);
    }

    #[test]
    fn scenario_s3_fork_and_winner() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid_1 = Uuid::new_v4();

        let op_1 = mint(&owner, uuid_1, "v0");
        let op_1_id = op_1.id().unwrap();
        let op_pad_1 = mint(&owner, Uuid::new_v4(), "pad");
        let b0 = mined_block(Revision::sentinel(), 1, vec![op_1, op_pad_1], &miner);
        let b0_id = b0.id().unwrap();
        update_blocks(&mut store, vec![b0], None).unwrap();

        let mut op_2 = Operation::new(Revision::from_id(op_1_id), uuid_1, "v1".into(), vec![owner.public_key().clone()]);
        op_2.sign(&owner).unwrap();
        let op_2_id = op_2.id().unwrap();
        let op_pad_2 = mint(&owner, Uuid::new_v4(), "pad");
        let b1 = mined_block(Revision::from_id(b0_id), 2, vec![op_2, op_pad_2], &miner);
        let b1_id = b1.id().unwrap();
        update_blocks(&mut store, vec![b1], None).unwrap();

        let mut op_3 = Operation::new(Revision::from_id(op_2_id), uuid_1, "v2".into(), vec![owner.public_key().clone()]);
        op_3.sign(&owner).unwrap();
        let op_3_id = op_3.id().unwrap();
        let op_pad_3 = mint(&owner, Uuid::new_v4(), "pad");
        let b2 = mined_block(Revision::from_id(b1_id), 3, vec![op_3, op_pad_3], &miner);
        let b2_id = b2.id().unwrap();
        update_blocks(&mut store, vec![b2], None).unwrap();

        assert_eq!(store.tree().max_depth(), 3);
        assert_eq!(store.tree().head(), b2_id);

        // Sibling fork at the same depth: head must not move.
        let mut op_3_prime =
            Operation::new(Revision::from_id(op_2_id), uuid_1, "v2-prime".into(), vec![owner.public_key().clone()]);
        op_3_prime.sign(&owner).unwrap();
        let op_3_prime_id = op_3_prime.id().unwrap();
        let op_pad_3b = mint(&owner, Uuid::new_v4(), "pad");
        let b2_prime = mined_block(Revision::from_id(b1_id), 3, vec![op_3_prime, op_pad_3b], &miner);
        let b2_prime_id = b2_prime.id().unwrap();
        update_blocks(&mut store, vec![b2_prime], None).unwrap();

        assert_eq!(store.tree().max_depth(), 3);
        assert_eq!(store.tree().head(), b2_id, "tie should keep the first-seen leaf as head");

        // Extending the sibling branch makes it strictly deeper: head moves.
        let mut op_4 =
            Operation::new(Revision::from_id(op_3_prime_id), uuid_1, "v3".into(), vec![owner.public_key().clone()]);
        op_4.sign(&owner).unwrap();
        let op_4_id = op_4.id().unwrap();
        let op_pad_4 = mint(&owner, Uuid::new_v4(), "pad");
        let b3 = mined_block(Revision::from_id(b2_prime_id), 4, vec![op_4, op_pad_4], &miner);
        let b3_id = b3.id().unwrap();
        update_blocks(&mut store, vec![b3], None).unwrap();

        assert_eq!(store.tree().head(), b3_id);
        assert_eq!(store.tree().max_depth(), 4);
        assert_eq!(store.get_identifier(&uuid_1).unwrap(), op_4_id, "identifier should follow b0->b1->b2_prime->b3");
    }

    #[test]
    fn scenario_s4_ownership_transfer() {
        let mut store = Store::open_memory().unwrap();
        let owner_a = User::generate();
        let owner_b = User::generate();
        let miner = User::generate();
        let uuid = Uuid::new_v4();

        let mut op = Operation::new(Revision::sentinel(), uuid, "a".into(), vec![owner_a.public_key().clone()]);
        op.sign(&owner_a).unwrap();
        let op_id = op.id().unwrap();
        let op_pad = mint(&owner_a, Uuid::new_v4(), "pad");
        let b0 = mined_block(Revision::sentinel(), 1, vec![op, op_pad], &miner);
        update_blocks(&mut store, vec![b0], None).unwrap();

        let mut wrong_transfer =
            Operation::new(Revision::from_id(op_id), uuid, "b".into(), vec![owner_b.public_key().clone()]);
        wrong_transfer.sign(&owner_b).unwrap();
        assert!(matches!(wrong_transfer.verify_chain(&store), Err(CoreError::Ownership(_))));

        let mut right_transfer =
            Operation::new(Revision::from_id(op_id), uuid, "b".into(), vec![owner_b.public_key().clone()]);
        right_transfer.sign(&owner_a).unwrap();
        assert!(right_transfer.verify_chain(&store).is_ok());
    }

    #[test]
    fn scenario_s5_in_block_fork_rejected_by_put() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();

        let root = mint(&owner, Uuid::new_v4(), "root");
        let root_id = root.id().unwrap();
        let mut child_a = Operation::new(Revision::from_id(root_id), root.uuid, "a".into(), vec![owner.public_key().clone()]);
        child_a.sign(&owner).unwrap();
        let mut child_b = Operation::new(Revision::from_id(root_id), root.uuid, "b".into(), vec![owner.public_key().clone()]);
        child_b.sign(&owner).unwrap();

        let b0 = mined_block(Revision::sentinel(), 1, vec![root, child_a, child_b], &miner);
        assert!(matches!(
            update_blocks(&mut store, vec![b0], None),
            Err(CoreError::Chain(crate::error::ChainKind::InBlockFork, _))
        ));
    }

    #[test]
    fn remove_block_restores_store_and_tree_to_prior_state() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid = Uuid::new_v4();

        let op = mint(&owner, uuid, "v0");
        let op_id = op.id().unwrap();
        let pad = mint(&owner, Uuid::new_v4(), "pad");
        let b0 = mined_block(Revision::sentinel(), 1, vec![op, pad], &miner);
        let b0_id = b0.id().unwrap();

        let head_before = store.tree().head();
        let max_depth_before = store.tree().max_depth();

        update_blocks(&mut store, vec![b0], None).unwrap();
        assert!(store.has_block(&b0_id).unwrap());
        assert!(store.has_operation(&op_id).unwrap());
        assert!(store.has_identifier(&uuid).unwrap());
        assert_eq!(store.tree().head(), b0_id);

        remove_block(&mut store, b0_id).unwrap();

        assert_eq!(store.tree().head(), head_before);
        assert_eq!(store.tree().max_depth(), max_depth_before);
        assert!(!store.has_block(&b0_id).unwrap());
        assert!(!store.has_operation(&op_id).unwrap());
        assert!(!store.has_identifier(&uuid).unwrap());
    }

    #[test]
    fn head_switch_via_update_blocks_increments_head_switches_metric() {
        use crate::metrics::IngestMetrics;
        use prometheus::Registry;

        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let registry = Registry::new();
        let metrics = IngestMetrics::register(&registry).unwrap();

        let op = mint(&owner, Uuid::new_v4(), "v0");
        let b0 = mined_block(Revision::sentinel(), 1, vec![op], &miner);
        update_blocks(&mut store, vec![b0], Some(&metrics)).unwrap();

        assert_eq!(metrics.head_switches.get(), 1);
    }

    #[test]
    fn scenario_s6_genesis_uniqueness() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();

        let ops_a = vec![mint(&owner, Uuid::new_v4(), "a"), mint(&owner, Uuid::new_v4(), "b")];
        let b0 = mined_block(Revision::sentinel(), 1, ops_a, &miner);
        update_blocks(&mut store, vec![b0], None).unwrap();

        let ops_b = vec![mint(&owner, Uuid::new_v4(), "c"), mint(&owner, Uuid::new_v4(), "d")];
        let b0_rival = mined_block(Revision::sentinel(), 2, ops_b, &miner);
        assert!(matches!(
            update_blocks(&mut store, vec![b0_rival], None),
            Err(CoreError::Chain(crate::error::ChainKind::GenesisBlockDuplication, _))
        ));
    }
}
