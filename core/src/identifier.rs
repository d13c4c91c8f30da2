//! UUID -> latest-operation mapping, and the rewind/replay procedure that
//! keeps it in sync across a head switch (spec §4.6).

use std::collections::{HashMap, HashSet};

use crate::codec::{Id, SENTINEL};
use crate::error::CoreError;
use crate::store::Store;

/// Atomically rebases the identifier table from the current head to
/// `new_head` via their lowest common ancestor: rewind every uuid back to
/// the last operation still reachable on the shared trunk, then replay the
/// new branch's operations in root-to-leaf order.
pub fn set_head(store: &mut Store, new_head: Id) -> Result<(), CoreError> {
    let old_head = store.tree().head();
    if old_head == new_head {
        return Ok(());
    }

    let lca = store.tree().lowest_common_ancestor(old_head, new_head)?;

    let old_chain = store.tree().backward_blocks_chain(old_head, lca)?;
    let old_blocks: HashSet<Id> = old_chain.into_iter().filter(|b| *b != lca).collect();

    let mut new_chain = store.tree().backward_blocks_chain(new_head, lca)?;
    new_chain.retain(|b| *b != lca);
    new_chain.reverse(); // root-to-leaf

    // Compute the full rewind+replay plan against the still-unmodified
    // store before writing anything: a failure here leaves the old head's
    // identifier table untouched, per the rollback requirement (spec §7).
    let mut plan = rewind_plan(store, &old_blocks)?;
    replay_plan(store, &new_chain, &mut plan)?;

    for (uuid, target) in plan {
        match target {
            Some(op_id) => store.put_identifier(&uuid, op_id)?,
            None => {
                if store.has_identifier(&uuid)? {
                    store.delete_identifier(&uuid)?;
                }
            }
        }
    }

    store.tree_mut().set_head(new_head);
    Ok(())
}

/// Computes, without mutating the store, the rewound target operation for
/// every known uuid (`None` meaning the identifier is rolled all the way
/// back to the sentinel and should be removed).
fn rewind_plan(store: &Store, old_blocks: &HashSet<Id>) -> Result<HashMap<uuid::Uuid, Option<Id>>, CoreError> {
    let mut plan = HashMap::new();
    for uuid in store.uuids()? {
        let current = store.get_identifier(&uuid)?;
        let target = rewind_target(store, old_blocks, current)?;
        plan.insert(uuid, if target == SENTINEL { None } else { Some(target) });
    }
    Ok(plan)
}

/// Walks `op_id` backward while every step is contained only in blocks on
/// the old (about to be abandoned) branch.
fn rewind_target(store: &Store, old_blocks: &HashSet<Id>, mut op_id: Id) -> Result<Id, CoreError> {
    loop {
        if op_id == SENTINEL {
            return Ok(SENTINEL);
        }
        let op = store.get_operation(&op_id)?;
        let only_on_old_branch = op.containing_blocks.iter().any(|b| old_blocks.contains(b));
        if only_on_old_branch {
            op_id = op.previous_operation_rev.id();
        } else {
            return Ok(op_id);
        }
    }
}

/// Extends `plan` forward over the new branch's blocks, root to leaf.
/// Reads the "current" mapping from `plan` where the rewind already staged
/// one, falling back to the (unmodified) store otherwise.
fn replay_plan(
    store: &Store,
    new_blocks_root_to_leaf: &[Id],
    plan: &mut HashMap<uuid::Uuid, Option<Id>>,
) -> Result<(), CoreError> {
    for block_id in new_blocks_root_to_leaf {
        let block = store.get_block(block_id)?;
        for op_id in &block.operation_ids {
            let op = store.get_operation(op_id)?;
            let current = match plan.get(&op.uuid) {
                Some(staged) => *staged,
                None => {
                    if store.has_identifier(&op.uuid)? {
                        Some(store.get_identifier(&op.uuid)?)
                    } else {
                        None
                    }
                }
            };
            match current {
                Some(current_id) => {
                    if current_id != op.previous_operation_rev.id() {
                        return Err(CoreError::Tree("inconsistency of operations".into()));
                    }
                    plan.insert(op.uuid, Some(*op_id));
                }
                None => {
                    if op.is_minting() {
                        plan.insert(op.uuid, Some(*op_id));
                    } else {
                        return Err(CoreError::Tree("multiple minting of the identifier".into()));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Returns the ordered list of operation ids that extend `operation_rev_id`
/// to become the latest revision reachable at `block_id`; used to audit a
/// non-head branch without switching the head (spec §4.6).
pub fn forward_operations_chain(store: &Store, operation_rev_id: Id, block_id: Id) -> Result<Vec<Id>, CoreError> {
    let tree = store.tree();
    let root_chain = tree.backward_blocks_chain(block_id, SENTINEL)?;
    let operation = store.get_operation(&operation_rev_id)?;

    let start_block_id = operation
        .containing_blocks
        .iter()
        .copied()
        .find(|b| root_chain.contains(b))
        .ok_or_else(|| {
            CoreError::Tree("operation_rev is not contained by any block being an ancestor of block_id".into())
        })?;

    let lca_id = tree.lowest_common_ancestor(tree.head(), block_id)?;
    let start_idx = root_chain.iter().position(|b| *b == start_block_id).unwrap();
    let lca_idx = root_chain.iter().position(|b| *b == lca_id).unwrap();

    let mut op_chain: Vec<Id> = Vec::new();

    if start_idx >= lca_idx {
        // operation_rev sits on the trunk shared by HEAD and block_id, at
        // or before the LCA: take HEAD's own extension of it and discard
        // whatever portion HEAD contributed only beyond the LCA.
        let head_identifier = store.get_identifier(&operation.uuid)?;
        let head_op = store.get_operation(&head_identifier)?;
        let ops = head_op.backward_operations_chain(store, operation_rev_id)?;

        let mut head_to_lca: HashSet<Id> = tree.backward_blocks_chain(tree.head(), lca_id)?.into_iter().collect();
        head_to_lca.remove(&lca_id);

        let mut skip = 0;
        while skip < ops.len() {
            let op = store.get_operation(&ops[skip])?;
            if op.containing_blocks.iter().any(|b| head_to_lca.contains(b)) {
                skip += 1;
            } else {
                break;
            }
        }
        op_chain = ops[skip..].iter().rev().copied().collect();
    }

    let mut forward_blocks: Vec<Id> = root_chain[..lca_idx].to_vec();
    forward_blocks.reverse(); // oldest (just after LCA) first, block_id last

    for b_id in forward_blocks {
        let block = store.get_block(&b_id)?;
        if op_chain.is_empty() && block.operation_ids.contains(&operation_rev_id) {
            op_chain.push(operation_rev_id);
        }
        if !op_chain.is_empty() {
            let mut op_dict: HashMap<Id, Id> = HashMap::new();
            for op_id in &block.operation_ids {
                let op = store.get_operation(op_id)?;
                op_dict.insert(op.previous_operation_rev.id(), *op_id);
            }
            while let Some(next) = op_dict.get(op_chain.last().unwrap()) {
                op_chain.push(*next);
            }
        }
    }

    Ok(op_chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::ingest::update_blocks;
    use crate::keys::User;
    use crate::operation::Operation;
    use crate::revision::Revision;
    use crate::signed_object::SignedObject;
    use crate::store::Store;
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
    fn head_switch_rewinds_and_replays_identifier_table() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid = Uuid::new_v4();

        let op0 = mint(&owner, uuid, "v0");
        let op0_id = op0.id().unwrap();
        let pad0 = mint(&owner, Uuid::new_v4(), "pad");
        let b0 = mined_block(Revision::sentinel(), 1, vec![op0, pad0], &miner);
        let b0_id = b0.id().unwrap();
        update_blocks(&mut store, vec![b0], None).unwrap();

        let mut op1 = Operation::new(Revision::from_id(op0_id), uuid, "v1".into(), vec![owner.public_key().clone()]);
        op1.sign(&owner).unwrap();
        let pad1 = mint(&owner, Uuid::new_v4(), "pad");
        let b1 = mined_block(Revision::from_id(b0_id), 2, vec![op1, pad1], &miner);
        let b1_id = b1.id().unwrap();
        update_blocks(&mut store, vec![b1], None).unwrap();
        assert_eq!(store.tree().head(), b1_id);

        let pad0b = mint(&owner, Uuid::new_v4(), "pad-rival");
        let mut op1_rival = Operation::new(Revision::from_id(op0_id), uuid, "v1-rival".into(), vec![owner.public_key().clone()]);
        op1_rival.sign(&owner).unwrap();
        let op1_rival_id = op1_rival.id().unwrap();
        let b1_rival = mined_block(Revision::from_id(b0_id), 2, vec![op1_rival, pad0b], &miner);
        let b1_rival_id = b1_rival.id().unwrap();
        update_blocks(&mut store, vec![b1_rival], None).unwrap();
        assert_eq!(store.tree().head(), b1_id, "tie must not move the head");

        set_head(&mut store, b1_rival_id).unwrap();
        assert_eq!(store.tree().head(), b1_rival_id);
        assert_eq!(store.get_identifier(&uuid).unwrap(), op1_rival_id);
    }

    #[test]
    fn forward_operations_chain_lists_the_remaining_path_to_head() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid = Uuid::new_v4();

        let op1 = mint(&owner, uuid, "v0");
        let op1_id = op1.id().unwrap();
        let pad0 = mint(&owner, Uuid::new_v4(), "pad");
        let b0 = mined_block(Revision::sentinel(), 1, vec![op1, pad0], &miner);
        let b0_id = b0.id().unwrap();
        update_blocks(&mut store, vec![b0], None).unwrap();

        let mut op2 = Operation::new(Revision::from_id(op1_id), uuid, "v1".into(), vec![owner.public_key().clone()]);
        op2.sign(&owner).unwrap();
        let op2_id = op2.id().unwrap();
        let pad1 = mint(&owner, Uuid::new_v4(), "pad");
        let b1 = mined_block(Revision::from_id(b0_id), 2, vec![op2, pad1], &miner);
        let b1_id = b1.id().unwrap();
        update_blocks(&mut store, vec![b1], None).unwrap();

        let mut op3 = Operation::new(Revision::from_id(op2_id), uuid, "v2".into(), vec![owner.public_key().clone()]);
        op3.sign(&owner).unwrap();
        let op3_id = op3.id().unwrap();
        let pad2 = mint(&owner, Uuid::new_v4(), "pad");
        let b2 = mined_block(Revision::from_id(b1_id), 3, vec![op3, pad2], &miner);
        let b2_id = b2.id().unwrap();
        update_blocks(&mut store, vec![b2], None).unwrap();

        assert_eq!(store.tree().head(), b2_id);

        let chain = forward_operations_chain(&store, op1_id, b2_id).unwrap();
        assert_eq!(chain, vec![op2_id, op3_id]);
    }

    #[test]
    fn forward_operations_chain_on_the_minting_operation_itself_is_empty() {
        let mut store = Store::open_memory().unwrap();
        let owner = User::generate();
        let miner = User::generate();
        let uuid = Uuid::new_v4();

        let op0 = mint(&owner, uuid, "v0");
        let op0_id = op0.id().unwrap();
        let b0 = mined_block(Revision::sentinel(), 1, vec![op0], &miner);
        let b0_id = b0.id().unwrap();
        update_blocks(&mut store, vec![b0], None).unwrap();

        assert_eq!(store.tree().head(), b0_id);
        assert!(forward_operations_chain(&store, op0_id, b0_id).unwrap().is_empty());
    }

    #[test]
    fn no_op_switch_to_current_head_is_a_noop() {
        let mut store = Store::open_memory().unwrap();
        let head = store.tree().head();
        set_head(&mut store, head).unwrap();
        assert_eq!(store.tree().head(), head);
    }
}
