//! In-memory tree over all persisted blocks: head selection, fork
//! traversal, lowest common ancestor (spec §4.5).

use std::collections::HashMap;

use crate::codec::{Id, SENTINEL};
use crate::error::{ChainKind, CoreError};

/// `(depth, previous_id, next_ids[sorted])` for one block (or the sentinel
/// root).
#[derive(Clone, Debug)]
pub struct BlockRecord {
    pub depth: u64,
    pub previous_id: Option<Id>,
    pub next_ids: Vec<Id>,
}

/// A map `block_id -> BlockRecord`, rooted at the 32-zero sentinel, plus the
/// current head (a maximum-depth leaf).
pub struct BlockTree {
    map: HashMap<Id, BlockRecord>,
    head: Id,
}

impl BlockTree {
    /// An empty tree containing only the sentinel root.
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(
            SENTINEL,
            BlockRecord {
                depth: 0,
                previous_id: None,
                next_ids: Vec::new(),
            },
        );
        BlockTree { map, head: SENTINEL }
    }

    /// Rebuilds the tree from persisted `(block_id, previous_block_id)`
    /// pairs by BFS from the sentinel, matching the prototype's startup
    /// scan (`blockchain.py`'s `__init__`).
    pub fn rebuild<I: IntoIterator<Item = (Id, Id)>>(pairs: I) -> Result<Self, CoreError> {
        let mut children: HashMap<Id, Vec<Id>> = HashMap::new();
        for (id, previous_id) in pairs {
            children.entry(previous_id).or_default().push(id);
        }
        for ids in children.values_mut() {
            ids.sort();
        }

        let mut tree = BlockTree::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(SENTINEL);

        while let Some(current) = queue.pop_front() {
            let depth = tree.get(&current)?.depth;
            if let Some(next_ids) = children.remove(&current) {
                for next_id in &next_ids {
                    tree.map.insert(
                        *next_id,
                        BlockRecord {
                            depth: depth + 1,
                            previous_id: Some(current),
                            next_ids: Vec::new(),
                        },
                    );
                    queue.push_back(*next_id);
                }
                tree.map.get_mut(&current).unwrap().next_ids = next_ids;
            }
        }

        tree.head = tree.recompute_head();
        Ok(tree)
    }

    fn recompute_head(&self) -> Id {
        self.map
            .iter()
            .filter(|(_, record)| record.next_ids.is_empty())
            .min_by(|(id_a, record_a), (id_b, record_b)| {
                record_b.depth.cmp(&record_a.depth).then_with(|| id_a.cmp(id_b))
            })
            .map(|(id, _)| *id)
            .unwrap_or(SENTINEL)
    }

    pub fn get(&self, id: &Id) -> Result<&BlockRecord, CoreError> {
        self.map
            .get(id)
            .ok_or_else(|| CoreError::DoesNotExist("block isn't in the block tree".into()))
    }

    pub fn exist(&self, id: &Id) -> bool {
        self.map.contains_key(id)
    }

    pub fn head(&self) -> Id {
        self.head
    }

    pub fn max_depth(&self) -> u64 {
        self.map.get(&self.head).map(|r| r.depth).unwrap_or(0)
    }

    pub fn has_any_children(&self, id: &Id) -> bool {
        self.map.get(id).map(|r| !r.next_ids.is_empty()).unwrap_or(false)
    }

    /// Inserts `id` as a child of `previous_id`. Does not move the head;
    /// callers decide whether the new leaf becomes head (spec §4.5,
    /// `update_blocks`).
    pub fn add_block(&mut self, id: Id, previous_id: Id) -> Result<(), CoreError> {
        if self.map.contains_key(&id) {
            return Err(CoreError::chain(ChainKind::Duplication, "block id already in the block tree"));
        }
        let parent_depth = self.get(&previous_id)?.depth;
        self.map.insert(
            id,
            BlockRecord {
                depth: parent_depth + 1,
                previous_id: Some(previous_id),
                next_ids: Vec::new(),
            },
        );
        let parent = self.map.get_mut(&previous_id).unwrap();
        let insert_at = parent.next_ids.binary_search(&id).unwrap_or_else(|p| p);
        parent.next_ids.insert(insert_at, id);
        Ok(())
    }

    /// Sets the head directly (used after `update_blocks` or `set_head`
    /// decides a new leaf wins).
    pub fn set_head(&mut self, id: Id) {
        self.head = id;
    }

    /// What `head()` would become if `excluded` (a current leaf) were
    /// removed, without mutating the tree. A node whose only child is
    /// `excluded` becomes a leaf candidate too, since it would gain an
    /// empty `next_ids` the moment `excluded` is actually unlinked. Used
    /// by `ingest::remove_block` to rewire the identifier table before
    /// the block being removed is unlinked, while its ancestry is still
    /// walkable.
    pub fn head_excluding(&self, excluded: Id) -> Id {
        self.map
            .iter()
            .filter(|(id, record)| {
                **id != excluded
                    && (record.next_ids.is_empty() || (record.next_ids.len() == 1 && record.next_ids[0] == excluded))
            })
            .min_by(|(id_a, record_a), (id_b, record_b)| {
                record_b.depth.cmp(&record_a.depth).then_with(|| id_a.cmp(id_b))
            })
            .map(|(id, _)| *id)
            .unwrap_or(SENTINEL)
    }

    /// Unlinks a childless block from its parent and, if it was head,
    /// recomputes head from the remaining leaves.
    pub fn remove_block(&mut self, id: Id) -> Result<(), CoreError> {
        let record = self
            .map
            .get(&id)
            .ok_or_else(|| CoreError::DoesNotExist("block isn't in the block tree".into()))?
            .clone();
        if !record.next_ids.is_empty() {
            return Err(CoreError::chain(ChainKind::OperationBlocked, "can't remove: block has following blocks"));
        }
        if let Some(previous_id) = record.previous_id {
            let parent = self.map.get_mut(&previous_id).unwrap();
            parent.next_ids.retain(|next| *next != id);
        }
        self.map.remove(&id);

        if self.head == id {
            self.head = self.recompute_head();
        }
        Ok(())
    }

    /// Two-pointer walk up by depth, then in lockstep until the paths meet.
    pub fn lowest_common_ancestor(&self, a: Id, b: Id) -> Result<Id, CoreError> {
        let mut rec_a = (a, self.get(&a)?.clone());
        let mut rec_b = (b, self.get(&b)?.clone());
        if rec_a.1.depth < rec_b.1.depth {
            std::mem::swap(&mut rec_a, &mut rec_b);
        }
        while rec_a.1.depth > rec_b.1.depth {
            let prev = rec_a.1.previous_id.expect("non-root block always has a previous_id");
            rec_a = (prev, self.get(&prev)?.clone());
        }
        while rec_a.0 != rec_b.0 {
            let prev_a = rec_a.1.previous_id.expect("non-root block always has a previous_id");
            let prev_b = rec_b.1.previous_id.expect("non-root block always has a previous_id");
            rec_a = (prev_a, self.get(&prev_a)?.clone());
            rec_b = (prev_b, self.get(&prev_b)?.clone());
        }
        Ok(rec_a.0)
    }

    /// Block ids from `from` up to (and including) `end`, closest-first.
    /// Fails with `Tree` if `end` is not an ancestor of `from`.
    pub fn backward_blocks_chain(&self, from: Id, end: Id) -> Result<Vec<Id>, CoreError> {
        let mut chain = vec![from];
        let mut current = from;
        while current != SENTINEL && current != end {
            current = self
                .get(&current)?
                .previous_id
                .expect("non-root block always has a previous_id");
            chain.push(current);
        }
        if current != end {
            return Err(CoreError::Tree("end_block_id is not an ancestor of block_id".into()));
        }
        Ok(chain)
    }
}

impl Default for BlockTree {
    fn default() -> Self {
        Self::new()
    }
}
