//! One identifier mutation: owner-chain verification, per-block reference
//! counting (spec §4.3).

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::codec::{Id, Reader, Writer, HASH_LEN, UUID_LEN};
use crate::error::{ChainKind, CoreError};
use crate::keys::{PublicKey, Signature};
use crate::revision::Revision;
use crate::signed_object::SignedObject;
use crate::store::Store;

pub const VERSION: u32 = 1;

/// One mutation of a UUID's registry entry: a new address and owner set,
/// signed by a current owner (or, for a minting operation, self-asserted).
pub struct Operation {
    pub previous_operation_rev: Revision<Operation>,
    pub uuid: Uuid,
    pub address: String,
    pub owners: Vec<PublicKey>,
    public_key: Option<PublicKey>,
    signature: Option<Signature>,
    /// Block ids referencing this operation. Persisted alongside the
    /// signed bytes, never part of them (spec §9, "containing_blocks
    /// reference counting").
    pub containing_blocks: BTreeSet<Id>,
}

impl Operation {
    /// Builds an unsigned operation ready for `SignedObject::sign`.
    pub fn new(
        previous_operation_rev: Revision<Operation>,
        uuid: Uuid,
        address: String,
        owners: Vec<PublicKey>,
    ) -> Self {
        Operation {
            previous_operation_rev,
            uuid,
            address,
            owners,
            public_key: None,
            signature: None,
            containing_blocks: BTreeSet::new(),
        }
    }

    pub fn is_minting(&self) -> bool {
        self.previous_operation_rev.is_sentinel()
    }

    /// Decodes an operation from `raw()` bytes without verifying signature
    /// or semantics (callers must call `Verified::verify` afterwards).
    pub fn from_raw(raw: &[u8]) -> Result<Self, CoreError> {
        let mut r = Reader::new(raw);
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(CoreError::RawFormat(format!("unsupported operation version {version}")));
        }
        let prev_id: [u8; HASH_LEN] = r.read_fixed()?;
        let uuid_bytes: [u8; UUID_LEN] = r.read_fixed()?;
        let address = r.read_string()?;
        let n_owners = r.read_u32()?;
        let mut owners = Vec::with_capacity(n_owners as usize);
        for _ in 0..n_owners {
            owners.push(PublicKey::from_der(r.read_sized()?));
        }
        let signer_der = r.read_sized()?;
        let signature_bytes = r.read_sized()?;
        r.finish()?;

        Ok(Operation {
            previous_operation_rev: Revision::from_id(prev_id),
            uuid: Uuid::from_bytes(uuid_bytes),
            address,
            owners,
            public_key: Some(PublicKey::from_der(signer_der)),
            signature: Some(Signature::from_bytes(signature_bytes)),
            containing_blocks: BTreeSet::new(),
        })
    }

    /// Store layout: `sized(raw()) || uint32 M || M x fixed(32)
    /// containing_block_ids`, keeping the signed bytes pure (spec §4.3).
    pub fn database_raw(&self) -> Result<Vec<u8>, CoreError> {
        let mut w = Writer::new();
        w.write_sized(&self.raw()?);
        w.write_u32(self.containing_blocks.len() as u32);
        for block_id in &self.containing_blocks {
            w.write_fixed(block_id);
        }
        Ok(w.into_bytes())
    }

    pub fn from_database_raw(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut r = Reader::new(bytes);
        let raw = r.read_sized()?;
        let n = r.read_u32()?;
        let mut containing_blocks = BTreeSet::new();
        for _ in 0..n {
            containing_blocks.insert(r.read_fixed::<HASH_LEN>()?);
        }
        r.finish()?;
        let mut op = Operation::from_raw(&raw)?;
        op.containing_blocks = containing_blocks;
        Ok(op)
    }

    /// Store-dependent rules beyond the signature: predecessor resolution,
    /// uuid agreement, ownership.
    pub fn verify_chain(&mut self, store: &Store) -> Result<(), CoreError> {
        if self.is_minting() {
            return Ok(());
        }
        let signer = self
            .public_key
            .clone()
            .ok_or_else(|| CoreError::Verify("object is not signed".into()))?;
        let predecessor = self
            .previous_operation_rev
            .resolve_with(|id| store.get_operation(&id))?
            .ok_or_else(|| CoreError::chain(ChainKind::MissingPredecessor, "previous_operation_rev does not exist"))?;
        if predecessor.uuid != self.uuid {
            return Err(CoreError::Uuid("uuid mismatch".into()));
        }
        if !predecessor.owners.iter().any(|owner| owner == &signer) {
            return Err(CoreError::Ownership("signer not among predecessor's owners".into()));
        }
        Ok(())
    }

    /// `put_verify`: a minting operation must be the only one for its uuid.
    pub fn put_verify(&self, store: &Store) -> Result<(), CoreError> {
        if self.is_minting() && store.has_identifier(&self.uuid)? {
            return Err(CoreError::chain(
                ChainKind::Duplication,
                "trying to create a minting operation for an existing uuid",
            ));
        }
        Ok(())
    }

    /// `remove_verify`: refuses to orphan a block that still references us.
    pub fn remove_verify(&self) -> Result<(), CoreError> {
        if !self.containing_blocks.is_empty() {
            return Err(CoreError::chain(ChainKind::OperationBlocked, "operation is still referenced by a block"));
        }
        Ok(())
    }

    /// Walks `previous_operation_rev` back to `end` (exclusive), or to the
    /// sentinel if `end` is the sentinel. Fails with `Chain` if `end` is not
    /// an ancestor.
    pub fn backward_operations_chain(&self, store: &Store, end: Id) -> Result<Vec<Id>, CoreError> {
        let mut chain = Vec::new();
        let mut current_id = store_id_of(self)?;
        let mut current = self.shallow_clone();
        loop {
            if current_id == end {
                return Ok(chain);
            }
            if current.is_minting() {
                if end == crate::codec::SENTINEL {
                    return Ok(chain);
                }
                return Err(CoreError::Chain(ChainKind::MissingPredecessor, "end is not an ancestor".into()));
            }
            chain.push(current_id);
            let prev_id = current.previous_operation_rev.id();
            current = store.get_operation(&prev_id)?;
            current_id = prev_id;
        }
    }

    fn shallow_clone(&self) -> Operation {
        Operation {
            previous_operation_rev: Revision::from_id(self.previous_operation_rev.id()),
            uuid: self.uuid,
            address: self.address.clone(),
            owners: self.owners.clone(),
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
            containing_blocks: self.containing_blocks.clone(),
        }
    }
}

/// `id()` requires the object be signed; this helper reports that as `Chain`
/// rather than unwrapping, since callers here already hold a persisted
/// (therefore signed) operation.
fn store_id_of(op: &Operation) -> Result<Id, CoreError> {
    op.id()
}

impl SignedObject for Operation {
    fn unsigned_raw(&self) -> Result<Vec<u8>, CoreError> {
        let mut w = Writer::new();
        w.write_u32(VERSION);
        w.write_fixed(&self.previous_operation_rev.id());
        w.write_fixed(self.uuid.as_bytes());
        w.write_string(&self.address);
        w.write_u32(self.owners.len() as u32);
        for owner in &self.owners {
            w.write_sized(owner.der());
        }
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
        let mut seen: BTreeSet<&[u8]> = BTreeSet::new();
        for owner in &self.owners {
            if !seen.insert(owner.der()) {
                return Err(CoreError::Verify("duplicated owners".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::User;

    fn minting_op(user: &User, uuid: Uuid, address: &str) -> Operation {
        let mut op = Operation::new(
            Revision::sentinel(),
            uuid,
            address.to_string(),
            vec![user.public_key().clone()],
        );
        op.sign(user).unwrap();
        op
    }

    #[test]
    fn minting_operation_round_trips_through_raw() {
        let user = User::generate();
        let uuid = Uuid::new_v4();
        let op = minting_op(&user, uuid, "http://example.com/");
        let raw = op.raw().unwrap();
        let decoded = Operation::from_raw(&raw).unwrap();
        assert_eq!(decoded.uuid, op.uuid);
        assert_eq!(decoded.address, op.address);
        assert_eq!(decoded.owners, op.owners);
        assert!(decoded.verify_signature().is_ok());
    }

    #[test]
    fn duplicated_owners_fail_verification() {
        let user = User::generate();
        let mut op = Operation::new(
            Revision::sentinel(),
            Uuid::new_v4(),
            "a".into(),
            vec![user.public_key().clone(), user.public_key().clone()],
        );
        op.sign(&user).unwrap();
        assert!(matches!(op.verify_semantics(), Err(CoreError::Verify(_))));
    }

    #[test]
    fn truncated_raw_is_raw_format() {
        let user = User::generate();
        let op = minting_op(&user, Uuid::new_v4(), "http://example.com/");
        let raw = op.raw().unwrap();
        let truncated = &raw[..raw.len() - 1];
        assert!(matches!(Operation::from_raw(truncated), Err(CoreError::RawFormat(_))));
    }

    #[test]
    fn trailing_byte_is_raw_format() {
        let user = User::generate();
        let op = minting_op(&user, Uuid::new_v4(), "http://example.com/");
        let mut raw = op.raw().unwrap();
        raw.push(0);
        assert!(matches!(Operation::from_raw(&raw), Err(CoreError::RawFormat(_))));
    }
}
