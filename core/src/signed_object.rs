//! Shared contract for signed, content-addressed entities (spec §4.2).
//!
//! `Verified<T>` replaces the prototype's cached, mutable `verified` flag
//! (spec §9, "Cached 'verified' flag") with a newtype that can only be
//! constructed from inside this crate, once signature *and* semantic
//! verification have both succeeded — so the type system, not a runtime
//! flag, tracks whether a value is safe to persist.

use crate::codec::{double_sha256, Writer, HASH_LEN};
use crate::error::CoreError;
use crate::keys::{verify, PublicKey, Signature, User};

/// Common contract implemented by `Operation` and `Block`.
pub trait SignedObject: Sized {
    /// Canonical serialization of semantic fields, excluding signer key and
    /// signature.
    fn unsigned_raw(&self) -> Result<Vec<u8>, CoreError>;

    fn public_key(&self) -> Option<&PublicKey>;
    fn signature(&self) -> Option<&Signature>;

    /// Attaches a `(public_key, signature)` pair produced by [`User`].
    fn set_signature(&mut self, public_key: PublicKey, signature: Signature);

    /// Signs this object with `user`, deriving `unsigned_raw` first.
    fn sign(&mut self, user: &User) -> Result<(), CoreError> {
        let unsigned = self.unsigned_raw()?;
        let (public_key, signature) = user.sign_bytes(&unsigned);
        self.set_signature(public_key, signature);
        Ok(())
    }

    /// Verifies the attached signature over `unsigned_raw`.
    fn verify_signature(&self) -> Result<(), CoreError> {
        let public_key = self
            .public_key()
            .ok_or_else(|| CoreError::Verify("object is not signed".into()))?;
        let signature = self
            .signature()
            .ok_or_else(|| CoreError::Verify("object is not signed".into()))?;
        let unsigned = self.unsigned_raw()?;
        verify(public_key, &unsigned, signature)
    }

    /// `unsigned_raw || sized(public_key.der) || sized(signature)`. Verifies
    /// the signature first.
    fn raw(&self) -> Result<Vec<u8>, CoreError> {
        self.verify_signature()?;
        let mut w = Writer::new();
        w.write_fixed(&self.unsigned_raw()?);
        w.write_sized(self.public_key().unwrap().der());
        w.write_sized(self.signature().unwrap().as_bytes());
        Ok(w.into_bytes())
    }

    /// `double_sha(raw())`.
    fn id(&self) -> Result<[u8; HASH_LEN], CoreError> {
        Ok(double_sha256(&self.raw()?))
    }

    /// Fails with `Verify("wrong object id")` unless `expected == id()`.
    fn verify_id(&self, expected: [u8; HASH_LEN]) -> Result<(), CoreError> {
        if self.id()? != expected {
            Err(CoreError::Verify("wrong object id".into()))
        } else {
            Ok(())
        }
    }

    /// Entity-specific semantic invariants, beyond the signature.
    fn verify_semantics(&self) -> Result<(), CoreError>;
}

/// A `T` whose signature and semantic invariants have both been checked.
///
/// Only buildable via [`verify`]; there is no public constructor, so a
/// `Verified<T>` lying around is proof the checks ran.
pub struct Verified<T>(T);

impl<T> Verified<T> {
    pub fn get(&self) -> &T {
        &self.0
    }

    /// Crate-internal: lets `ingest` run store-dependent chain checks
    /// (which cache resolved `Revision` lookups) on the wrapped value
    /// without unwrapping it first.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        &mut self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: SignedObject> Verified<T> {
    /// Verifies `obj`'s signature, then its semantic invariants, and wraps
    /// it. This is the only way to obtain a `Verified<T>` from outside the
    /// crate.
    pub fn verify(obj: T) -> Result<Self, CoreError> {
        obj.verify_signature()?;
        obj.verify_semantics()?;
        Ok(Verified(obj))
    }

    /// Crate-internal escape hatch for values whose verification already
    /// happened as a side effect of verifying something else — e.g. a
    /// `Block`'s `verify_semantics` already calls `verify_signature`/
    /// `verify_semantics` on every contained `Operation`, so re-running
    /// `verify` on those same operations would be redundant, not safer.
    pub(crate) fn assume_verified(obj: T) -> Self {
        Verified(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        payload: u32,
        public_key: Option<PublicKey>,
        signature: Option<Signature>,
    }

    impl SignedObject for Dummy {
        fn unsigned_raw(&self) -> Result<Vec<u8>, CoreError> {
            Ok(self.payload.to_be_bytes().to_vec())
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
            Ok(())
        }
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let user = User::generate();
        let mut d = Dummy {
            payload: 9,
            public_key: None,
            signature: None,
        };
        d.sign(&user).unwrap();
        assert!(Verified::verify(d).is_ok());
    }

    #[test]
    fn unsigned_object_fails_verification() {
        let d = Dummy {
            payload: 9,
            public_key: None,
            signature: None,
        };
        assert!(matches!(Verified::verify(d), Err(CoreError::Verify(_))));
    }

    #[test]
    fn verify_id_rejects_wrong_expected_id() {
        let user = User::generate();
        let mut d = Dummy {
            payload: 7,
            public_key: None,
            signature: None,
        };
        d.sign(&user).unwrap();
        let mut wrong = d.id().unwrap();
        wrong[0] ^= 0xFF;
        assert!(matches!(d.verify_id(wrong), Err(CoreError::Verify(msg)) if msg == "wrong object id"));
        assert!(d.verify_id(d.id().unwrap()).is_ok());
    }

    #[test]
    fn id_matches_double_sha_of_raw() {
        let user = User::generate();
        let mut d = Dummy {
            payload: 3,
            public_key: None,
            signature: None,
        };
        d.sign(&user).unwrap();
        let raw = d.raw().unwrap();
        assert_eq!(d.id().unwrap(), double_sha256(&raw));
    }
}
