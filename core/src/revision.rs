//! `Revision<T>` — a reference to a signed object, by id, optionally with
//! the object already resolved.
//!
//! The prototype (`abstract_revision.py`) resolves lazily against a global
//! database singleton. Per spec §9's "Global mutable Store" note, lazy
//! resolution against ambient state is replaced here with an explicit
//! `resolve_with` that takes a fetch closure supplied by the caller (which,
//! in practice, closes over a `&Store`).

use crate::codec::{HASH_LEN, SENTINEL};
use crate::error::CoreError;

/// A reference to a signed object of type `T`, either the sentinel (no
/// predecessor), by-id only, or by-id with the object already attached.
#[derive(Clone, Debug)]
pub struct Revision<T> {
    id: [u8; HASH_LEN],
    obj: Option<T>,
}

impl<T> Revision<T> {
    /// The reserved "no predecessor" reference.
    pub fn sentinel() -> Self {
        Revision {
            id: SENTINEL,
            obj: None,
        }
    }

    pub fn from_id(id: [u8; HASH_LEN]) -> Self {
        Revision { id, obj: None }
    }

    pub fn from_obj(id: [u8; HASH_LEN], obj: T) -> Self {
        Revision { id, obj: Some(obj) }
    }

    pub fn id(&self) -> [u8; HASH_LEN] {
        self.id
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL
    }

    pub fn obj(&self) -> Option<&T> {
        self.obj.as_ref()
    }

    /// Returns the resolved object, fetching it via `fetch` (closing over a
    /// `&Store`) if not already attached. Sentinel revisions never resolve.
    pub fn resolve_with<F>(&mut self, fetch: F) -> Result<Option<&T>, CoreError>
    where
        F: FnOnce([u8; HASH_LEN]) -> Result<T, CoreError>,
    {
        if self.is_sentinel() {
            return Ok(None);
        }
        if self.obj.is_none() {
            self.obj = Some(fetch(self.id)?);
        }
        Ok(self.obj.as_ref())
    }
}

impl<T> PartialEq for Revision<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Revision<T> {}
