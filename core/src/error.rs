//! Error taxonomy shared by every layer of the core.
//!
//! The original prototype signals each of these cases with a distinct
//! exception class reachable from several unrelated base classes. Here
//! they collapse into one flat enum plus the handful of sub-kinds that
//! actually carry independent meaning (`ChainKind`).

use std::fmt;

/// Sub-kind of [`CoreError::Chain`], distinguishing referential failures
/// that callers may want to react to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// A referenced predecessor (operation or block) is missing.
    MissingPredecessor,
    /// Two operations in the same block share a predecessor.
    InBlockFork,
    /// An id already exists where uniqueness was required.
    Duplication,
    /// A second child of the sentinel block was submitted.
    GenesisBlockDuplication,
    /// Removal was attempted while dependants still reference the object.
    OperationBlocked,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainKind::MissingPredecessor => "missing predecessor",
            ChainKind::InBlockFork => "operations are creating tree inside the block",
            ChainKind::Duplication => "id already in the database",
            ChainKind::GenesisBlockDuplication => "second child of sentinel block",
            ChainKind::OperationBlocked => "cannot remove: dependants still reference this object",
        };
        write!(f, "{s}")
    }
}

/// Every distinguishable failure mode in the core, per the §7 taxonomy.
#[derive(Debug)]
pub enum CoreError {
    /// Decoding failed: too short, too long, or an internal field was malformed.
    RawFormat(String),
    /// A signature, id, or structural invariant on a single object is wrong.
    Verify(String),
    /// The signer of an operation is not among its predecessor's owners.
    Ownership(String),
    /// Cross-object referential error; see [`ChainKind`] for sub-kinds.
    Chain(ChainKind, String),
    /// Inconsistency discovered while switching the head.
    Tree(String),
    /// A UUID mismatch between a minting operation and its derivation, or
    /// between an operation and its predecessor.
    Uuid(String),
    /// The store is not open, or is already open.
    Initialisation(String),
    /// The requested key is absent from its table.
    DoesNotExist(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::RawFormat(msg) => write!(f, "raw format error: {msg}"),
            CoreError::Verify(msg) => write!(f, "verify error: {msg}"),
            CoreError::Ownership(msg) => write!(f, "ownership error: {msg}"),
            CoreError::Chain(kind, msg) => write!(f, "chain error ({kind}): {msg}"),
            CoreError::Tree(msg) => write!(f, "tree error: {msg}"),
            CoreError::Uuid(msg) => write!(f, "uuid error: {msg}"),
            CoreError::Initialisation(msg) => write!(f, "initialisation error: {msg}"),
            CoreError::DoesNotExist(msg) => write!(f, "does not exist: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    pub fn chain(kind: ChainKind, msg: impl Into<String>) -> Self {
        CoreError::Chain(kind, msg.into())
    }
}

/// Result alias used throughout `registry-core`.
pub type CoreResult<T> = Result<T, CoreError>;
