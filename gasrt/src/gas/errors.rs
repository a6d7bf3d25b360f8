use crate::gas::{AccessFlags, GlobalPtr};

/// Errors returned by global address space accesses.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GasError {
    /// GAS accesses must happen on a runtime thread, from within a task or a
    /// `block_on` body.
    #[error("GAS access outside of a running task")]
    NoTaskContext,

    #[error("null global pointer")]
    NullPointer,

    #[error("zero-sized allocation or access")]
    ZeroSized,

    #[error("no segment contains address {0}")]
    UnknownSegment(GlobalPtr),

    #[error("access [{ptr}, +{len}) is out of bounds")]
    OutOfBounds { ptr: GlobalPtr, len: usize },

    #[error("invalid access flags {0:?}: exactly one of RO, RWE, RWS is required")]
    InvalidFlags(AccessFlags),

    #[error("write through read-only mapping of {0}")]
    ReadOnly(GlobalPtr),

    /// The mapping backing a `LocalRef` was released.
    #[error("mapping of {0} was unlocalized")]
    Unlocalized(GlobalPtr),

    #[error("segment {base} still has {live} live mapping(s)")]
    SegmentInUse { base: GlobalPtr, live: usize },
}
