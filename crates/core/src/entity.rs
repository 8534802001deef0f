//! Entity trait: a persisted record addressed by its identifier.

/// A keyed record.
///
/// Every row type the pipeline persists implements this so the in-memory
/// stores can share one table implementation.
pub trait Entity {
    /// Strongly-typed identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    /// Returns the identifier.
    fn id(&self) -> Self::Id;
}
