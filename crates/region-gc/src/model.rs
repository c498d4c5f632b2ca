//! Capabilities the embedding runtime plugs into the collector.
//!
//! The core never interprets object bodies. It asks the [`ObjectModel`] for an
//! object's size and reference slots, and the [`RootProvider`] for the slots
//! it keeps outside the heap.

use crate::object::{ObjectRef, RefField};

/// Object layout knowledge supplied by the embedder.
///
/// Methods are called from mutator and collector threads concurrently. They
/// are only called on objects in the normal state or on to-space copies, so
/// the class word returned by [`ObjectRef::header`] is always valid.
pub trait ObjectModel: Send + Sync + 'static {
    /// Total size in bytes, including the 8-byte state word.
    fn object_size(&self, obj: ObjectRef) -> usize;

    /// Calls `visitor` for every reference slot of `obj`.
    fn for_each_reference(&self, obj: ObjectRef, visitor: &mut dyn FnMut(&RefField));

    /// Sanity check used by heap verification.
    fn is_valid_object(&self, _obj: ObjectRef) -> bool {
        true
    }

    /// Notification that `from` was copied to `to`.
    ///
    /// Runs on the thread that won the copy, before the forwarding address
    /// is published.
    fn object_moved(&self, _from: ObjectRef, _to: ObjectRef) {}
}

/// Root slots outside the heap.
///
/// Visited once during enumeration and once during preforwarding. The
/// collector may rewrite visited slots through [`RefField::update`].
pub trait RootProvider: Send + Sync + 'static {
    /// Visits every strong root slot.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&RefField));

    /// Visits every weak root slot. Unreachable targets are cleared to null.
    fn visit_weak_roots(&self, _visitor: &mut dyn FnMut(&RefField)) {}
}
