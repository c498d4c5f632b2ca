//! A reference object model and root set.
//!
//! Used by the crate's tests and benches, and handy for embedders that want
//! a working heap before they wire in their own layout.
//!
//! [`SimpleObjectModel`] objects are laid out as the state word, then
//! `refs` reference slots, then `data` raw bytes. Both counts are encoded in
//! the class word, so the model needs no side tables.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::model::{ObjectModel, RootProvider};
use crate::object::{aligned_size, ObjectHeader, ObjectRef, RefField, RefValue, MIN_OBJECT_SIZE};

const REFS_SHIFT: u32 = 24;
const DATA_MASK: u64 = (1 << REFS_SHIFT) - 1;

/// Layout: state word, reference slots, raw bytes.
#[derive(Debug, Default)]
pub struct SimpleObjectModel {
    moved: AtomicUsize,
}

impl SimpleObjectModel {
    /// Language tag of every object this model creates.
    pub const TAG: u8 = 1;

    /// Creates the model.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            moved: AtomicUsize::new(0),
        }
    }

    /// Header of an object with `refs` reference slots and `data` raw bytes.
    #[must_use]
    pub const fn header(&self, refs: usize, data: usize) -> ObjectHeader {
        ObjectHeader::new(((refs as u64) << REFS_SHIFT) | (data as u64 & DATA_MASK), Self::TAG)
    }

    /// Reference slots of objects with `header`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn references(&self, header: ObjectHeader) -> usize {
        (header.class >> REFS_SHIFT) as usize
    }

    /// Size in bytes of objects with `header`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn size_of(&self, header: ObjectHeader) -> usize {
        let data = (header.class & DATA_MASK) as usize;
        let body = self.references(header) * 8 + data;
        if body == 0 {
            MIN_OBJECT_SIZE
        } else {
            MIN_OBJECT_SIZE + aligned_size(body)
        }
    }

    /// Objects copied so far.
    #[must_use]
    pub fn moved(&self) -> usize {
        self.moved.load(Ordering::Relaxed)
    }
}

impl ObjectModel for SimpleObjectModel {
    fn object_size(&self, obj: ObjectRef) -> usize {
        // SAFETY: the collector only asks about live objects.
        self.size_of(unsafe { obj.header() })
    }

    fn for_each_reference(&self, obj: ObjectRef, visitor: &mut dyn FnMut(&RefField)) {
        // SAFETY: as above.
        let refs = self.references(unsafe { obj.header() });
        for index in 0..refs {
            // SAFETY: slot `index` is inside the object's layout.
            visitor(unsafe { obj.field(MIN_OBJECT_SIZE + index * 8) });
        }
    }

    fn is_valid_object(&self, obj: ObjectRef) -> bool {
        // SAFETY: as above.
        unsafe { obj.header() }.tag == Self::TAG
    }

    fn object_moved(&self, _from: ObjectRef, _to: ObjectRef) {
        self.moved.fetch_add(1, Ordering::Relaxed);
    }
}

/// Index of a slot in a [`RootSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle {
    weak: bool,
    index: usize,
}

impl RootHandle {
    /// Whether the slot is a weak root.
    #[must_use]
    pub const fn is_weak(self) -> bool {
        self.weak
    }
}

/// Growable strong and weak root slots.
///
/// Slots are never removed; clearing one stores null. Values stored with
/// [`set`](Self::set) while a cycle is evacuating must already be resolved
/// (see [`Mutator::resolve`](crate::Mutator::resolve)).
#[derive(Debug, Default)]
pub struct RootSet {
    strong: RwLock<Vec<RefField>>,
    weak: RwLock<Vec<RefField>>,
}

impl RootSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, weak: bool) -> &RwLock<Vec<RefField>> {
        if weak {
            &self.weak
        } else {
            &self.strong
        }
    }

    fn push(&self, weak: bool, value: RefValue) -> RootHandle {
        let mut slots = self.slots(weak).write();
        slots.push(RefField::new(value));
        RootHandle {
            weak,
            index: slots.len() - 1,
        }
    }

    /// Adds a strong root.
    pub fn add(&self, target: Option<ObjectRef>) -> RootHandle {
        self.push(false, RefValue::from_option(target))
    }

    /// Adds a weak root; it is cleared when its target dies.
    pub fn add_weak(&self, target: Option<ObjectRef>) -> RootHandle {
        self.push(true, target.map_or(RefValue::NULL, RefValue::weak))
    }

    /// The current target of a slot.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Option<ObjectRef> {
        self.slots(handle.weak)
            .read()
            .get(handle.index)
            .and_then(|slot| slot.load().target())
    }

    /// Overwrites a slot.
    pub fn set(&self, handle: RootHandle, target: Option<ObjectRef>) {
        let slots = self.slots(handle.weak).read();
        let Some(slot) = slots.get(handle.index) else {
            return;
        };
        let value = match target {
            Some(target) if handle.weak => RefValue::weak(target),
            other => RefValue::from_option(other),
        };
        slot.store(value);
    }

    /// Strong and weak slots together.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strong.read().len() + self.weak.read().len()
    }

    /// Whether no slot was ever added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for RootSet {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&RefField)) {
        for slot in self.strong.read().iter() {
            visitor(slot);
        }
    }

    fn visit_weak_roots(&self, visitor: &mut dyn FnMut(&RefField)) {
        for slot in self.weak.read().iter() {
            visitor(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let model = SimpleObjectModel::new();
        assert_eq!(model.size_of(model.header(0, 0)), 8);
        assert_eq!(model.size_of(model.header(1, 0)), 16);
        assert_eq!(model.size_of(model.header(0, 24)), 32);
        assert_eq!(model.size_of(model.header(0, 5)), 16);
        assert_eq!(model.size_of(model.header(62, 0)), 504);
        assert_eq!(model.references(model.header(3, 100)), 3);
    }

    #[test]
    fn test_root_set() {
        let roots = RootSet::new();
        assert!(roots.is_empty());
        let obj = ObjectRef::from_address(0x1000).unwrap();
        let strong = roots.add(Some(obj));
        let weak = roots.add_weak(Some(obj));
        assert!(weak.is_weak());
        assert_eq!(roots.get(strong), Some(obj));
        assert_eq!(roots.get(weak), Some(obj));

        let mut weak_values = Vec::new();
        roots.visit_weak_roots(&mut |slot| weak_values.push(slot.load()));
        assert_eq!(weak_values, vec![RefValue::weak(obj)]);

        roots.set(strong, None);
        assert_eq!(roots.get(strong), None);
        assert_eq!(roots.len(), 2);
    }
}
