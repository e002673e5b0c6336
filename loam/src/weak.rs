//! Weak references: lookups that observe a cell's liveness but never keep
//! it alive.
//!
//! A weak reference pairs a [`CellId`] with the slot generation it was
//! created under. Sweep advances the generation when a slot's occupant dies,
//! so stale weak references resolve to absent without the collector ever
//! patching them.

use std::fmt;
use std::marker::PhantomData;

use crate::{CellId, Handle, Heap, HeapObject};

/// A typed weak reference to a cell of type `T`.
pub struct Weak<T: HeapObject> {
    cell: WeakCell,
    _marker: PhantomData<*const T>,
}

impl<T: HeapObject> Clone for Weak<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HeapObject> Copy for Weak<T> {}

impl<T: HeapObject> PartialEq for Weak<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cell == other.cell
    }
}

impl<T: HeapObject> Eq for Weak<T> {}

impl<T: HeapObject> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weak({:?}, gen {})", self.cell.id, self.cell.generation)
    }
}

impl<T: HeapObject> Weak<T> {
    pub(crate) fn new(id: CellId, generation: u32) -> Self {
        Self {
            cell: WeakCell { id, generation },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn id(self) -> CellId {
        self.cell.id
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.cell.generation
    }

    /// Resolve to a live handle, or `None` once the referent has been
    /// collected (or its slot reused for a newer occupant).
    pub fn upgrade(self, heap: &Heap) -> Option<Handle<T>> {
        self.cell.resolve(heap).map(Handle::new)
    }

    /// Forget the static type, e.g. for cache fields that reference
    /// arbitrary embedder cells.
    #[inline]
    pub fn as_weak_cell(self) -> WeakCell {
        self.cell
    }
}

/// An untyped weak reference.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct WeakCell {
    id: CellId,
    generation: u32,
}

impl WeakCell {
    pub(crate) fn new(id: CellId, generation: u32) -> Self {
        Self { id, generation }
    }

    #[inline]
    pub fn id(self) -> CellId {
        self.id
    }

    /// Resolve to the referent's id, or `None` once it has been collected.
    pub fn resolve(self, heap: &Heap) -> Option<CellId> {
        if heap.generation_matches(self.id, self.generation) {
            Some(self.id)
        } else {
            None
        }
    }
}
