//! The tracing capability: cells report their strong references to a
//! [`Visitor`] during mark, and never outside it.

use std::collections::{BTreeMap, HashMap};

use crate::{CellId, Handle, HeapObject, Value};

/// Callback handed to [`Visitable::visit_edges`] during the mark phase.
///
/// Only strong references go through a visitor. Weak references are lookups,
/// not edges, and must not be reported.
pub trait Visitor {
    fn visit(&mut self, id: CellId);

    /// Visit a tagged value. Only the cell case marks; doubles and boxed
    /// values carry no reference.
    fn visit_value(&mut self, value: Value) {
        if value.is_cell() {
            self.visit(value.as_cell());
        }
    }
}

/// Implemented by anything the collector can trace through: cells
/// themselves, and the scalar containers cells are built from.
pub trait Visitable {
    fn visit_edges(&self, visitor: &mut dyn Visitor);
}

impl Visitable for Value {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_value(*self);
    }
}

impl<T: HeapObject> Visitable for Handle<T> {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit(self.id());
    }
}

// An absent reference is a no-op.
impl<T: Visitable> Visitable for Option<T> {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        if let Some(inner) = self {
            inner.visit_edges(visitor);
        }
    }
}

impl<T: Visitable> Visitable for [T] {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.visit_edges(visitor);
        }
    }
}

impl<T: Visitable> Visitable for Vec<T> {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.as_slice().visit_edges(visitor);
    }
}

impl<T: Visitable> Visitable for Box<[T]> {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.as_ref().visit_edges(visitor);
    }
}

// Maps trace their values; keys are interned names or scalars in practice
// and stay with the embedder if they ever reference cells.
impl<K, V: Visitable, S> Visitable for HashMap<K, V, S> {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        for value in self.values() {
            value.visit_edges(visitor);
        }
    }
}

impl<K, V: Visitable> Visitable for BTreeMap<K, V> {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        for value in self.values() {
            value.visit_edges(visitor);
        }
    }
}
