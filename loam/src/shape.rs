//! Shapes: structural descriptors of an object's property layout, with the
//! generation bookkeeping the inline caches validate against.
//!
//! Only as much shape machinery lives here as the cache contract needs:
//! a name-to-offset table, a generation that advances on every property-set
//! change, an optional prototype link, and a chain-validity token that the
//! embedder invalidates when the prototype chain mutates. Transition tables
//! and the rest of the object model stay with the embedder.

use std::collections::HashMap;

use ahash::RandomState;

use crate::{Handle, HeapObject, Value, Visitable, Visitor};

/// Token cached by prototype-chain inline-cache entries. A chain mutation
/// flips it invalid; the cached entry then misses and repopulates against
/// the shape's fresh token.
pub struct PrototypeChainValidity {
    valid: bool,
}

impl Default for PrototypeChainValidity {
    fn default() -> Self {
        Self::new()
    }
}

impl PrototypeChainValidity {
    pub fn new() -> Self {
        Self { valid: true }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

impl Visitable for PrototypeChainValidity {
    fn visit_edges(&self, _visitor: &mut dyn Visitor) {}
}

impl HeapObject for PrototypeChainValidity {
    fn class_name(&self) -> &'static str {
        "PrototypeChainValidity"
    }
}

pub struct Shape {
    property_offsets: HashMap<String, u32, RandomState>,
    next_offset: u32,
    generation: u64,
    prototype: Option<Value>,
    chain_validity: Option<Handle<PrototypeChainValidity>>,
}

impl Default for Shape {
    fn default() -> Self {
        Self::new()
    }
}

impl Shape {
    pub fn new() -> Self {
        Self {
            property_offsets: HashMap::default(),
            next_offset: 0,
            generation: 0,
            prototype: None,
            chain_validity: None,
        }
    }

    pub fn with_prototype(prototype: Value) -> Self {
        Self {
            prototype: Some(prototype),
            ..Self::new()
        }
    }

    /// Append a property and return its slot offset. Advances the
    /// generation, invalidating cache entries recorded against the old
    /// property set.
    pub fn add_property(&mut self, name: &str) -> u32 {
        debug_assert!(
            !self.property_offsets.contains_key(name),
            "property {:?} added twice",
            name
        );
        let offset = self.next_offset;
        self.next_offset += 1;
        self.property_offsets.insert(name.to_string(), offset);
        self.generation += 1;
        offset
    }

    pub fn remove_property(&mut self, name: &str) -> Option<u32> {
        let removed = self.property_offsets.remove(name);
        if removed.is_some() {
            self.generation += 1;
        }
        removed
    }

    pub fn property_offset(&self, name: &str) -> Option<u32> {
        self.property_offsets.get(name).copied()
    }

    pub fn property_count(&self) -> usize {
        self.property_offsets.len()
    }

    /// The value caches record and compare; any property-set change moves
    /// it forward.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn prototype(&self) -> Option<Value> {
        self.prototype
    }

    pub fn set_prototype(&mut self, prototype: Option<Value>) {
        self.prototype = prototype;
        self.generation += 1;
    }

    pub fn chain_validity(&self) -> Option<Handle<PrototypeChainValidity>> {
        self.chain_validity
    }

    pub fn set_chain_validity(
        &mut self,
        validity: Handle<PrototypeChainValidity>,
    ) {
        self.chain_validity = Some(validity);
    }
}

impl Visitable for Shape {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.prototype.visit_edges(visitor);
        self.chain_validity.visit_edges(visitor);
    }
}

impl HeapObject for Shape {
    fn class_name(&self) -> &'static str {
        "Shape"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellState, CollectionType, Heap};

    #[test]
    fn properties_get_consecutive_offsets() {
        let mut shape = Shape::new();
        assert_eq!(shape.add_property("x"), 0);
        assert_eq!(shape.add_property("y"), 1);
        assert_eq!(shape.property_offset("x"), Some(0));
        assert_eq!(shape.property_offset("y"), Some(1));
        assert_eq!(shape.property_offset("z"), None);
        assert_eq!(shape.property_count(), 2);
    }

    #[test]
    fn every_property_set_change_advances_the_generation() {
        let mut shape = Shape::new();
        let initial = shape.generation();
        shape.add_property("x");
        let after_add = shape.generation();
        assert!(after_add > initial);

        shape.remove_property("x");
        assert!(shape.generation() > after_add);

        // Removing an absent property is not a change.
        let unchanged = shape.generation();
        shape.remove_property("x");
        assert_eq!(shape.generation(), unchanged);
    }

    #[test]
    fn shapes_trace_their_prototype_and_validity_token() {
        let mut heap = Heap::new();

        let validity = heap.allocate(PrototypeChainValidity::new());
        let prototype_shape = heap.allocate(Shape::new());

        let mut shape = Shape::with_prototype(prototype_shape.as_value());
        shape.set_chain_validity(validity);
        let shape = heap.allocate(shape);

        let _root = heap.root(shape);
        heap.collect_garbage(CollectionType::CollectGarbage);

        assert!(heap.is_live(shape.id()));
        assert!(heap.is_live(prototype_shape.id()));
        assert!(heap.is_live(validity.id()));
    }

    #[test]
    fn invalidating_the_token_sticks() {
        let mut heap = Heap::new();
        let validity = heap.allocate(PrototypeChainValidity::new());
        assert!(heap.get(validity).is_valid());

        heap.get_mut(validity).invalidate();
        assert!(!heap.get(validity).is_valid());
    }

    #[test]
    fn an_unreferenced_shape_is_collected() {
        let mut heap = Heap::new();
        let shape = heap.allocate(Shape::new());
        heap.collect_garbage(CollectionType::CollectGarbage);
        assert_eq!(heap.state(shape.id()), Some(CellState::Dead));
    }
}
