//! Per-call-site inline caches: property lookups, global-variable
//! accesses, object-literal shapes and template objects remember what they
//! last saw so the fast path can skip the full lookup.
//!
//! Every cached pointer into the heap is weak and paired with the shape
//! generation it was recorded under. A collected shape or an advanced
//! generation turns the entry into a miss, never a dangling reference.
//! Caches are per-site owned state threaded through the embedder's
//! executables, not ambient globals, so independent runtime instances
//! cannot cross-talk.

use crate::{
    CellId, Handle, Heap, PrototypeChainValidity, Shape, Weak, WeakCell,
};

/// How many shapes one call site remembers, most recently used first.
pub const INLINE_CACHE_HISTORY: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CacheKind {
    #[default]
    Empty,
    OwnProperty,
    PrototypeProperty,
}

/// One remembered lookup. All fields are only meaningful after the
/// weak-and-generation validation performed by [`PropertyLookupCache::find`].
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub kind: CacheKind,
    pub property_offset: Option<u32>,
    pub shape_generation: u64,
    pub shape: Option<Weak<Shape>>,
    pub prototype: Option<WeakCell>,
    pub prototype_chain_validity: Option<Weak<PrototypeChainValidity>>,
}

/// A validated cache hit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CachedLookup {
    Own { offset: u32 },
    Prototype { prototype: CellId, offset: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct PropertyLookupCache {
    pub entries: [CacheEntry; INLINE_CACHE_HISTORY],
}

impl PropertyLookupCache {
    /// Shift the history down one slot (dropping the oldest entry), then
    /// let `populate` fill the fresh first slot.
    pub fn update(
        &mut self,
        kind: CacheKind,
        populate: impl FnOnce(&mut CacheEntry),
    ) {
        self.entries.rotate_right(1);
        self.entries[0] = CacheEntry {
            kind,
            ..CacheEntry::default()
        };
        populate(&mut self.entries[0]);
    }

    /// Record an own-property hit for `shape` at `offset`.
    pub fn record_own(&mut self, heap: &Heap, shape: Handle<Shape>, offset: u32) {
        let weak = heap.make_weak(shape);
        let generation = heap.get(shape).generation();
        self.update(CacheKind::OwnProperty, |entry| {
            entry.shape = Some(weak);
            entry.shape_generation = generation;
            entry.property_offset = Some(offset);
        });
    }

    /// Record a hit found on `prototype`, guarded by the prototype chain's
    /// validity token.
    pub fn record_prototype(
        &mut self,
        heap: &Heap,
        shape: Handle<Shape>,
        prototype: CellId,
        validity: Handle<PrototypeChainValidity>,
        offset: u32,
    ) {
        let weak_shape = heap.make_weak(shape);
        let generation = heap.get(shape).generation();
        let weak_prototype = heap.make_weak_cell(prototype);
        let weak_validity = heap.make_weak(validity);
        self.update(CacheKind::PrototypeProperty, |entry| {
            entry.shape = Some(weak_shape);
            entry.shape_generation = generation;
            entry.property_offset = Some(offset);
            entry.prototype = Some(weak_prototype);
            entry.prototype_chain_validity = Some(weak_validity);
        });
    }

    /// Scan the history for an entry valid against `shape`. A miss on all
    /// entries means the caller takes the slow path and calls
    /// [`PropertyLookupCache::update`] with what it finds.
    pub fn find(&self, heap: &Heap, shape: Handle<Shape>) -> Option<CachedLookup> {
        for entry in &self.entries {
            if let Some(hit) = entry.validate(heap, shape) {
                return Some(hit);
            }
        }
        None
    }
}

impl CacheEntry {
    fn validate(&self, heap: &Heap, shape: Handle<Shape>) -> Option<CachedLookup> {
        if self.kind == CacheKind::Empty {
            return None;
        }

        let recorded = self.shape?.upgrade(heap)?;
        if recorded != shape {
            return None;
        }
        if self.shape_generation != heap.get(shape).generation() {
            return None;
        }
        let offset = self.property_offset?;

        match self.kind {
            CacheKind::Empty => unreachable!(),
            CacheKind::OwnProperty => Some(CachedLookup::Own { offset }),
            CacheKind::PrototypeProperty => {
                let prototype = self.prototype?.resolve(heap)?;
                let validity = self.prototype_chain_validity?.upgrade(heap)?;
                if !heap.get(validity).is_valid() {
                    return None;
                }
                Some(CachedLookup::Prototype { prototype, offset })
            }
        }
    }
}

/// A global-access cache hit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GlobalLookup {
    /// The binding lives on the global object; apply the property offset.
    Property(CachedLookup),
    /// The binding lives in the declarative environment at this index.
    Binding(u32),
}

/// Cache for global-variable accesses. Global bindings can be re-homed
/// across environment records, so hits additionally require the recorded
/// environment serial number to match.
#[derive(Debug, Clone, Default)]
pub struct GlobalVariableCache {
    pub cache: PropertyLookupCache,
    pub environment_serial_number: u64,
    pub environment_binding_index: Option<u32>,
}

impl GlobalVariableCache {
    pub fn find(
        &self,
        heap: &Heap,
        environment_serial_number: u64,
        global_shape: Handle<Shape>,
    ) -> Option<GlobalLookup> {
        if self.environment_serial_number != environment_serial_number {
            return None;
        }
        if let Some(hit) = self.cache.find(heap, global_shape) {
            return Some(GlobalLookup::Property(hit));
        }
        self.environment_binding_index.map(GlobalLookup::Binding)
    }

    pub fn record_property(
        &mut self,
        heap: &Heap,
        environment_serial_number: u64,
        global_shape: Handle<Shape>,
        offset: u32,
    ) {
        self.environment_serial_number = environment_serial_number;
        self.environment_binding_index = None;
        self.cache.record_own(heap, global_shape, offset);
    }

    pub fn record_binding(
        &mut self,
        environment_serial_number: u64,
        index: u32,
    ) {
        self.environment_serial_number = environment_serial_number;
        self.environment_binding_index = Some(index);
    }
}

/// Memoizes the shape (and precomputed property offsets) an object literal
/// instantiated to, so re-instantiating the same literal skips the
/// transition walk.
#[derive(Debug, Clone, Default)]
pub struct ObjectShapeCache {
    shape: Option<Weak<Shape>>,
    shape_generation: u64,
    property_offsets: Vec<u32>,
}

impl ObjectShapeCache {
    pub fn get(&self, heap: &Heap) -> Option<(Handle<Shape>, &[u32])> {
        let shape = self.shape?.upgrade(heap)?;
        if heap.get(shape).generation() != self.shape_generation {
            return None;
        }
        Some((shape, &self.property_offsets))
    }

    pub fn populate(
        &mut self,
        heap: &Heap,
        shape: Handle<Shape>,
        property_offsets: Vec<u32>,
    ) {
        self.shape = Some(heap.make_weak(shape));
        self.shape_generation = heap.get(shape).generation();
        self.property_offsets = property_offsets;
    }
}

/// Caches the template object a call site materialized; goes stale
/// harmlessly when the object is collected.
#[derive(Debug, Clone, Default)]
pub struct TemplateObjectCache {
    object: Option<WeakCell>,
}

impl TemplateObjectCache {
    pub fn get(&self, heap: &Heap) -> Option<CellId> {
        self.object?.resolve(heap)
    }

    pub fn set(&mut self, heap: &Heap, object: CellId) {
        self.object = Some(heap.make_weak_cell(object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionType, Heap, Root};

    fn shape_with_property(
        heap: &mut Heap,
        name: &str,
    ) -> (Handle<Shape>, Root, u32) {
        let mut shape = Shape::new();
        let offset = shape.add_property(name);
        let shape = heap.allocate(shape);
        let root = heap.root(shape);
        (shape, root, offset)
    }

    #[test]
    fn a_miss_populates_and_the_next_lookup_hits() {
        let mut heap = Heap::new();
        let (shape, _root, offset) = shape_with_property(&mut heap, "x");

        let mut cache = PropertyLookupCache::default();
        assert_eq!(cache.find(&heap, shape), None, "cold cache must miss");

        cache.record_own(&heap, shape, offset);
        assert_eq!(
            cache.find(&heap, shape),
            Some(CachedLookup::Own { offset })
        );
    }

    #[test]
    fn the_history_is_most_recently_used_first() {
        let mut heap = Heap::new();
        let mut shapes = Vec::new();
        for name in ["a", "b", "c", "d", "e"] {
            shapes.push(shape_with_property(&mut heap, name));
        }

        let mut cache = PropertyLookupCache::default();
        for (shape, _, offset) in &shapes {
            cache.record_own(&heap, *shape, *offset);
        }

        // The most recent record sits in slot 0.
        let newest = cache.entries[0]
            .shape
            .expect("slot 0 populated")
            .upgrade(&heap);
        assert_eq!(newest, Some(shapes[4].0));

        // The oldest record was pushed out of the 4-entry history.
        assert_eq!(cache.find(&heap, shapes[0].0), None);
        for (shape, _, offset) in &shapes[1..] {
            assert_eq!(
                cache.find(&heap, *shape),
                Some(CachedLookup::Own { offset: *offset })
            );
        }
    }

    #[test]
    fn a_generation_mismatch_forces_the_slow_path() {
        let mut heap = Heap::new();
        let (shape, _root, offset) = shape_with_property(&mut heap, "x");

        let mut cache = PropertyLookupCache::default();
        cache.record_own(&heap, shape, offset);
        assert!(cache.find(&heap, shape).is_some());

        heap.get_mut(shape).add_property("y");
        assert_eq!(
            cache.find(&heap, shape),
            None,
            "an advanced generation must invalidate the entry"
        );

        // The slow path repopulates against the new generation.
        cache.record_own(&heap, shape, offset);
        assert!(cache.find(&heap, shape).is_some());
    }

    #[test]
    fn a_collected_shape_is_a_miss_not_a_dangle() {
        let mut heap = Heap::new();

        let mut cache = PropertyLookupCache::default();
        {
            let mut stale = Shape::new();
            let offset = stale.add_property("x");
            let stale = heap.allocate(stale);
            cache.record_own(&heap, stale, offset);
        }
        heap.collect_garbage(CollectionType::CollectGarbage);

        let (fresh, _root, _) = shape_with_property(&mut heap, "x");
        assert_eq!(cache.find(&heap, fresh), None);
    }

    #[test]
    fn prototype_entries_need_shape_prototype_and_validity() {
        let mut heap = Heap::new();
        let (shape, _shape_root, _) = shape_with_property(&mut heap, "x");

        let prototype = heap.allocate(Shape::new());
        let prototype_root = heap.root(prototype);
        let validity = heap.allocate(PrototypeChainValidity::new());
        let validity_root = heap.root(validity);

        let mut cache = PropertyLookupCache::default();
        cache.record_prototype(&heap, shape, prototype.id(), validity, 3);

        assert_eq!(
            cache.find(&heap, shape),
            Some(CachedLookup::Prototype {
                prototype: prototype.id(),
                offset: 3
            })
        );

        heap.get_mut(validity).invalidate();
        assert_eq!(
            cache.find(&heap, shape),
            None,
            "an invalidated chain token must force the slow path"
        );

        // Re-record against a fresh token, then collect the prototype.
        let fresh_validity = heap.allocate(PrototypeChainValidity::new());
        let _fresh_validity_root = heap.root(fresh_validity);
        cache.record_prototype(&heap, shape, prototype.id(), fresh_validity, 3);
        assert!(cache.find(&heap, shape).is_some());

        drop(prototype_root);
        drop(validity_root);
        heap.collect_garbage(CollectionType::CollectGarbage);
        assert_eq!(
            cache.find(&heap, shape),
            None,
            "a collected prototype must force the slow path"
        );
    }

    #[test]
    fn global_hits_require_a_matching_environment_serial() {
        let mut heap = Heap::new();
        let (global_shape, _root, offset) = shape_with_property(&mut heap, "g");

        let mut cache = GlobalVariableCache::default();
        cache.record_property(&heap, 1, global_shape, offset);

        assert_eq!(
            cache.find(&heap, 1, global_shape),
            Some(GlobalLookup::Property(CachedLookup::Own { offset }))
        );
        assert_eq!(
            cache.find(&heap, 2, global_shape),
            None,
            "a re-homed binding must miss"
        );
    }

    #[test]
    fn global_binding_indices_are_cached_per_serial() {
        let mut heap = Heap::new();
        let (global_shape, _root, _) = shape_with_property(&mut heap, "g");

        let mut cache = GlobalVariableCache::default();
        cache.record_binding(5, 7);

        assert_eq!(
            cache.find(&heap, 5, global_shape),
            Some(GlobalLookup::Binding(7))
        );
        assert_eq!(cache.find(&heap, 6, global_shape), None);
    }

    #[test]
    fn object_shape_caches_memoize_offsets_until_the_shape_changes() {
        let mut heap = Heap::new();

        let mut literal_shape = Shape::new();
        let x = literal_shape.add_property("x");
        let y = literal_shape.add_property("y");
        let shape = heap.allocate(literal_shape);
        let _root = heap.root(shape);

        let mut cache = ObjectShapeCache::default();
        assert!(cache.get(&heap).is_none());

        cache.populate(&heap, shape, vec![x, y]);
        let (cached_shape, offsets) = cache.get(&heap).expect("cache hit");
        assert_eq!(cached_shape, shape);
        assert_eq!(offsets, &[x, y]);

        heap.get_mut(shape).add_property("z");
        assert!(
            cache.get(&heap).is_none(),
            "a changed property set must invalidate the literal cache"
        );
    }

    #[test]
    fn object_shape_caches_self_heal_after_collection() {
        let mut heap = Heap::new();
        let mut cache = ObjectShapeCache::default();
        {
            let shape = heap.allocate(Shape::new());
            cache.populate(&heap, shape, Vec::new());
            assert!(cache.get(&heap).is_some());
        }
        heap.collect_garbage(CollectionType::CollectGarbage);
        assert!(cache.get(&heap).is_none());
    }

    #[test]
    fn template_object_caches_go_stale_when_collected() {
        let mut heap = Heap::new();
        let mut cache = TemplateObjectCache::default();

        let template = heap.allocate(Shape::new());
        cache.set(&heap, template.id());
        assert_eq!(cache.get(&heap), Some(template.id()));

        heap.collect_garbage(CollectionType::CollectGarbage);
        assert_eq!(cache.get(&heap), None);
    }
}
