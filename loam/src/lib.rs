mod cache;
mod cell;
mod context;
mod heap;
mod shape;
mod value;
mod visitor;
mod weak;

pub use cache::{
    CacheEntry, CacheKind, CachedLookup, GlobalLookup, GlobalVariableCache,
    INLINE_CACHE_HISTORY, ObjectShapeCache, PropertyLookupCache,
    TemplateObjectCache,
};
pub use cell::{CellId, CellState, Handle, HeapObject};
pub use context::{
    CONTEXT_SIZE_CLASSES, ExecutionContext, ExecutionContextAllocator,
};
pub use heap::{
    AllocationError, BLOCK_SIZE, CELL_SIZE_CLASSES, CollectionType,
    GarbageCollectionStats, Heap, HeapSettings, Root,
};
pub use shape::{PrototypeChainValidity, Shape};
pub use value::{
    BOXED_PAYLOAD_BITS, BOXED_TAG_BITS, BOXED_TAG_PATTERN, BoxedTag,
    CANON_NAN_BITS, CELL_TAG_BITS, CELL_TAG_PATTERN, MAX_PAYLOAD_BITS,
    NEGATIVE_INFINITY_BITS, NEGATIVE_ZERO_BITS, POSITIVE_INFINITY_BITS,
    SUBNORMAL_PATTERN, TAG_PATTERN, Value,
};
pub use visitor::{Visitable, Visitor};
pub use weak::{Weak, WeakCell};
