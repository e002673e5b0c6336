//! The heap owns every cell, grouped into fixed-size blocks per allocation
//! class, and reclaims the unreachable ones with a stop-the-world
//! mark/finalize/sweep cycle.
//!
//! Single-threaded cooperative: all heap mutation happens on the one thread
//! driving the interpreter, so there is no locking. A cycle runs to
//! completion once started; re-entering allocation or collection from a
//! finalizer or visitor is a fatal assertion.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use bitflags::bitflags;
use log::{debug, trace};

use crate::{CellId, CellState, Handle, HeapObject, Visitable, Visitor, Weak, WeakCell};

pub const KIB: usize = 1024;

/// Storage granularity of one block within an allocation class.
pub const BLOCK_SIZE: usize = 16 * KIB;

/// Allocation classes in bytes; a cell lands in the first class that fits.
pub const CELL_SIZE_CLASSES: [usize; 7] = [64, 96, 128, 256, 512, 1024, 3072];

/// Floor for the allocation-volume threshold that triggers a collection.
pub const GC_MIN_BYTES_THRESHOLD: usize = 4 * 1024 * KIB;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct SlotFlags: u8 {
        const LIVE = 1 << 0;
        const MARKED = 1 << 1;
    }
}

/// One cell's storage. The occupant is destroyed at sweep; the generation
/// advances so stale weak references resolve to absent.
struct Slot {
    flags: SlotFlags,
    generation: u32,
    cell: Option<Box<dyn HeapObject>>,
}

struct HeapBlock {
    capacity: usize,
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl HeapBlock {
    fn new(cell_size: usize) -> Self {
        let capacity = BLOCK_SIZE / cell_size;
        Self {
            capacity,
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.free_list.is_empty() && self.slots.len() == self.capacity
    }

    /// Pop a freed slot or commit a fresh one; `None` when full.
    fn allocate_slot(&mut self) -> Option<usize> {
        if let Some(index) = self.free_list.pop() {
            return Some(index as usize);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                flags: SlotFlags::empty(),
                generation: 0,
                cell: None,
            });
            return Some(self.slots.len() - 1);
        }
        None
    }
}

/// All blocks of one allocation class.
struct CellAllocator {
    cell_size: usize,
    blocks: Vec<HeapBlock>,
    usable_blocks: Vec<usize>,
}

impl CellAllocator {
    fn new(cell_size: usize) -> Self {
        Self {
            cell_size,
            blocks: Vec::new(),
            usable_blocks: Vec::new(),
        }
    }

    fn allocate_slot(&mut self) -> (usize, usize) {
        while let Some(&block_index) = self.usable_blocks.last() {
            if let Some(slot_index) = self.blocks[block_index].allocate_slot() {
                if self.blocks[block_index].is_full() {
                    self.usable_blocks.pop();
                }
                return (block_index, slot_index);
            }
            self.usable_blocks.pop();
        }

        let block_index = self.blocks.len();
        self.blocks.push(HeapBlock::new(self.cell_size));
        trace!(
            "new {}-byte heap block #{} ({} cells)",
            self.cell_size,
            block_index,
            self.blocks[block_index].capacity
        );
        let slot_index = self.blocks[block_index]
            .allocate_slot()
            .expect("fresh block has a free slot");
        if !self.blocks[block_index].is_full() {
            self.usable_blocks.push(block_index);
        }
        (block_index, slot_index)
    }
}

/// Resource exhaustion; the only recoverable error this subsystem reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    HeapExhausted { requested: usize, budget: usize },
    ContextPoolExhausted { requested: usize, budget: usize },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapExhausted { requested, budget } => write!(
                f,
                "heap byte budget exhausted: {} requested, {} budget",
                requested, budget
            ),
            Self::ContextPoolExhausted { requested, budget } => write!(
                f,
                "context slot budget exhausted: {} requested, {} budget",
                requested, budget
            ),
        }
    }
}

impl Error for AllocationError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollectionType {
    /// Mark from the root set, then finalize and sweep the rest.
    CollectGarbage,
    /// Skip marking so every cell is finalized and reclaimed. Used on heap
    /// teardown.
    CollectEverything,
}

/// Per-cycle accounting, also logged at debug level.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GarbageCollectionStats {
    pub live_cells: usize,
    pub collected_cells: usize,
    pub live_bytes: usize,
    pub collected_bytes: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Hard cap on live cell bytes; `try_allocate` fails once a forced
    /// collection cannot get back under it.
    pub max_bytes: Option<usize>,
    /// Floor for the allocation-volume collection trigger.
    pub gc_bytes_threshold: usize,
    /// Collect before every allocation. Debug aid.
    pub collect_on_every_allocation: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_bytes: None,
            gc_bytes_threshold: GC_MIN_BYTES_THRESHOLD,
            collect_on_every_allocation: false,
        }
    }
}

#[derive(Default)]
struct RootTable {
    counts: HashMap<CellId, usize, RandomState>,
}

/// RAII registration of a cell in the externally supplied root set. The
/// cell stays a root until the guard drops.
pub struct Root {
    id: CellId,
    table: Rc<RefCell<RootTable>>,
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({:?})", self.id)
    }
}

impl Root {
    pub fn id(&self) -> CellId {
        self.id
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        let mut table = self.table.borrow_mut();
        let last = {
            let count = table
                .counts
                .get_mut(&self.id)
                .expect("root guard without a table entry");
            *count -= 1;
            *count == 0
        };
        if last {
            table.counts.remove(&self.id);
        }
    }
}

/// Collects the edges one cell reports, to be marked after the borrow of
/// the reporting cell ends.
#[derive(Default)]
struct EdgeCollector {
    edges: Vec<CellId>,
}

impl Visitor for EdgeCollector {
    fn visit(&mut self, id: CellId) {
        self.edges.push(id);
    }
}

pub struct Heap {
    settings: HeapSettings,
    allocators: Vec<CellAllocator>,
    roots: Rc<RefCell<RootTable>>,
    live_bytes: usize,
    allocated_bytes_since_gc: usize,
    gc_bytes_threshold: usize,
    collecting: bool,
    gc_deferrals: usize,
    should_gc_when_deferral_ends: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_settings(HeapSettings::default())
    }

    pub fn with_settings(settings: HeapSettings) -> Self {
        let allocators = CELL_SIZE_CLASSES
            .iter()
            .map(|&size| CellAllocator::new(size))
            .collect();
        let gc_bytes_threshold = settings.gc_bytes_threshold;
        Self {
            settings,
            allocators,
            roots: Rc::new(RefCell::new(RootTable::default())),
            live_bytes: 0,
            allocated_bytes_since_gc: 0,
            gc_bytes_threshold,
            collecting: false,
            gc_deferrals: 0,
            should_gc_when_deferral_ends: false,
        }
    }

    fn class_index_for(size: usize) -> usize {
        CELL_SIZE_CLASSES
            .iter()
            .position(|&class| size <= class)
            .unwrap_or_else(|| {
                panic!(
                    "cell size {} exceeds the largest allocation class",
                    size
                )
            })
    }

    /// Allocate a cell. Panics on budget exhaustion; use
    /// [`Heap::try_allocate`] for the fallible path.
    pub fn allocate<T: HeapObject>(&mut self, cell: T) -> Handle<T> {
        match self.try_allocate(cell) {
            Ok(handle) => handle,
            Err(error) => panic!("{}", error),
        }
    }

    pub fn try_allocate<T: HeapObject>(
        &mut self,
        cell: T,
    ) -> Result<Handle<T>, AllocationError> {
        assert!(
            !self.collecting,
            "allocation during a collection cycle"
        );

        let class = Self::class_index_for(size_of::<T>());
        let cell_size = CELL_SIZE_CLASSES[class];

        self.will_allocate(cell_size);

        if let Some(budget) = self.settings.max_bytes {
            if self.live_bytes + cell_size > budget {
                self.collect_garbage(CollectionType::CollectGarbage);
            }
            if self.live_bytes + cell_size > budget {
                return Err(AllocationError::HeapExhausted {
                    requested: cell_size,
                    budget,
                });
            }
        }

        let (block_index, slot_index) = self.allocators[class].allocate_slot();
        let slot =
            &mut self.allocators[class].blocks[block_index].slots[slot_index];
        slot.flags = SlotFlags::LIVE;
        slot.cell = Some(Box::new(cell));
        self.live_bytes += cell_size;

        Ok(Handle::new(CellId::new(class, block_index, slot_index)))
    }

    fn will_allocate(&mut self, size: usize) {
        if self.settings.collect_on_every_allocation {
            self.allocated_bytes_since_gc = 0;
            self.request_collection();
        } else if self.allocated_bytes_since_gc + size > self.gc_bytes_threshold
        {
            self.allocated_bytes_since_gc = 0;
            self.request_collection();
        }
        self.allocated_bytes_since_gc += size;
    }

    fn request_collection(&mut self) {
        if self.gc_deferrals > 0 {
            self.should_gc_when_deferral_ends = true;
            return;
        }
        self.collect_garbage(CollectionType::CollectGarbage);
    }

    fn slot(&self, id: CellId) -> Option<&Slot> {
        self.allocators
            .get(id.class_index())?
            .blocks
            .get(id.block_index())?
            .slots
            .get(id.slot_index())
    }

    fn slot_mut(&mut self, id: CellId) -> Option<&mut Slot> {
        self.allocators
            .get_mut(id.class_index())?
            .blocks
            .get_mut(id.block_index())?
            .slots
            .get_mut(id.slot_index())
    }

    /// Resolve a handle. Resolving a dead or foreign handle is an
    /// invariant violation.
    pub fn get<T: HeapObject>(&self, handle: Handle<T>) -> &T {
        match self.try_get(handle) {
            Some(cell) => cell,
            None => panic!("resolving a dead or foreign handle {:?}", handle),
        }
    }

    pub fn get_mut<T: HeapObject>(&mut self, handle: Handle<T>) -> &mut T {
        match self.try_get_mut(handle) {
            Some(cell) => cell,
            None => panic!("resolving a dead or foreign handle {:?}", handle),
        }
    }

    pub fn try_get<T: HeapObject>(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slot(handle.id())?;
        if !slot.flags.contains(SlotFlags::LIVE) {
            return None;
        }
        let cell = slot.cell.as_ref()?;
        (cell.as_ref() as &dyn Any).downcast_ref::<T>()
    }

    pub fn try_get_mut<T: HeapObject>(
        &mut self,
        handle: Handle<T>,
    ) -> Option<&mut T> {
        let slot = self.slot_mut(handle.id())?;
        if !slot.flags.contains(SlotFlags::LIVE) {
            return None;
        }
        let cell = slot.cell.as_mut()?;
        (cell.as_mut() as &mut dyn Any).downcast_mut::<T>()
    }

    /// Resolve an untyped cell id to a concrete type, e.g. after pulling a
    /// cell payload out of a tagged value.
    pub fn try_get_as<T: HeapObject>(&self, id: CellId) -> Option<&T> {
        self.try_get(Handle::new(id))
    }

    pub fn state(&self, id: CellId) -> Option<CellState> {
        let slot = self.slot(id)?;
        if slot.flags.contains(SlotFlags::LIVE) {
            Some(CellState::Live)
        } else {
            Some(CellState::Dead)
        }
    }

    pub fn is_live(&self, id: CellId) -> bool {
        self.state(id) == Some(CellState::Live)
    }

    /// Register a cell in the root set for as long as the returned guard
    /// lives.
    pub fn root<T: HeapObject>(&self, handle: Handle<T>) -> Root {
        self.root_id(handle.id())
    }

    pub fn root_id(&self, id: CellId) -> Root {
        assert!(self.is_live(id), "rooting a dead cell");
        *self.roots.borrow_mut().counts.entry(id).or_insert(0) += 1;
        Root {
            id,
            table: Rc::clone(&self.roots),
        }
    }

    pub fn make_weak<T: HeapObject>(&self, handle: Handle<T>) -> Weak<T> {
        let slot = self
            .slot(handle.id())
            .expect("weakening an untracked handle");
        assert!(
            slot.flags.contains(SlotFlags::LIVE),
            "weakening a dead cell"
        );
        Weak::new(handle.id(), slot.generation)
    }

    pub fn make_weak_cell(&self, id: CellId) -> WeakCell {
        let slot = self.slot(id).expect("weakening an untracked cell");
        assert!(
            slot.flags.contains(SlotFlags::LIVE),
            "weakening a dead cell"
        );
        WeakCell::new(id, slot.generation)
    }

    pub(crate) fn generation_matches(&self, id: CellId, generation: u32) -> bool {
        match self.slot(id) {
            Some(slot) => {
                slot.flags.contains(SlotFlags::LIVE)
                    && slot.generation == generation
            }
            None => false,
        }
    }

    /// Postpone automatic collections. Nests; an automatic collection
    /// requested while deferred runs when the last deferral ends.
    pub fn defer_gc(&mut self) {
        self.gc_deferrals += 1;
    }

    pub fn undefer_gc(&mut self) {
        assert!(self.gc_deferrals > 0, "undeferring a non-deferred heap");
        self.gc_deferrals -= 1;
        if self.gc_deferrals == 0 {
            if self.should_gc_when_deferral_ends {
                self.should_gc_when_deferral_ends = false;
                self.collect_garbage(CollectionType::CollectGarbage);
            }
        }
    }

    pub fn set_collect_on_every_allocation(&mut self, value: bool) {
        self.settings.collect_on_every_allocation = value;
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn live_cell_count(&self) -> usize {
        let mut count = 0;
        self.for_each_live_slot(|_, _| count += 1);
        count
    }

    fn for_each_live_slot(&self, mut callback: impl FnMut(CellId, &Slot)) {
        for (class, allocator) in self.allocators.iter().enumerate() {
            for (block_index, block) in allocator.blocks.iter().enumerate() {
                for (slot_index, slot) in block.slots.iter().enumerate() {
                    if slot.flags.contains(SlotFlags::LIVE) {
                        callback(
                            CellId::new(class, block_index, slot_index),
                            slot,
                        );
                    }
                }
            }
        }
    }

    /// Run one full stop-the-world cycle. Not interruptible; no interpreter
    /// code runs between mark and sweep.
    pub fn collect_garbage(
        &mut self,
        collection_type: CollectionType,
    ) -> GarbageCollectionStats {
        assert!(!self.collecting, "collection cycle re-entered");

        if collection_type == CollectionType::CollectGarbage
            && self.gc_deferrals > 0
        {
            trace!("collection requested while deferred");
            self.should_gc_when_deferral_ends = true;
            return GarbageCollectionStats::default();
        }

        self.collecting = true;
        let start = Instant::now();

        if collection_type == CollectionType::CollectGarbage {
            let roots = self.gather_roots();
            self.mark_live_cells(&roots);
        }

        self.finalize_unmarked_cells();
        let mut stats = self.sweep_dead_cells();
        stats.duration = start.elapsed();

        self.collecting = false;
        self.allocated_bytes_since_gc = 0;

        debug!(
            "garbage collection: {} live cells ({} bytes), {} collected ({} bytes), {:?}",
            stats.live_cells,
            stats.live_bytes,
            stats.collected_cells,
            stats.collected_bytes,
            stats.duration
        );

        stats
    }

    /// The externally supplied root set: registered root guards plus every
    /// live cell that opts into surviving collection.
    fn gather_roots(&self) -> Vec<CellId> {
        let mut roots: Vec<CellId> =
            self.roots.borrow().counts.keys().copied().collect();

        self.for_each_live_slot(|id, slot| {
            let cell = slot.cell.as_ref().expect("live slot has an occupant");
            if cell.must_survive_garbage_collection() {
                roots.push(id);
            }
        });

        trace!("gather_roots: {} roots", roots.len());
        roots
    }

    fn mark_cell(&mut self, id: CellId, work_queue: &mut Vec<CellId>) {
        let slot = self
            .slot_mut(id)
            .unwrap_or_else(|| panic!("marking an untracked cell {:?}", id));
        assert!(
            slot.flags.contains(SlotFlags::LIVE),
            "marking a dead cell {:?}",
            id
        );
        if slot.flags.contains(SlotFlags::MARKED) {
            return;
        }
        slot.flags.insert(SlotFlags::MARKED);
        work_queue.push(id);
    }

    fn mark_live_cells(&mut self, roots: &[CellId]) {
        let mut work_queue = Vec::with_capacity(roots.len());
        for &root in roots {
            self.mark_cell(root, &mut work_queue);
        }

        let mut collector = EdgeCollector::default();
        while let Some(id) = work_queue.pop() {
            collector.edges.clear();
            {
                let slot = self.slot(id).expect("marked cell has a slot");
                let cell =
                    slot.cell.as_ref().expect("live slot has an occupant");
                cell.visit_edges(&mut collector);
            }
            for index in 0..collector.edges.len() {
                self.mark_cell(collector.edges[index], &mut work_queue);
            }
        }
    }

    /// Run finalizers on every cell about to be reclaimed, before any slot
    /// is reused.
    fn finalize_unmarked_cells(&mut self) {
        for allocator in &mut self.allocators {
            for block in &mut allocator.blocks {
                for slot in &mut block.slots {
                    if slot.flags.contains(SlotFlags::LIVE)
                        && !slot.flags.contains(SlotFlags::MARKED)
                    {
                        slot.cell
                            .as_mut()
                            .expect("live slot has an occupant")
                            .finalize();
                    }
                }
            }
        }
    }

    fn sweep_dead_cells(&mut self) -> GarbageCollectionStats {
        let mut stats = GarbageCollectionStats::default();

        for allocator in &mut self.allocators {
            let cell_size = allocator.cell_size;
            allocator.usable_blocks.clear();

            for (block_index, block) in allocator.blocks.iter_mut().enumerate()
            {
                for (slot_index, slot) in block.slots.iter_mut().enumerate() {
                    if !slot.flags.contains(SlotFlags::LIVE) {
                        continue;
                    }
                    if slot.flags.contains(SlotFlags::MARKED) {
                        slot.flags.remove(SlotFlags::MARKED);
                        stats.live_cells += 1;
                        stats.live_bytes += cell_size;
                    } else {
                        slot.cell = None;
                        slot.flags = SlotFlags::empty();
                        slot.generation = slot.generation.wrapping_add(1);
                        block.free_list.push(slot_index as u32);
                        stats.collected_cells += 1;
                        stats.collected_bytes += cell_size;
                    }
                }
                if !block.is_full() {
                    allocator.usable_blocks.push(block_index);
                }
            }
        }

        self.live_bytes = stats.live_bytes;
        self.gc_bytes_threshold =
            stats.live_bytes.max(self.settings.gc_bytes_threshold);

        stats
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.collecting {
            self.collect_garbage(CollectionType::CollectEverything);
        }
    }
}
