//! Execution contexts: per-call records of registers, locals, constants and
//! arguments, allocated from a size-classed free-list pool instead of the
//! garbage-collected heap.
//!
//! Call frames are extremely short-lived and allocation-frequency-dominated,
//! so their storage is explicitly paired allocate/deallocate. The collector
//! only ever walks a context's *contents* through its [`Visitable`] impl.

use log::trace;

use crate::{AllocationError, Value, Visitable, Visitor};

/// Tail-slot size classes. A tail rounds up to the smallest class that
/// fits; larger tails bypass pooling entirely.
pub const CONTEXT_SIZE_CLASSES: [usize; 6] = [4, 16, 64, 128, 256, 512];

/// One function activation: fixed header links plus a tail of value slots
/// whose length is fixed at allocation time.
pub struct ExecutionContext {
    pub function: Value,
    pub realm: Value,
    pub lexical_environment: Value,
    pub variable_environment: Value,
    pub this_value: Value,
    pub executable: Value,
    pub program_counter: usize,
    slots: Box<[Value]>,
    tail_len: usize,
    arguments_offset: usize,
    argument_count: usize,
}

impl ExecutionContext {
    /// Total number of tail slots requested at allocation.
    #[inline]
    pub fn tail_len(&self) -> usize {
        self.tail_len
    }

    #[inline]
    pub fn arguments_offset(&self) -> usize {
        self.arguments_offset
    }

    #[inline]
    pub fn argument_count(&self) -> usize {
        self.argument_count
    }

    /// The non-argument part of the tail.
    #[inline]
    pub fn registers_constants_and_locals(&self) -> &[Value] {
        &self.slots[..self.arguments_offset]
    }

    #[inline]
    pub fn registers_constants_and_locals_mut(&mut self) -> &mut [Value] {
        &mut self.slots[..self.arguments_offset]
    }

    #[inline]
    pub fn arguments(&self) -> &[Value] {
        &self.slots[self.arguments_offset..self.arguments_offset + self.argument_count]
    }

    #[inline]
    pub fn arguments_mut(&mut self) -> &mut [Value] {
        &mut self.slots[self.arguments_offset..self.arguments_offset + self.argument_count]
    }

    /// The whole tail.
    #[inline]
    pub fn slots(&self) -> &[Value] {
        &self.slots[..self.tail_len]
    }

    #[inline]
    pub fn slots_mut(&mut self) -> &mut [Value] {
        &mut self.slots[..self.tail_len]
    }

    #[cfg(test)]
    fn storage_ptr(&self) -> *const Value {
        self.slots.as_ptr()
    }
}

impl Visitable for ExecutionContext {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.function.visit_edges(visitor);
        self.realm.visit_edges(visitor);
        self.lexical_environment.visit_edges(visitor);
        self.variable_environment.visit_edges(visitor);
        self.this_value.visit_edges(visitor);
        self.executable.visit_edges(visitor);
        self.slots().visit_edges(visitor);
    }
}

/// Free-list cache of context tail storage, one list per size class.
///
/// This allocator is not garbage-collected; storage cycles through explicit
/// allocate/deallocate pairs and never migrates between classes.
pub struct ExecutionContextAllocator {
    pools: Vec<Vec<Box<[Value]>>>,
    live_slots: usize,
    slot_budget: Option<usize>,
}

impl Default for ExecutionContextAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContextAllocator {
    pub fn new() -> Self {
        Self {
            pools: CONTEXT_SIZE_CLASSES.iter().map(|_| Vec::new()).collect(),
            live_slots: 0,
            slot_budget: None,
        }
    }

    /// Cap the number of outstanding tail slots; `try_allocate` fails past
    /// it.
    pub fn with_budget(slot_budget: usize) -> Self {
        Self {
            slot_budget: Some(slot_budget),
            ..Self::new()
        }
    }

    fn class_index(tail_len: usize) -> Option<usize> {
        CONTEXT_SIZE_CLASSES.iter().position(|&class| tail_len <= class)
    }

    /// Allocate a call frame with the given tail shape. Panics on budget
    /// exhaustion; use [`Self::try_allocate`] for the fallible path.
    pub fn allocate(
        &mut self,
        registers_and_locals: usize,
        constants: usize,
        arguments: usize,
    ) -> ExecutionContext {
        match self.try_allocate(registers_and_locals, constants, arguments) {
            Ok(context) => context,
            Err(error) => panic!("{}", error),
        }
    }

    pub fn try_allocate(
        &mut self,
        registers_and_locals: usize,
        constants: usize,
        arguments: usize,
    ) -> Result<ExecutionContext, AllocationError> {
        let tail_len = registers_and_locals + constants + arguments;
        let slots = self.take_storage(tail_len)?;
        Ok(ExecutionContext {
            function: Value::empty(),
            realm: Value::empty(),
            lexical_environment: Value::empty(),
            variable_environment: Value::empty(),
            this_value: Value::empty(),
            executable: Value::empty(),
            program_counter: 0,
            slots,
            tail_len,
            arguments_offset: registers_and_locals + constants,
            argument_count: arguments,
        })
    }

    /// Duplicate a frame for re-entrant execution. Header fields and all
    /// tail slots are copied verbatim; the argument sub-span keeps its
    /// relative offset in the new tail.
    pub fn copy(&mut self, context: &ExecutionContext) -> ExecutionContext {
        match self.try_copy(context) {
            Ok(copy) => copy,
            Err(error) => panic!("{}", error),
        }
    }

    pub fn try_copy(
        &mut self,
        context: &ExecutionContext,
    ) -> Result<ExecutionContext, AllocationError> {
        let mut slots = self.take_storage(context.tail_len)?;
        slots[..context.tail_len].copy_from_slice(&context.slots[..context.tail_len]);
        Ok(ExecutionContext {
            function: context.function,
            realm: context.realm,
            lexical_environment: context.lexical_environment,
            variable_environment: context.variable_environment,
            this_value: context.this_value,
            executable: context.executable,
            program_counter: context.program_counter,
            slots,
            tail_len: context.tail_len,
            arguments_offset: context.arguments_offset,
            argument_count: context.argument_count,
        })
    }

    /// Return a frame's tail storage to its size class. Oversized tails
    /// bypass the pool and are freed directly.
    pub fn deallocate(&mut self, context: ExecutionContext) {
        let mut storage = context.slots;
        self.live_slots -= storage.len();
        match CONTEXT_SIZE_CLASSES
            .iter()
            .position(|&class| class == storage.len())
        {
            Some(class) => {
                // Pooled storage must not keep cells reachable or leak
                // stale frame state into the next activation.
                storage.fill(Value::empty());
                self.pools[class].push(storage);
            }
            None => {
                trace!("freeing oversized context tail ({} slots)", storage.len());
            }
        }
    }

    fn take_storage(
        &mut self,
        tail_len: usize,
    ) -> Result<Box<[Value]>, AllocationError> {
        let storage_len = match Self::class_index(tail_len) {
            Some(class) => CONTEXT_SIZE_CLASSES[class],
            None => tail_len,
        };

        if let Some(budget) = self.slot_budget {
            if self.live_slots + storage_len > budget {
                return Err(AllocationError::ContextPoolExhausted {
                    requested: storage_len,
                    budget,
                });
            }
        }
        self.live_slots += storage_len;

        if let Some(class) = Self::class_index(tail_len) {
            if let Some(storage) = self.pools[class].pop() {
                return Ok(storage);
            }
        }
        Ok(vec![Value::empty(); storage_len].into_boxed_slice())
    }

    /// Number of tail slots currently handed out.
    pub fn live_slots(&self) -> usize {
        self.live_slots
    }

    /// Number of storages waiting on the free lists.
    pub fn pooled_storages(&self) -> usize {
        self.pools.iter().map(Vec::len).sum()
    }
}
