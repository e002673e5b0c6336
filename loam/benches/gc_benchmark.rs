//! Run with:
//!   cargo bench --bench gc_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use loam::{
    CollectionType, ExecutionContextAllocator, Heap, HeapObject,
    PropertyLookupCache, Shape, Value, Visitable, Visitor,
};

struct Node {
    children: Vec<Value>,
}

impl Visitable for Node {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.children.visit_edges(visitor);
    }
}

impl HeapObject for Node {
    fn class_name(&self) -> &'static str {
        "Node"
    }
}

fn bench_value_roundtrip(c: &mut Criterion) {
    c.bench_function("value_double_roundtrip", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for i in 0..1024 {
                let v = Value::from_f64(black_box(i as f64 * 1.5));
                if v.is_double() {
                    sum += v.as_double();
                }
            }
            sum
        })
    });

    c.bench_function("value_predicates", |b| {
        let values = [
            Value::from_f64(3.25),
            Value::from_i32(7),
            Value::undefined(),
            Value::from_bool(true),
            Value::null(),
        ];
        b.iter(|| {
            let mut cells = 0usize;
            for v in black_box(values) {
                cells += v.is_cell() as usize;
                cells += v.is_double() as usize;
                cells += v.is_other_boxed_value() as usize;
            }
            cells
        })
    });
}

fn bench_allocate_and_collect(c: &mut Criterion) {
    c.bench_function("allocate_chain_and_collect", |b| {
        b.iter(|| {
            let mut heap = Heap::new();
            let mut previous: Option<Value> = None;
            let mut head = None;
            for _ in 0..256 {
                let node = heap.allocate(Node {
                    children: previous.into_iter().collect(),
                });
                previous = Some(node.as_value());
                head = Some(node);
            }
            let _root = heap.root(head.unwrap());
            let stats = heap.collect_garbage(CollectionType::CollectGarbage);
            black_box(stats.live_cells)
        })
    });
}

fn bench_context_pool(c: &mut Criterion) {
    c.bench_function("context_pool_churn", |b| {
        let mut allocator = ExecutionContextAllocator::new();
        b.iter(|| {
            for _ in 0..64 {
                let context = allocator.allocate(black_box(8), 4, 3);
                allocator.deallocate(context);
            }
            allocator.pooled_storages()
        })
    });
}

fn bench_inline_cache(c: &mut Criterion) {
    c.bench_function("property_cache_hit", |b| {
        let mut heap = Heap::new();
        let mut shape = Shape::new();
        let offset = shape.add_property("x");
        let shape = heap.allocate(shape);
        let _root = heap.root(shape);

        let mut cache = PropertyLookupCache::default();
        cache.record_own(&heap, shape, offset);

        b.iter(|| cache.find(black_box(&heap), shape))
    });

    c.bench_function("property_cache_miss_and_update", |b| {
        let mut heap = Heap::new();
        let mut shape = Shape::new();
        let offset = shape.add_property("x");
        let shape = heap.allocate(shape);
        let _root = heap.root(shape);

        b.iter(|| {
            let mut cache = PropertyLookupCache::default();
            let miss = cache.find(&heap, shape);
            cache.record_own(&heap, shape, offset);
            (miss, cache.find(&heap, shape))
        })
    });
}

criterion_group!(
    benches,
    bench_value_roundtrip,
    bench_allocate_and_collect,
    bench_context_pool,
    bench_inline_cache
);
criterion_main!(benches);
