// Nova Garbage Collector
// Cycle detection for Arc-backed containers
//
// Arc handles acyclic lifetimes on its own; this registry tracks the kinds
// that can form reference cycles (lists, tables, instances), marks what is
// reachable from the VM roots, and breaks unreachable cycles by clearing
// their contents.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::value::{Instance, TableKey, Value};

/// GC statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total objects ever tracked
    pub total_tracked: usize,
    /// Total cycles broken
    pub cycles_broken: usize,
    /// Current tracked objects
    pub tracked_count: usize,
    /// Number of GC cycles run
    pub collections: usize,
}

pub type ObjectId = u64;

/// Weak reference to a tracked object.
#[derive(Clone)]
pub enum TrackedObject {
    List(Weak<Mutex<Vec<Value>>>),
    Table(Weak<Mutex<FxHashMap<TableKey, Value>>>),
    Instance(Weak<Mutex<Instance>>),
}

impl TrackedObject {
    /// Still has strong references?
    pub fn is_alive(&self) -> bool {
        match self {
            TrackedObject::List(w) => w.strong_count() > 0,
            TrackedObject::Table(w) => w.strong_count() > 0,
            TrackedObject::Instance(w) => w.strong_count() > 0,
        }
    }

    /// Stable address of the underlying allocation, if still alive.
    fn addr(&self) -> Option<usize> {
        match self {
            TrackedObject::List(w) => w.upgrade().map(|a| Arc::as_ptr(&a) as usize),
            TrackedObject::Table(w) => w.upgrade().map(|a| Arc::as_ptr(&a) as usize),
            TrackedObject::Instance(w) => w.upgrade().map(|a| Arc::as_ptr(&a) as usize),
        }
    }

    /// Clear contents to break cycles.
    fn clear_contents(&self) {
        match self {
            TrackedObject::List(w) => {
                if let Some(arc) = w.upgrade() {
                    arc.lock().clear();
                }
            }
            TrackedObject::Table(w) => {
                if let Some(arc) = w.upgrade() {
                    arc.lock().clear();
                }
            }
            TrackedObject::Instance(w) => {
                if let Some(arc) = w.upgrade() {
                    arc.lock().fields.clear();
                }
            }
        }
    }
}

/// The GC heap: tracks containers for cycle detection.
pub struct GcHeap {
    next_id: u64,
    tracked: FxHashMap<ObjectId, TrackedObject>,
    threshold: usize,
    init_threshold: usize,
    grow_rate: usize,
    pub stats: GcStats,
    collecting: bool,
}

impl GcHeap {
    pub fn new(init_threshold: usize, grow_rate: usize) -> Self {
        Self {
            next_id: 0,
            tracked: FxHashMap::default(),
            threshold: init_threshold,
            init_threshold,
            grow_rate: grow_rate.max(1),
            stats: GcStats::default(),
            collecting: false,
        }
    }

    pub fn should_collect(&self) -> bool {
        !self.collecting && self.tracked.len() > self.threshold
    }

    pub fn track_list(&mut self, list: &Arc<Mutex<Vec<Value>>>) -> ObjectId {
        self.track(TrackedObject::List(Arc::downgrade(list)))
    }

    pub fn track_table(&mut self, table: &Arc<Mutex<FxHashMap<TableKey, Value>>>) -> ObjectId {
        self.track(TrackedObject::Table(Arc::downgrade(table)))
    }

    pub fn track_instance(&mut self, inst: &Arc<Mutex<Instance>>) -> ObjectId {
        self.track(TrackedObject::Instance(Arc::downgrade(inst)))
    }

    fn track(&mut self, obj: TrackedObject) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.tracked.insert(id, obj);
        self.stats.total_tracked += 1;
        self.stats.tracked_count = self.tracked.len();
        id
    }

    /// Run a collection. `roots` are values that are definitely reachable
    /// (stack, module globals, closed upvalues).
    pub fn collect(&mut self, roots: Vec<Value>) {
        if self.collecting {
            return;
        }
        self.collecting = true;

        // Phase 1: drop entries already freed by Arc
        self.cleanup_dead();

        // Phase 2: mark everything reachable from the roots
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut work = roots;
        while let Some(value) = work.pop() {
            Self::trace(&value, &mut visited, &mut work);
        }

        // Phase 3: unreachable-but-alive objects are cycles; clear them
        let broken = self.break_cycles(&visited);

        self.stats.collections += 1;
        self.stats.cycles_broken += broken;
        self.stats.tracked_count = self.tracked.len();

        let new_threshold = self.tracked.len().saturating_mul(self.grow_rate);
        self.threshold = new_threshold.max(self.init_threshold);

        self.collecting = false;
    }

    fn cleanup_dead(&mut self) {
        self.tracked.retain(|_, obj| obj.is_alive());
    }

    fn trace(value: &Value, visited: &mut FxHashSet<usize>, work: &mut Vec<Value>) {
        match value {
            Value::List(list) => {
                if visited.insert(Arc::as_ptr(list) as usize) {
                    for item in list.lock().iter() {
                        work.push(item.clone());
                    }
                }
            }
            Value::Table(table) => {
                if visited.insert(Arc::as_ptr(table) as usize) {
                    for item in table.lock().values() {
                        work.push(item.clone());
                    }
                }
            }
            Value::Instance(inst) => {
                if visited.insert(Arc::as_ptr(inst) as usize) {
                    for field in inst.lock().fields.values() {
                        work.push(field.clone());
                    }
                }
            }
            Value::Tuple(items) => {
                if visited.insert(items.as_ptr() as usize) {
                    for item in items.iter() {
                        work.push(item.clone());
                    }
                }
            }
            Value::Closure(closure) => {
                if visited.insert(Arc::as_ptr(closure) as usize) {
                    for upvalue in closure.upvalues.iter() {
                        if let Some(closed) = &upvalue.lock().closed {
                            work.push((**closed).clone());
                        }
                    }
                }
            }
            Value::Class(class) => {
                if visited.insert(Arc::as_ptr(class) as usize) {
                    for method in class.methods.read().values() {
                        work.push(method.clone());
                    }
                }
            }
            Value::BoundMethod(bm) => {
                if visited.insert(Arc::as_ptr(bm) as usize) {
                    work.push(bm.receiver.clone());
                    work.push(bm.method.clone());
                }
            }
            // Module globals are rooted by the VM directly
            _ => {}
        }
    }

    fn break_cycles(&mut self, visited: &FxHashSet<usize>) -> usize {
        let mut to_clear = Vec::new();
        for (id, obj) in &self.tracked {
            if !obj.is_alive() {
                continue;
            }
            match obj.addr() {
                Some(addr) if !visited.contains(&addr) => to_clear.push(*id),
                _ => {}
            }
        }

        let mut broken = 0;
        for id in to_clear {
            if let Some(obj) = self.tracked.get(&id) {
                obj.clear_contents();
                broken += 1;
            }
        }
        broken
    }

    pub fn get_stats(&self) -> GcStats {
        self.stats.clone()
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new(10_000, 2)
    }
}
