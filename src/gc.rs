//! Index-based mark/sweep heap.
//!
//! Objects live in a slot vector and are referred to by [`GcRef`] handles.
//! The heap also owns the string-intern table, which holds its keys weakly:
//! after marking, entries whose string was not reached are dropped before the
//! strings themselves are swept.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;

use crate::table::Table;
use crate::value::{hash_string, GcFormatter, LoxString, StrRef, Value};

pub trait GcTrace {
    fn format(&self, f: &mut fmt::Formatter, gc: &Gc) -> fmt::Result;
    fn size(&self) -> usize;
    fn trace(&self, gc: &mut Gc);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct GcRef<T: GcTrace> {
    index: usize,
    _marker: PhantomData<T>,
}

impl<T: GcTrace> GcRef<T> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

impl<T: GcTrace> Copy for GcRef<T> {}

impl<T: GcTrace> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GcTrace> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T: GcTrace> Eq for GcRef<T> {}

impl<T: GcTrace> Hash for GcRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state)
    }
}

impl<T: GcTrace> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({})", self.index)
    }
}

/// Collection tuning.
#[derive(Clone, Copy, Debug)]
pub struct GcConfig {
    /// Bytes that may be allocated before the first collection. Also the floor
    /// for every later threshold.
    pub initial_threshold: usize,
    /// Next threshold is the surviving heap size times this factor.
    pub heap_grow_factor: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_threshold: 1024 * 1024,
            heap_grow_factor: 2,
        }
    }
}

struct GcHeader {
    is_marked: bool,
    size: usize,
    object: Box<dyn GcTrace>,
}

pub struct Gc {
    bytes_allocated: usize,
    next_gc: usize,
    collections: usize,
    free_slots: Vec<usize>,
    objects: Vec<Option<GcHeader>>,
    strings: Table,
    grey_stack: Vec<usize>,
    config: GcConfig,
}

impl Gc {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        Self {
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            collections: 0,
            free_slots: Vec::new(),
            objects: Vec::new(),
            strings: Table::new(),
            grey_stack: Vec::new(),
            config,
        }
    }

    pub fn alloc<T: GcTrace + 'static>(&mut self, object: T) -> GcRef<T> {
        let size = object.size() + mem::size_of::<GcHeader>();
        self.bytes_allocated += size;

        let header = GcHeader {
            is_marked: false,
            size,
            object: Box::new(object),
        };

        let index = match self.free_slots.pop() {
            Some(index) => {
                self.objects[index] = Some(header);
                index
            }
            None => {
                self.objects.push(Some(header));
                self.objects.len() - 1
            }
        };

        #[cfg(feature = "debug_log_gc")]
        log::trace!(target: "gc", "#{} allocate {} bytes", index, size);

        GcRef::new(index)
    }

    /// Returns the interned string with this content, copying it into the
    /// heap if it is not there yet.
    pub fn intern(&mut self, chars: &str) -> StrRef {
        match self.find_string(chars) {
            Some(key) => key,
            None => self.insert_string(chars.to_owned()),
        }
    }

    /// Like [`Gc::intern`] but takes ownership of freshly built content.
    pub fn take_string(&mut self, chars: String) -> StrRef {
        match self.find_string(&chars) {
            Some(key) => key,
            None => self.insert_string(chars),
        }
    }

    /// Looks up already interned content without allocating.
    pub fn find_string(&self, chars: &str) -> Option<StrRef> {
        let objects = &self.objects;
        self.strings
            .find_string(chars, hash_string(chars), |key| {
                deref_in(objects, key.string()).as_str()
            })
    }

    fn insert_string(&mut self, chars: String) -> StrRef {
        let string = LoxString::new(chars);
        let hash = string.hash;
        let key = StrRef::new(self.alloc(string), hash);
        self.strings.set(key, Value::Nil);
        key
    }

    pub fn deref<T: GcTrace + 'static>(&self, reference: GcRef<T>) -> &T {
        deref_in(&self.objects, reference)
    }

    pub fn deref_mut<T: GcTrace + 'static>(&mut self, reference: GcRef<T>) -> &mut T {
        self.objects[reference.index]
            .as_mut()
            .and_then(|header| header.object.as_any_mut().downcast_mut())
            .unwrap_or_else(|| panic!("dangling reference to #{}", reference.index))
    }

    pub fn display<'a, T: GcTrace>(&'a self, value: &'a T) -> GcFormatter<'a, T> {
        GcFormatter::new(value, self)
    }

    pub fn should_gc(&self) -> bool {
        cfg!(feature = "debug_stress_gc") || self.over_threshold()
    }

    fn over_threshold(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Number of completed collection cycles.
    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().flatten().count()
    }

    /// Whether `reference` still points at a live object.
    pub fn contains<T: GcTrace>(&self, reference: GcRef<T>) -> bool {
        matches!(self.objects.get(reference.index), Some(Some(_)))
    }

    pub fn strings(&self) -> &Table {
        &self.strings
    }

    pub fn mark_value(&mut self, value: Value) {
        value.trace(self);
    }

    pub fn mark_object<T: GcTrace>(&mut self, reference: GcRef<T>) {
        // An empty slot here is the object currently being blackened.
        if let Some(header) = self.objects[reference.index].as_mut() {
            if header.is_marked {
                return;
            }

            #[cfg(feature = "debug_log_gc")]
            log::trace!(target: "gc", "#{} mark", reference.index);

            header.is_marked = true;
            self.grey_stack.push(reference.index);
        }
    }

    /// Marks every key and value in `table` as reachable.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.string());
            self.mark_value(value);
        }
    }

    /// Finishes a collection cycle whose roots have already been marked.
    ///
    /// Tracing runs to completion before the intern table drops unreached
    /// strings, and that happens before any object is freed.
    pub fn collect_garbage(&mut self) {
        let before = self.bytes_allocated;
        log::debug!(target: "gc", "-- gc begin");

        self.trace_references();

        let objects = &self.objects;
        let dropped = self
            .strings
            .remove_white(|key| is_marked(objects, key.string()));

        self.sweep();

        self.collections += 1;
        self.next_gc = (self.bytes_allocated * self.config.heap_grow_factor)
            .max(self.config.initial_threshold);

        log::debug!(
            target: "gc",
            "-- gc end #{}: collected {} bytes (from {} to {}), {} strings unreachable, next at {}",
            self.collections,
            before - self.bytes_allocated,
            before,
            self.bytes_allocated,
            dropped,
            self.next_gc
        );
    }

    fn trace_references(&mut self) {
        while let Some(index) = self.grey_stack.pop() {
            self.blacken_object(index);
        }
    }

    fn blacken_object(&mut self, index: usize) {
        #[cfg(feature = "debug_log_gc")]
        log::trace!(target: "gc", "#{} blacken", index);

        if let Some(header) = self.objects[index].take() {
            header.object.trace(self);
            self.objects[index] = Some(header);
        }
    }

    fn sweep(&mut self) {
        for index in 0..self.objects.len() {
            let was_marked = match self.objects[index].as_mut() {
                Some(header) => mem::replace(&mut header.is_marked, false),
                None => continue,
            };

            if !was_marked {
                self.free(index);
            }
        }
    }

    fn free(&mut self, index: usize) {
        if let Some(header) = self.objects[index].take() {
            #[cfg(feature = "debug_log_gc")]
            log::trace!(target: "gc", "#{} free", index);

            self.bytes_allocated -= header.size;
            self.free_slots.push(index);
        }
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

fn deref_in<T: GcTrace + 'static>(objects: &[Option<GcHeader>], reference: GcRef<T>) -> &T {
    objects[reference.index]
        .as_ref()
        .and_then(|header| header.object.as_any().downcast_ref())
        .unwrap_or_else(|| panic!("dangling reference to #{}", reference.index))
}

fn is_marked<T: GcTrace>(objects: &[Option<GcHeader>], reference: GcRef<T>) -> bool {
    objects[reference.index]
        .as_ref()
        .map_or(false, |header| header.is_marked)
}
