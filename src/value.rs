use std::any::Any;
use std::fmt::{self, Display};
use std::mem;

use crate::gc::{Gc, GcRef, GcTrace};
use crate::table::Table;

/// 32-bit FNV-1a.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash = 2166136261u32;
    for &byte in chars.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug)]
pub struct LoxString {
    pub chars: String,
    pub hash: u32,
}

impl LoxString {
    pub fn new(chars: String) -> Self {
        let hash = hash_string(&chars);
        Self { chars, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

impl GcTrace for LoxString {
    fn format(&self, f: &mut fmt::Formatter, _gc: &Gc) -> fmt::Result {
        write!(f, "{}", self.chars)
    }

    fn size(&self) -> usize {
        mem::size_of::<LoxString>() + self.chars.capacity()
    }

    fn trace(&self, _gc: &mut Gc) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An interned string: identity of the heap string plus its hash.
///
/// Two `StrRef`s are equal only when they point at the same object. Content
/// equality is settled once, by [`Gc::intern`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StrRef {
    string: GcRef<LoxString>,
    hash: u32,
}

impl StrRef {
    pub(crate) fn new(string: GcRef<LoxString>, hash: u32) -> Self {
        Self { string, hash }
    }

    pub fn string(&self) -> GcRef<LoxString> {
        self.string
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(StrRef),
    Class(GcRef<Class>),
    Instance(GcRef<Instance>),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }
}

impl GcTrace for Value {
    fn format(&self, f: &mut fmt::Formatter, gc: &Gc) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{}", value),
            Value::Class(value) => gc.deref(*value).format(f, gc),
            Value::Instance(value) => gc.deref(*value).format(f, gc),
            Value::Nil => write!(f, "nil"),
            Value::Number(value) => write!(f, "{}", value),
            Value::String(value) => gc.deref(value.string()).format(f, gc),
        }
    }

    fn size(&self) -> usize {
        0
    }

    fn trace(&self, gc: &mut Gc) {
        match self {
            Value::Class(value) => gc.mark_object(*value),
            Value::Instance(value) => gc.mark_object(*value),
            Value::String(value) => gc.mark_object(value.string()),
            _ => (),
        }
    }

    fn as_any(&self) -> &dyn Any {
        panic!("Value should not be allocated")
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        panic!("Value should not be allocated")
    }
}

#[derive(Debug)]
pub struct Class {
    pub name: StrRef,
    pub methods: Table,
}

impl Class {
    pub fn new(name: StrRef) -> Self {
        Class {
            name,
            methods: Table::new(),
        }
    }
}

impl GcTrace for Class {
    fn format(&self, f: &mut fmt::Formatter, gc: &Gc) -> fmt::Result {
        let name = gc.deref(self.name.string());
        write!(f, "{}", name.as_str())
    }

    fn size(&self) -> usize {
        mem::size_of::<Self>()
            + self.methods.capacity() * (mem::size_of::<StrRef>() + mem::size_of::<Value>())
    }

    fn trace(&self, gc: &mut Gc) {
        gc.mark_object(self.name.string());
        gc.mark_table(&self.methods);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: GcRef<Class>,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: GcRef<Class>) -> Self {
        Self {
            class,
            fields: Table::new(),
        }
    }
}

impl GcTrace for Instance {
    fn format(&self, f: &mut fmt::Formatter, gc: &Gc) -> fmt::Result {
        let class = gc.deref(self.class);
        let name = gc.deref(class.name.string());
        write!(f, "{} instance", name.as_str())
    }

    fn size(&self) -> usize {
        mem::size_of::<Self>()
            + self.fields.capacity() * (mem::size_of::<StrRef>() + mem::size_of::<Value>())
    }

    fn trace(&self, gc: &mut Gc) {
        gc.mark_object(self.class);
        gc.mark_table(&self.fields);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<StrRef> for Value {
    fn from(s: StrRef) -> Self {
        Self::String(s)
    }
}

/// Formats a heap-backed value. Obtained from [`Gc::display`].
pub struct GcFormatter<'a, T: GcTrace> {
    value: &'a T,
    gc: &'a Gc,
}

impl<'a, T: GcTrace> GcFormatter<'a, T> {
    pub fn new(value: &'a T, gc: &'a Gc) -> Self {
        Self { value, gc }
    }
}

impl<'a, T: GcTrace> Display for GcFormatter<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.format(f, self.gc)
    }
}
