use itertools::Itertools;
use thiserror::Error;

use crate::gc::{Gc, GcConfig, GcRef, GcTrace};
use crate::table::Table;
use crate::value::{Class, Instance, StrRef, Value};

const FRAME_MAX: usize = 64;
const STACK_MAX: usize = FRAME_MAX * 256;

/// Runtime state the evaluator works against: heap, globals and the value
/// stack. Everything on the stack or in `globals` is a collection root.
pub struct VM {
    gc: Gc,
    stack: Vec<Value>,
    globals: Table,
}

#[derive(Debug, Error, PartialEq)]
pub enum RuntimeError {
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Only instances have properties.")]
    NotAnInstance,
    #[error("Only instances have fields.")]
    NoFields,
    #[error("Superclass must be a class.")]
    InvalidSuperclass,
}

impl VM {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        Self {
            gc: Gc::with_config(config),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
        }
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    pub fn globals(&self) -> &Table {
        &self.globals
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    pub fn peek(&self, distance: usize) -> Option<Value> {
        self.stack.iter().rev().nth(distance).copied()
    }

    /// Interns `name`. Only a miss allocates, so only a miss may collect.
    ///
    /// The result is not rooted; push it or store it somewhere reachable
    /// before the next allocation.
    pub fn intern(&mut self, name: &str) -> StrRef {
        if let Some(key) = self.gc.find_string(name) {
            return key;
        }

        self.maybe_collect();
        self.gc.intern(name)
    }

    fn alloc<T: GcTrace + 'static>(&mut self, object: T) -> GcRef<T> {
        self.maybe_collect();
        self.gc.alloc(object)
    }

    fn maybe_collect(&mut self) {
        if self.gc.should_gc() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.gc.mark_value(value);
        }
        self.gc.mark_table(&self.globals);

        self.gc.collect_garbage();
    }

    pub fn define_global(&mut self, name: StrRef, value: Value) {
        self.globals.set(name, value);
    }

    pub fn get_global(&self, name: StrRef) -> Result<Value, RuntimeError> {
        self.globals
            .get(name)
            .ok_or_else(|| RuntimeError::UndefinedVariable(self.name_of(name)))
    }

    /// Assigns to an existing global. Assigning an undefined one is an error
    /// and leaves it undefined.
    pub fn set_global(&mut self, name: StrRef, value: Value) -> Result<(), RuntimeError> {
        if self.globals.set(name, value) {
            self.globals.delete(name);
            return Err(RuntimeError::UndefinedVariable(self.name_of(name)));
        }

        Ok(())
    }

    pub fn new_class(&mut self, name: StrRef) -> GcRef<Class> {
        self.push(name.into());
        let class = self.alloc(Class::new(name));
        self.pop();
        class
    }

    pub fn define_method(&mut self, class: GcRef<Class>, name: StrRef, method: Value) {
        self.gc.deref_mut(class).methods.set(name, method);
    }

    /// Copies the superclass's methods into `subclass`. Run before the
    /// subclass defines its own methods so those override.
    pub fn inherit(
        &mut self,
        superclass: Value,
        subclass: GcRef<Class>,
    ) -> Result<(), RuntimeError> {
        let superclass = match superclass {
            Value::Class(class) => class,
            _ => return Err(RuntimeError::InvalidSuperclass),
        };

        let methods = self.gc.deref(superclass).methods.clone();
        self.gc.deref_mut(subclass).methods.add_all(&methods);
        Ok(())
    }

    pub fn new_instance(&mut self, class: GcRef<Class>) -> GcRef<Instance> {
        self.push(Value::Class(class));
        let instance = self.alloc(Instance::new(class));
        self.pop();
        instance
    }

    /// Fields shadow methods.
    pub fn get_property(&self, receiver: Value, name: StrRef) -> Result<Value, RuntimeError> {
        let instance = match receiver {
            Value::Instance(instance) => self.gc.deref(instance),
            _ => return Err(RuntimeError::NotAnInstance),
        };

        if let Some(value) = instance.fields.get(name) {
            return Ok(value);
        }

        self.gc
            .deref(instance.class)
            .methods
            .get(name)
            .ok_or_else(|| RuntimeError::UndefinedProperty(self.name_of(name)))
    }

    pub fn set_property(
        &mut self,
        receiver: Value,
        name: StrRef,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match receiver {
            Value::Instance(instance) => {
                self.gc.deref_mut(instance).fields.set(name, value);
                Ok(())
            }
            _ => Err(RuntimeError::NoFields),
        }
    }

    /// `a + b` on strings. The result is interned like any other string.
    pub fn concatenate(&mut self, a: StrRef, b: StrRef) -> StrRef {
        let chars = {
            let a = self.gc.deref(a.string()).as_str();
            let b = self.gc.deref(b.string()).as_str();
            String::with_capacity(a.len() + b.len()) + a + b
        };

        if let Some(key) = self.gc.find_string(&chars) {
            return key;
        }

        self.maybe_collect();
        self.gc.take_string(chars)
    }

    /// Drops every global and stack slot, then collects.
    pub fn reset(&mut self) {
        log::debug!(target: "vm", "reset with {} globals", self.globals.len());

        self.stack.clear();
        self.globals.free();
        self.collect_garbage();
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals
            .iter()
            .map(|(name, _)| self.name_of(name))
            .sorted()
            .collect()
    }

    pub fn display(&self, value: Value) -> String {
        self.gc.display(&value).to_string()
    }

    fn name_of(&self, name: StrRef) -> String {
        self.gc.deref(name.string()).as_str().to_owned()
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}
