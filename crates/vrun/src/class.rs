//! # Class Registry
//!
//! A class is registered as data: a name, a constructor and two tables of
//! named callables (instance methods and static functions). Nothing is
//! discovered by reflection; [`ClassBuilder`] is the capability contract a host
//! fills in for each type it wants to expose.

use std::any::Any;
use std::any::type_name;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use thiserror::Error;
use vrpc::envelope::RESERVED_PREFIX;

use crate::native::Args;
use crate::native::Reply;

#[derive(Error, Debug)]
pub enum Error {
    #[error("class name must not be empty")]
    EmptyName,
    #[error("class '{0}' has no constructor")]
    MissingConstructor(String),
    #[error("'{name}' on class '{class}' uses the reserved prefix '__'")]
    ReservedName { class: String, name: String },
    #[error("Could not find targetId: {0}")]
    ClassNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A live native object, type-erased.
pub type Object = Arc<dyn Any + Send + Sync>;

pub(crate) type Constructor = Arc<dyn Fn(&Args) -> anyhow::Result<Object> + Send + Sync>;
pub(crate) type Method = Arc<dyn Fn(&Object, &Args) -> anyhow::Result<Reply> + Send + Sync>;
pub(crate) type StaticFn = Arc<dyn Fn(&Args) -> anyhow::Result<Reply> + Send + Sync>;

/// Immutable description of a registered class.
#[derive(Clone)]
pub struct ClassDescriptor {
    name: String,
    constructor: Constructor,
    methods: HashMap<String, Method>,
    statics: HashMap<String, StaticFn>,
}

impl ClassDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sorted instance method names.
    pub fn method_names(&self) -> Vec<String> {
        sorted_keys(&self.methods)
    }

    /// Sorted static function names.
    pub fn static_names(&self) -> Vec<String> {
        sorted_keys(&self.statics)
    }

    /// Method lookup is exact and case-sensitive.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn has_static(&self, name: &str) -> bool {
        self.statics.contains_key(name)
    }

    pub(crate) fn construct(&self, args: &Args) -> anyhow::Result<Object> {
        (self.constructor)(args)
    }

    pub(crate) fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub(crate) fn static_fn(&self, name: &str) -> Option<&StaticFn> {
        self.statics.get(name)
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .field("statics", &self.static_names())
            .finish()
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

/// Typed builder for a [`ClassDescriptor`].
///
/// Methods receive `&T`: instances are shared between concurrent calls, so a
/// type that mutates state does so through interior mutability.
///
/// # Example
///
/// ```ignore
/// let class = ClassBuilder::<Counter>::new("Counter")
///     .constructor(|_| Ok(Counter::default()))
///     .method("increment", |c, _| Reply::value(c.increment()))
///     .build()?;
/// ```
pub struct ClassBuilder<T> {
    name: String,
    constructor: Option<Constructor>,
    methods: HashMap<String, Method>,
    statics: HashMap<String, StaticFn>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ClassBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            methods: HashMap::new(),
            statics: HashMap::new(),
            _marker: PhantomData,
        }
    }

    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let constructor: Constructor = Arc::new(move |args: &Args| Ok(Arc::new(f(args)?) as Object));
        self.constructor = Some(constructor);
        self
    }

    /// Adds an instance method. A later method with the same name replaces it.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T, &Args) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        let method: Method = Arc::new(move |object: &Object, args: &Args| {
            let this = object
                .downcast_ref::<T>()
                .ok_or_else(|| anyhow!("instance is not a {}", type_name::<T>()))?;
            f(this, args)
        });
        self.methods.insert(name.into(), method);
        self
    }

    /// Adds a class-level function, callable with the class name as `targetId`.
    pub fn static_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.statics.insert(name.into(), Arc::new(f));
        self
    }

    pub fn build(self) -> Result<ClassDescriptor> {
        if self.name.is_empty() {
            return Err(Error::EmptyName);
        }
        let reserved = self
            .methods
            .keys()
            .chain(self.statics.keys())
            .find(|n| n.starts_with(RESERVED_PREFIX));
        if let Some(name) = reserved {
            return Err(Error::ReservedName {
                class: self.name.clone(),
                name: name.clone(),
            });
        }
        let constructor = self
            .constructor
            .ok_or_else(|| Error::MissingConstructor(self.name.clone()))?;

        Ok(ClassDescriptor {
            name: self.name,
            constructor,
            methods: self.methods,
            statics: self.statics,
        })
    }
}

impl<T: Default + Send + Sync + 'static> ClassBuilder<T> {
    /// Uses `T::default()` as the constructor, ignoring arguments.
    pub fn default_constructor(self) -> Self {
        self.constructor(|_| Ok(T::default()))
    }
}

/// Class name -> descriptor. Registering an existing name replaces it.
#[derive(Default)]
pub struct ClassRegistry {
    classes: DashMap<String, Arc<ClassDescriptor>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the descriptor, returning the one it replaced.
    pub fn register(&self, class: ClassDescriptor) -> Option<Arc<ClassDescriptor>> {
        let name = class.name.clone();
        let previous = self.classes.insert(name.clone(), Arc::new(class));
        if previous.is_some() {
            tracing::info!(class = %name, "class re-registered, previous descriptor replaced");
        } else {
            tracing::info!(class = %name, "class registered");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Result<Arc<ClassDescriptor>> {
        self.classes
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Sorted class names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
