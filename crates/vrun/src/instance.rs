//! # Instance Registry
//!
//! Owns every live native object. Ids are handed out at construction and are
//! never reused within the process: a process-wide counter makes them unique,
//! and a random tail keeps ids from a previous process from matching new ones.

use std::borrow::Borrow;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use thiserror::Error;

use crate::class;
use crate::class::ClassDescriptor;
use crate::class::ClassRegistry;
use crate::class::Object;
use crate::correlation::panic_message;
use crate::native::Args;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not find targetId: {0}")]
    TargetNotFound(String),
    #[error("{0}")]
    ConstructionFailed(String),
}

impl From<class::Error> for Error {
    fn from(e: class::Error) -> Self {
        match e {
            class::Error::ClassNotFound(name) => Self::TargetNotFound(name),
            other => Self::ConstructionFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Strong type for instance identifiers (`<Class>-<n>-<hex>`).
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    fn generate(class: &str) -> Self {
        let seq = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{}-{:08x}", class, seq, rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for InstanceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

/// A live object and the class it was built from.
#[derive(Clone)]
pub struct Instance {
    id: InstanceId,
    class: Arc<ClassDescriptor>,
    object: Object,
}

impl Instance {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    pub(crate) fn object(&self) -> &Object {
        &self.object
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("class", &self.class.name())
            .finish()
    }
}

/// InstanceId -> live instance.
///
/// An instance is inserted only after its constructor returned, and removed in
/// one step, so a concurrent lookup sees it either fully live or absent.
pub struct InstanceRegistry {
    classes: Arc<ClassRegistry>,
    instances: DashMap<InstanceId, Instance>,
}

impl InstanceRegistry {
    pub fn new(classes: Arc<ClassRegistry>) -> Self {
        Self {
            classes,
            instances: DashMap::new(),
        }
    }

    /// Constructs an instance of `class_name`.
    ///
    /// The id is minted before the constructor runs so that `args` can bind
    /// callbacks to it; if construction fails the id is simply never used.
    pub fn create<F>(&self, class_name: &str, args: F) -> Result<InstanceId>
    where
        F: FnOnce(&InstanceId) -> Args,
    {
        let class = self.classes.get(class_name)?;
        let id = InstanceId::generate(class.name());
        let args = args(&id);

        let object = match std::panic::catch_unwind(AssertUnwindSafe(|| class.construct(&args))) {
            Ok(Ok(object)) => object,
            Ok(Err(e)) => return Err(Error::ConstructionFailed(e.to_string())),
            Err(panic) => return Err(Error::ConstructionFailed(panic_message(panic))),
        };

        self.instances.insert(id.clone(), Instance {
            id: id.clone(),
            class,
            object,
        });
        tracing::info!(class = class_name, id = %id, "instance created");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Instance> {
        self.instances
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Removes the instance. Unknown ids are `TargetNotFound`, like method calls.
    pub fn destroy(&self, id: &str) -> Result<Instance> {
        let (_, instance) = self
            .instances
            .remove(id)
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))?;
        tracing::info!(class = instance.class.name(), id, "instance destroyed");
        Ok(instance)
    }

    /// Sorted ids of live instances of `class_name`.
    pub fn ids_of(&self, class_name: &str) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|e| e.value().class.name() == class_name)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
