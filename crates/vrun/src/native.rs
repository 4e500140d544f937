//! # Native Call Surface
//!
//! What a registered constructor, method or static function sees (`Args`) and
//! what it hands back (`Reply`). Callback sentinels have already been replaced
//! by live [`Callback`]s by the time native code runs.

use std::fmt;
use std::future::Future;

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use vrpc::envelope::positional_key;

use crate::correlation::Callback;

/// One positional argument after sentinel rewriting.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Callback(Callback),
}

/// Positional arguments, in call order.
#[derive(Debug, Clone, Default)]
pub struct Args(Vec<Arg>);

impl Args {
    pub fn new(args: Vec<Arg>) -> Self {
        Self(args)
    }

    /// Plain values only; nothing is treated as a callback.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().map(Arg::Value).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.0.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arg> {
        self.0.iter()
    }

    /// The plain value at `index`. Fails if it is missing or a callback.
    pub fn value(&self, index: usize) -> anyhow::Result<&Value> {
        match self.0.get(index) {
            Some(Arg::Value(v)) => Ok(v),
            Some(Arg::Callback(_)) => Err(anyhow!("argument {} is a callback, expected a value", positional_key(index))),
            None => Err(anyhow!("missing argument {}", positional_key(index))),
        }
    }

    /// Deserializes the plain value at `index`.
    pub fn get_as<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.value(index)?;
        T::deserialize(value)
            .map_err(|e| anyhow!("argument {} has the wrong type: {}", positional_key(index), e))
    }

    /// Like [`Args::get_as`], but a missing or `null` argument is `None`.
    pub fn opt_as<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<Option<T>> {
        match self.0.get(index) {
            None | Some(Arg::Value(Value::Null)) => Ok(None),
            Some(_) => self.get_as(index).map(Some),
        }
    }

    /// The callback at `index`. Fails if it is missing or a plain value.
    pub fn callback(&self, index: usize) -> anyhow::Result<Callback> {
        match self.0.get(index) {
            Some(Arg::Callback(cb)) => Ok(cb.clone()),
            Some(Arg::Value(_)) => Err(anyhow!("argument {} is not a callback", positional_key(index))),
            None => Err(anyhow!("missing argument {}", positional_key(index))),
        }
    }
}

/// The result of a native call.
pub enum Reply {
    /// Available now; goes straight into `data.r`.
    Value(Value),
    /// Resolves later; the caller gets a promise sentinel instead.
    Future(BoxFuture<'static, anyhow::Result<Value>>),
}

impl Reply {
    pub fn value<T: Serialize>(value: T) -> anyhow::Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    pub fn unit() -> Self {
        Self::Value(Value::Null)
    }

    /// Wraps an async computation. Its output is serialized on completion.
    pub fn future<F, T>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        Self::Future(
            async move {
                let value = future.await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(value)?)
            }
            .boxed(),
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Future(_))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Future(_) => f.write_str("Future(..)"),
        }
    }
}
