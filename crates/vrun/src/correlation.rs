//! # Async Correlation
//!
//! Bridges native asynchronous completions back to a caller that can only
//! listen on one global channel.
//!
//! - **Promises**: a pending [`Reply::Future`](crate::native::Reply) gets a fresh
//!   `__p__` sentinel, returned immediately as the call's result. When the future
//!   finishes, exactly one `{id, data: {r|e}}` message is emitted and the entry
//!   is removed.
//! - **Callbacks**: a `__f__` argument becomes a live [`Callback`] owned by the
//!   target (instance id, or class name for static calls). Every firing emits
//!   `{id, data: {_1, ...}}` until the owner is released.
//!
//! A promise completion is never emitted before the response carrying its
//! sentinel exists: the dispatcher hands back a [`Release`] with the response
//! and completions wait on it.
//!
//! The channel holds at most one handler. Installing a new one replaces the
//! old; fan-out by sentinel id is the consumer's job.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::DashSet;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use vrpc::Emission;
use vrpc::Outcome;
use vrpc::Sentinel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The promise already completed, or never existed.
    #[error("promise {0} is not pending")]
    NotPending(String),
    /// The callback's owner was destroyed.
    #[error("callback {0} is orphaned, its owner is gone")]
    Orphaned(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives every serialized emission.
pub type Handler = Arc<dyn Fn(String) + Send + Sync>;

/// How a call finished from the dispatcher's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Immediate(Value),
    Pending(Sentinel),
}

impl Completion {
    /// The value sent back as `data.r`.
    pub fn into_wire(self) -> Value {
        match self {
            Self::Immediate(v) => v,
            Self::Pending(s) => Value::String(s.literal()),
        }
    }
}

static NEXT_PROMISE: AtomicU64 = AtomicU64::new(1);

struct PendingPromise {
    target_id: String,
    method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CallbackKey {
    owner: String,
    name: String,
}

/// Pending completion table plus the global emission channel.
pub struct Correlator {
    handler: RwLock<Option<Handler>>,
    promises: DashMap<String, PendingPromise>,
    callbacks: DashSet<CallbackKey>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            promises: DashMap::new(),
            callbacks: DashSet::new(),
        }
    }

    /// Installs the global handler, replacing any previous one.
    pub fn set_handler(&self, handler: Handler) {
        let mut guard = self.handler.write().unwrap_or_else(|e| e.into_inner());
        if guard.replace(handler).is_some() {
            tracing::debug!("global callback handler replaced");
        }
    }

    pub fn clear_handler(&self) {
        self.handler.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Serializes and delivers one emission. Never called with a table lock held.
    fn emit(&self, emission: &Emission) {
        let handler = self.handler.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(handler) = handler else {
            tracing::warn!(id = %emission.id, "no callback handler registered, emission dropped");
            return;
        };
        match vrpc::encode_emission(emission) {
            Ok(text) => handler(text),
            Err(e) => tracing::error!(id = %emission.id, "failed to encode emission: {}", e),
        }
    }

    // ------------------------------------------------------------------------
    //  Promises
    // ------------------------------------------------------------------------

    /// Mints a promise sentinel and records it as pending.
    pub fn mint_promise(&self, target_id: &str, method: &str) -> Sentinel {
        let seq = NEXT_PROMISE.fetch_add(1, Ordering::Relaxed);
        let sentinel = Sentinel::Promise(format!("{method}-{seq}"));
        self.promises.insert(sentinel.literal(), PendingPromise {
            target_id: target_id.to_string(),
            method: method.to_string(),
        });
        sentinel
    }

    /// Delivers the one completion of a promise. A second attempt is rejected.
    pub fn complete(&self, sentinel: &Sentinel, outcome: Outcome) -> Result<()> {
        let literal = sentinel.literal();
        let Some((_, pending)) = self.promises.remove(&literal) else {
            tracing::warn!(id = %literal, "completion for a promise that is not pending");
            return Err(Error::NotPending(literal));
        };
        tracing::debug!(
            id = %literal,
            target = %pending.target_id,
            method = %pending.method,
            ok = outcome.is_ok(),
            "promise completed"
        );
        self.emit(&Emission::completed(sentinel, outcome));
        Ok(())
    }

    /// Drives `future` on `runtime` and completes `sentinel` with its result
    /// once `release` has been dropped. Returns immediately.
    pub fn track(
        self: &Arc<Self>,
        runtime: &Handle,
        sentinel: Sentinel,
        future: BoxFuture<'static, anyhow::Result<Value>>,
        release: &mut Release,
    ) {
        let gate = release.hold();
        let correlator = Arc::clone(self);
        runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => Outcome::Ok(value),
                Ok(Err(e)) => Outcome::Err(e.to_string()),
                Err(panic) => Outcome::Err(panic_message(panic)),
            };
            // Closed or fired, the response is out either way.
            let _ = gate.await;
            let _ = correlator.complete(&sentinel, outcome);
        });
    }

    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    pub fn is_pending(&self, sentinel: &Sentinel) -> bool {
        self.promises.contains_key(&sentinel.literal())
    }

    // ------------------------------------------------------------------------
    //  Callbacks
    // ------------------------------------------------------------------------

    /// Makes `name` a live callback owned by `owner`. Binding the same name to
    /// the same owner again keeps the existing entry.
    pub fn bind_callback(self: &Arc<Self>, owner: &str, name: &str) -> Callback {
        let key = CallbackKey {
            owner: owner.to_string(),
            name: name.to_string(),
        };
        self.callbacks.insert(key.clone());
        Callback {
            key,
            correlator: Arc::clone(self),
        }
    }

    /// Invalidates every callback owned by `owner`. Returns how many were dropped.
    pub fn release_owner(&self, owner: &str) -> usize {
        let before = self.callbacks.len();
        self.callbacks.retain(|key| key.owner != owner);
        let released = before.saturating_sub(self.callbacks.len());
        if released > 0 {
            tracing::debug!(owner, released, "callbacks invalidated");
        }
        released
    }

    pub fn live_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    fn fire(&self, key: &CallbackKey, args: Vec<Value>) -> Result<()> {
        let sentinel = Sentinel::Callback(key.name.clone());
        if !self.callbacks.contains(key) {
            tracing::warn!(id = %sentinel, owner = %key.owner, "orphaned callback fired, ignoring");
            return Err(Error::Orphaned(sentinel.literal()));
        }
        self.emit(&Emission::fired(&sentinel, args));
        Ok(())
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// A callback sentinel turned into something native code can call.
///
/// Cloning is cheap; all clones fire the same sentinel. Firings from one
/// thread are emitted in call order.
#[derive(Clone)]
pub struct Callback {
    key: CallbackKey,
    correlator: Arc<Correlator>,
}

impl Callback {
    pub fn sentinel(&self) -> Sentinel {
        Sentinel::Callback(self.key.name.clone())
    }

    /// The instance id or class name this callback belongs to.
    pub fn owner(&self) -> &str {
        &self.key.owner
    }

    /// Emits one `{id, data: {_1, ...}}` message with `args`.
    pub fn call(&self, args: impl IntoIterator<Item = Value>) -> Result<()> {
        self.correlator.fire(&self.key, args.into_iter().collect())
    }

    pub fn is_live(&self) -> bool {
        self.correlator.callbacks.contains(&self.key)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("sentinel", &self.sentinel().literal())
            .field("owner", &self.key.owner)
            .finish()
    }
}

/// Holds back the completions of promises minted during one dispatch.
///
/// Dropping it lets them through. Keep it alive until the response that
/// carries the sentinels has been handed to the caller.
#[must_use]
#[derive(Default)]
pub struct Release {
    gates: Vec<oneshot::Sender<()>>,
}

impl Release {
    pub fn new() -> Self {
        Self::default()
    }

    fn hold(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.push(tx);
        rx
    }

    /// Number of completions currently held back.
    pub fn held(&self) -> usize {
        self.gates.len()
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        for gate in self.gates.drain(..) {
            let _ = gate.send(());
        }
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release").field("held", &self.gates.len()).finish()
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("native code panicked: {detail}")
}
