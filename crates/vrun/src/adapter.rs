//! # Adapter
//!
//! The facade a transport or language binding talks to. One JSON string in,
//! one JSON string out, plus the global channel for everything that finishes
//! later.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use vrpc::Envelope;
use vrpc::Response;

use crate::class::ClassDescriptor;
use crate::class::ClassRegistry;
use crate::correlation::Correlator;
use crate::correlation::Handler;
use crate::dispatch;
use crate::dispatch::Dispatcher;
use crate::instance::InstanceRegistry;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to start completion runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fluent configuration for an [`Adapter`].
pub struct AdapterBuilder {
    runtime: Option<Handle>,
    worker_threads: usize,
    thread_name: String,
    handler: Option<Handler>,
}

impl AdapterBuilder {
    pub fn new() -> Self {
        Self {
            runtime: None,
            worker_threads: 2,
            thread_name: "vrun-worker".to_string(),
            handler: None,
        }
    }

    /// Runs asynchronous completions on an existing tokio runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Worker threads of the owned runtime, used only when no runtime is given or ambient.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Pre-installs the global callback handler.
    pub fn on_callback(mut self, handler: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Adapter> {
        let (handle, owned) = match self.runtime.or_else(|| Handle::try_current().ok()) {
            Some(handle) => (handle, None),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.worker_threads)
                    .thread_name(self.thread_name)
                    .enable_all()
                    .build()
                    .map_err(Error::Runtime)?;
                tracing::debug!(workers = self.worker_threads, "started owned completion runtime");
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let classes = Arc::new(ClassRegistry::new());
        let instances = Arc::new(InstanceRegistry::new(Arc::clone(&classes)));
        let correlator = Arc::new(Correlator::new());
        if let Some(handler) = self.handler {
            correlator.set_handler(handler);
        }
        let dispatcher = Dispatcher::new(
            Arc::clone(&classes),
            Arc::clone(&instances),
            Arc::clone(&correlator),
            handle,
        );

        Ok(Adapter {
            classes,
            instances,
            correlator,
            dispatcher,
            owned_runtime: owned,
        })
    }
}

impl Default for AdapterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Exposes registered classes as remotely callable targets.
///
/// `Adapter` is `Send + Sync`; share it behind an `Arc` and call it from as
/// many threads as needed. Calls are independent of each other.
pub struct Adapter {
    classes: Arc<ClassRegistry>,
    instances: Arc<InstanceRegistry>,
    correlator: Arc<Correlator>,
    dispatcher: Dispatcher,
    owned_runtime: Option<Runtime>,
}

impl Adapter {
    pub fn builder() -> AdapterBuilder {
        AdapterBuilder::new()
    }

    /// Builds with defaults, on the ambient tokio runtime if there is one.
    pub fn new() -> Result<Self> {
        AdapterBuilder::new().build()
    }

    /// Registers a class, replacing any class of the same name.
    pub fn register(&self, class: ClassDescriptor) {
        self.classes.register(class);
    }

    /// Installs the single global handler. The previous handler, if any, stops
    /// receiving messages.
    pub fn on_callback(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.correlator.set_handler(Arc::new(handler));
    }

    /// Handles one JSON request and returns the JSON response.
    ///
    /// Only structural failures are returned as `Err`. A pending result comes
    /// back as a promise sentinel; its completion is emitted on the channel
    /// only after the response has been encoded.
    pub fn call(&self, json: &str) -> vrpc::Result<String> {
        let request = vrpc::decode(json)?;
        self.respond(&request)
    }

    /// Entry point for dynamic bindings that receive a raw argument list.
    pub fn call_args(&self, args: &[Value]) -> vrpc::Result<String> {
        let request = vrpc::decode_args(args)?;
        self.respond(&request)
    }

    fn respond(&self, request: &Envelope) -> vrpc::Result<String> {
        let (response, release) = self.dispatcher.dispatch_held(request);
        let text = vrpc::encode(&response);
        drop(release);
        text
    }

    pub fn dispatch(&self, request: &Envelope) -> Response {
        self.dispatcher.dispatch(request)
    }

    /// Constructs an instance directly, without going through JSON.
    pub fn create(&self, class: &str, args: Vec<Value>) -> dispatch::Result<String> {
        self.dispatcher.create(class, args)
    }

    /// Destroys an instance directly, invalidating its callbacks.
    pub fn destroy(&self, id: &str) -> dispatch::Result<()> {
        self.dispatcher.destroy(id)
    }

    // ------------------------------------------------------------------------
    //  Introspection
    // ------------------------------------------------------------------------

    pub fn classes(&self) -> Vec<String> {
        self.classes.names()
    }

    pub fn instances(&self, class: &str) -> Vec<String> {
        self.instances.ids_of(class).into_iter().map(String::from).collect()
    }

    pub fn member_functions(&self, class: &str) -> dispatch::Result<Vec<String>> {
        self.classes
            .get(class)
            .map(|c| c.method_names())
            .map_err(|_| dispatch::Error::TargetNotFound(class.to_string()))
    }

    pub fn static_functions(&self, class: &str) -> dispatch::Result<Vec<String>> {
        self.classes
            .get(class)
            .map(|c| c.static_names())
            .map_err(|_| dispatch::Error::TargetNotFound(class.to_string()))
    }

    pub fn pending_promises(&self) -> usize {
        self.correlator.pending_promises()
    }

    pub fn live_callbacks(&self) -> usize {
        self.correlator.live_callbacks()
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned_runtime.take() {
            runtime.shutdown_background();
        }
    }
}
