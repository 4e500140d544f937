//! # Call Dispatcher
//!
//! Resolves a decoded envelope to a constructor, an instance method or a static
//! function, invokes it, and builds the response. Dispatch never waits on a
//! pending result and never raises: every failure past decoding becomes
//! `data.e`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use vrpc::Envelope;
use vrpc::Outcome;
use vrpc::Response;
use vrpc::Sentinel;

use crate::class::ClassDescriptor;
use crate::class::ClassRegistry;
use crate::correlation::Completion;
use crate::correlation::Correlator;
use crate::correlation::Release;
use crate::correlation::panic_message;
use crate::instance;
use crate::instance::Instance;
use crate::instance::InstanceRegistry;
use crate::native::Arg;
use crate::native::Args;
use crate::native::Reply;

/// Logical failures. The `Display` text is the wire `data.e` and callers
/// match on the first two verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Could not find targetId: {0}")]
    TargetNotFound(String),
    #[error("Could not find function: {0}")]
    MethodNotFound(String),
    #[error("{0}")]
    ConstructionFailed(String),
    #[error("{0}")]
    InvocationFailed(String),
    /// A hand-built envelope that `vrpc::decode` would have rejected.
    #[error("{0}")]
    InvalidEnvelope(String),
}

impl From<instance::Error> for Error {
    fn from(e: instance::Error) -> Self {
        match e {
            instance::Error::TargetNotFound(id) => Self::TargetNotFound(id),
            instance::Error::ConstructionFailed(msg) => Self::ConstructionFailed(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Dispatcher {
    classes: Arc<ClassRegistry>,
    instances: Arc<InstanceRegistry>,
    correlator: Arc<Correlator>,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(
        classes: Arc<ClassRegistry>,
        instances: Arc<InstanceRegistry>,
        correlator: Arc<Correlator>,
        runtime: Handle,
    ) -> Self {
        Self {
            classes,
            instances,
            correlator,
            runtime,
        }
    }

    /// Always returns a response with exactly one of `r` / `e`. Promise
    /// completions are let through when this returns.
    pub fn dispatch(&self, request: &Envelope) -> Response {
        let (response, _release) = self.dispatch_held(request);
        response
    }

    /// Like [`Dispatcher::dispatch`], but completions of promises minted by
    /// this call wait until the returned [`Release`] is dropped.
    pub fn dispatch_held(&self, request: &Envelope) -> (Response, Release) {
        tracing::debug!(target_id = %request.target_id, method = %request.method, "dispatch");
        let mut release = Release::new();
        let outcome = match self.route(request, &mut release) {
            Ok(completion) => Outcome::Ok(completion.into_wire()),
            Err(e) => {
                tracing::debug!(target_id = %request.target_id, method = %request.method, "call failed: {}", e);
                Outcome::Err(e.to_string())
            }
        };
        (Response::with_outcome(request, outcome), release)
    }

    fn route(&self, request: &Envelope, release: &mut Release) -> Result<Completion> {
        request
            .validate()
            .map_err(|e| Error::InvalidEnvelope(e.to_string()))?;
        if request.is_create() {
            return self.create(&request.target_id, request.args()).map(|id| Completion::Immediate(Value::String(id)));
        }
        if request.is_delete() {
            self.destroy(&request.target_id)?;
            return Ok(Completion::Immediate(Value::Bool(true)));
        }

        // Instance ids always carry a suffix, so they never shadow a class name.
        match self.instances.get(&request.target_id) {
            Ok(instance) => self.invoke_method(&instance, request, release),
            Err(_) => match self.classes.get(&request.target_id) {
                Ok(class) => self.invoke_static(&class, request, release),
                Err(_) => Err(Error::TargetNotFound(request.target_id.clone())),
            },
        }
    }

    /// Constructs an instance; callback arguments are bound to the new id.
    pub fn create(&self, class_name: &str, values: Vec<Value>) -> Result<String> {
        let mut minted = None;
        let result = self.instances.create(class_name, |id| {
            minted = Some(id.clone());
            self.rewrite(id.as_str(), values)
        });
        if let (Err(_), Some(id)) = (&result, minted) {
            // The constructor may have bound callbacks to an id that never went live.
            self.correlator.release_owner(id.as_str());
        }
        Ok(result?.into())
    }

    /// Destroys an instance and invalidates the callbacks it owns.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let instance = self.instances.destroy(id)?;
        self.correlator.release_owner(instance.id().as_str());
        Ok(())
    }

    fn invoke_method(
        &self,
        instance: &Instance,
        request: &Envelope,
        release: &mut Release,
    ) -> Result<Completion> {
        let method = instance
            .class()
            .method(&request.method)
            .ok_or_else(|| Error::MethodNotFound(request.method.clone()))?;
        let args = self.rewrite(instance.id().as_str(), request.args());
        let reply = guarded(|| method(instance.object(), &args))?;
        Ok(self.settle(request, reply, release))
    }

    fn invoke_static(
        &self,
        class: &ClassDescriptor,
        request: &Envelope,
        release: &mut Release,
    ) -> Result<Completion> {
        let function = class
            .static_fn(&request.method)
            .ok_or_else(|| Error::MethodNotFound(request.method.clone()))?;
        let args = self.rewrite(class.name(), request.args());
        let reply = guarded(|| function(&args))?;
        Ok(self.settle(request, reply, release))
    }

    /// Replaces every top-level callback sentinel with a live callback owned by `owner`.
    fn rewrite(&self, owner: &str, values: Vec<Value>) -> Args {
        let args = values
            .into_iter()
            .map(|value| match Sentinel::from_value(&value) {
                Some(Sentinel::Callback(name)) => Arg::Callback(self.correlator.bind_callback(owner, &name)),
                _ => Arg::Value(value),
            })
            .collect();
        Args::new(args)
    }

    /// Turns a native reply into the value sent back now.
    fn settle(&self, request: &Envelope, reply: Reply, release: &mut Release) -> Completion {
        match reply {
            Reply::Value(value) => Completion::Immediate(value),
            Reply::Future(future) => {
                let sentinel = self.correlator.mint_promise(&request.target_id, &request.method);
                self.correlator.track(&self.runtime, sentinel.clone(), future, release);
                Completion::Pending(sentinel)
            }
        }
    }
}

/// Runs native code, turning both errors and panics into `InvocationFailed`.
fn guarded<F>(f: F) -> Result<Reply>
where
    F: FnOnce() -> anyhow::Result<Reply>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(Error::InvocationFailed(e.to_string())),
        Err(panic) => Err(Error::InvocationFailed(panic_message(panic))),
    }
}
