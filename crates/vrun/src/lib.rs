//! # vrun
//!
//! Exposes registered native classes as remotely callable targets over the
//! `vrpc` envelope convention.
//!
//! ## Architecture
//!
//! - **Class Registry** ([`class`]): class name -> constructor, methods, static functions.
//! - **Instance Registry** ([`instance`]): generated id -> live object.
//! - **Call Dispatcher** ([`dispatch`]): envelope -> callable -> response, never blocking.
//! - **Async Correlation** ([`correlation`]): promise and callback sentinels, and
//!   the single global channel their results are emitted on.
//! - **Adapter** ([`adapter`]): the JSON-string facade tying the above together.

pub mod adapter;
pub mod class;
pub mod correlation;
pub mod dispatch;
pub mod instance;
pub mod logging;
pub mod native;

pub use adapter::Adapter;
pub use adapter::AdapterBuilder;
pub use class::ClassBuilder;
pub use class::ClassDescriptor;
pub use correlation::Callback;
pub use instance::InstanceId;
pub use native::Arg;
pub use native::Args;
pub use native::Reply;
