//! # vrpc
//!
//! The wire protocol of the remote-invocation adapter.
//!
//! ## Architecture
//!
//! Every request and response is a JSON envelope `{targetId, method, data}`.
//! Positional arguments travel in `data` as `_1`, `_2`, ...; a response carries
//! exactly one of `data.r` (result) or `data.e` (error message). Asynchronous
//! results never travel in a response: they are announced by a sentinel string
//! and delivered later as an [`Emission`] on the single global channel.
//!
//! This crate is pure data. It knows nothing about classes, instances or tasks;
//! see `vrun` for the dispatcher built on top of it.

pub mod codec;
pub mod emission;
pub mod envelope;
pub mod error;
pub mod sentinel;

pub use codec::decode;
pub use codec::decode_args;
pub use codec::encode;
pub use codec::encode_emission;
pub use emission::Emission;
pub use emission::Payload;
pub use envelope::Envelope;
pub use envelope::Outcome;
pub use envelope::Response;
pub use error::Error;
pub use error::Result;
pub use sentinel::Sentinel;
