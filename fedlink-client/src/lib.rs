#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedlink client: the worker side of the coordination protocol
//!
//! A worker registers once with the aggregator, then alternates between two
//! independent activities: long-polling for a newer version of the global
//! artifact, and submitting its own updates whenever the local trainer
//! produces one. This crate provides:
//!
//! - [`Client`], the HTTP(S) plumbing for every protocol route,
//! - [`Worker`], a driver implementing the worker state machine on top of
//!   any [`CoordinatorClient`] transport,
//! - [`WorkerHooks`], the small trait through which the embedding
//!   application receives fresh artifacts and reports the version it
//!   already holds,
//! - [`load_key_pair`], loading the `Ed25519` identity a worker
//!   authenticates with.
//!
//! Network retries are the embedding application's responsibility: apart
//! from the deliberately held-open long poll, every request is stateless
//! and can simply be re-issued.

pub mod client;
mod keys;
mod traits;
mod worker;

pub use self::{
    client::{Client, ClientError},
    keys::{load_key_pair, KeyFileError},
    traits::{CoordinatorClient, WorkerHooks},
    worker::{Worker, WorkerError},
};
