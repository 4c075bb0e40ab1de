#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedlink server: worker coordination for federated aggregation
//!
//! This crate implements the aggregator side of the fedlink protocol. It
//! does not know what the distributed artifact contains or how worker
//! updates are combined; both concerns live behind the
//! [`Federation`](federation::Federation) trait implemented by the
//! aggregation collaborator and injected at construction.
//!
//! What the crate does own is the coordination discipline around that
//! collaborator:
//!
//! - a persistent registry of authorized worker identities with admission
//!   and registration control ([`registry`]),
//! - a challenge/response authentication scheme over `Ed25519` signatures,
//!   resistant to replay ([`auth`]),
//! - long-poll distribution of the versioned global artifact that scales to
//!   thousands of idle pollers ([`poll`]),
//! - the HTTP surface tying it together, including the separately
//!   authenticated admin control plane ([`rest`], [`services`]).
//!
//! A typical deployment loads [`settings::Settings`] from a TOML file,
//! builds a [`services::ProtocolHandler`] around its `Federation`
//! implementation and hands both to [`rest::serve`].

pub mod auth;
pub mod federation;
pub mod poll;
pub mod registry;
pub mod rest;
pub mod services;
pub mod settings;

#[cfg(test)]
mod tests;
