//! Docker-backed developer tooling.
//!
//! The crate bundles the pieces a container-heavy project needs day to day:
//! a bash-style command chainer ([`chain`]), a fix/format/lint pipeline
//! ([`pipeline`]), a long-lived container runner with ownership-aware file
//! transfer ([`docker`]), git working-tree snapshotting ([`gitutil`]), a
//! local docker-in-docker CI harness ([`ci`]), and small environment
//! introspection helpers ([`introspect`]).

pub mod chain;
pub mod ci;
pub mod config;
pub mod docker;
pub mod gitutil;
pub mod introspect;
pub mod pipeline;
