//! Cosmos firewall.
//!
//! An admission-control front-end for Cosmos SDK node clusters. The firewall
//! listens on the three client-facing protocols a node exposes (Tendermint
//! JSON-RPC, gRPC and the REST gateway), evaluates every broadcast
//! transaction against a static [`PolicyConfig`], and forwards accepted
//! traffic to the healthiest backend tier (light, then full, then archive).
//!
//! The crate is split along the request path:
//!
//! - [`tx`] decodes broadcast payloads into a flat [`tx::Transaction`].
//! - [`policy`] evaluates a transaction and yields a [`policy::Verdict`].
//! - [`node`] tracks backend tier liveness and picks the current target.
//! - [`director`] forwards requests and gRPC streams to that target.
//! - [`server`] binds the listeners and wires the pieces together.

pub mod args;
pub mod config;
pub mod director;
pub mod error;
pub mod node;
pub mod policy;
pub mod server;
pub mod tx;

pub use config::{
    FirewallConfig,
    PolicyConfig,
};
pub use error::{
    FirewallError,
    Result,
};
pub use server::Firewall;
