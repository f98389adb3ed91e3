//! Marasi: an interactive HTTPS intercepting proxy engine for application
//! security testing. The engine terminates TLS with certificates minted on
//! demand from a locally-trusted root (see [`ca`]), multiplexes plain and
//! TLS traffic off one listener (see [`mux`]), and runs every request and
//! response through a modifier pipeline (see [`pipeline`]) that can scope,
//! rewrite, intercept, or drop traffic before it reaches its destination or
//! the client.
//!
//! [`engine::Engine`] is the entry point: bootstrap it against a
//! [`config::EngineConfig`] and a [`persistence::Repositories`]
//! implementation, register any extensions, hooks, or an intercept
//! callback, then hand it an already-bound listener via
//! [`engine::Engine::run`].

pub mod accept;
pub mod browser;
pub mod ca;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod extension;
pub mod hooks;
pub mod id;
pub mod intercept;
pub mod launchpad;
pub mod mux;
pub mod persistence;
pub mod pipeline;
pub mod raw_http;
pub mod scope;
pub mod tls;
pub mod transport;
pub mod waypoint;

pub use ca::Ca;
pub use config::EngineConfig;
pub use context::TxContext;
pub use engine::Engine;
pub use error::{ErrorContext, Kind, OpaqueError};
pub use extension::{Capabilities, Extension, ExtensionKind, Outcome};
pub use id::TxId;
pub use scope::Scope;
pub use waypoint::Waypoints;
