//! Open Proxy Engine - distributed proxy checking and scheduling
//!
//! Any number of stateless instances share one work store. Each instance
//! claims due proxies from the shared queue, checks them against judge
//! endpoints for every owning user, tracks consecutive failures in bulk and
//! puts the proxy back for its next check or drops it once nobody owns it.
//! Singleton maintenance jobs run on whichever instance holds their lease.

pub mod coalesce;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod leader;
pub mod logging;
pub mod maintenance;
pub mod pipeline;
pub mod proxy;
pub mod queue;

pub use config::Settings;
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
