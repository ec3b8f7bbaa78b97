//! # parley-client
//!
//! Synchronization engine for Parley conversations. The engine keeps the
//! local conversation and message stores consistent with the server across
//! REST fetches, push events, optimistic sends and reconnects, and exposes
//! read-only snapshots plus a typed event bus to the presentation layer.

pub mod apply;
pub mod attachments;
pub mod config;
pub mod controller;
pub mod engine;
pub mod events;
pub mod state;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use attachments::{FileCandidate, Rejection, SelectionReport, UploadRecord, UploadState};
pub use config::EngineConfig;
pub use engine::{connect, spawn_engine, EngineHandle};
pub use error::{ClientError, Result, ValidationError};
pub use events::{EngineEvent, EventBus, EventKind, MarkReadReport, Subscription};
pub use state::{SelectionState, Session, Snapshot};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_client=debug,parley_net=debug,parley_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!("Parley engine logging initialised");
    Ok(())
}
