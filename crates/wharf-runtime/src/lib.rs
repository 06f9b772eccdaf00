#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-runtime** – Service runtime wiring for Wharf.
//!
//! Loads configuration, picks a storage driver, and binds the whole pipeline
//! together: repository, outbox relay, consumer workers, projection engine
//! and the workflow engine with the fulfillment saga family registered.
//! `start` spawns the background loops; `shutdown` cancels the shared token
//! and waits for each loop to finish its current batch.

mod config;
mod idempotency;
mod service;

pub use config::{
    BreakerSettings, ConsumerSettings, RelaySettings, RuntimeConfig, StorageDriver,
    StorageSettings,
};
pub use idempotency::{GateResponse, HttpIdempotencyGate};
pub use service::ServiceRuntime;

/// Install the tracing subscriber with env-filter. A second call is a no-op
/// so tests and embedders can race freely.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
