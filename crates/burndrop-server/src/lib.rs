pub mod clock;
pub mod engine;
pub mod handlers;
pub mod reaper;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: engine::SecretEngine,
}

pub use engine::{EngineError, RevealedSecret, SecretEngine, SecretHandle};
pub use server::{open_engine, read_key_file, resolve_data_dir, router, run, ServerConfig};
