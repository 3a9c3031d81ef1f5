pub mod config;
pub mod state;

pub use config::{AppConfig, ProviderConfig};
pub use state::AppState;
