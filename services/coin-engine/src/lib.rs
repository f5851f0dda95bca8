pub mod catalog_client;
pub mod config;
pub mod consumers;
pub mod errors;
pub mod handlers;
pub mod models;

pub use config::Config;
pub use errors::{ApiError, Result};
pub use handlers::AppState;
