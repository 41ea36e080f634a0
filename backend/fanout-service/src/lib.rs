pub mod config;
pub mod consumers;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod services;
pub mod state;
pub mod stores;
pub mod websocket;

pub use config::Config;
pub use error::{AppError, Result};
pub use services::FanoutService;
pub use state::AppState;
pub use websocket::{PushHub, PushMessage};
