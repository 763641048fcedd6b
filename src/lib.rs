// Model server library - exposes all core modules for embedding and testing

pub mod config;
pub mod convert;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod node;
pub mod registry;
pub mod server;
pub mod services;
pub mod subscriptions;
pub mod types;

pub use config::ServerConfig;
pub use error::ExecuteError;
pub use server::{ModelQuery, ModelServer};
