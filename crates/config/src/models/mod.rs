pub mod api_observability;
pub mod app_config;
pub mod broadcast;
pub mod database;
pub mod queue;
pub mod worker;

pub use api_observability::*;
pub use app_config::*;
pub use broadcast::*;
pub use database::*;
pub use queue::*;
pub use worker::*;
