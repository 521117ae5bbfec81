pub mod api;
pub mod config;
pub mod entities;
pub mod error;
pub mod selection;
pub mod service;
pub mod storage;

pub use error::{AppError, Result};
pub use service::ReviewService;

pub struct AppState {
    pub service: ReviewService,
}
