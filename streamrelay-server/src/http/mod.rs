pub mod error;
pub mod problem;

pub use error::{ApiError, AppResult};
