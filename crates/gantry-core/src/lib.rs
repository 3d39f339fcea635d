pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use error::{GantryError, Result};
