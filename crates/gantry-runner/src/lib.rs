pub mod rewrite;
pub mod runner;
pub mod stage;

pub use runner::{RunRequest, Runner};
