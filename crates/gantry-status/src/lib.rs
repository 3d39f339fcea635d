pub mod tracker;

pub use tracker::{CancelStore, FileCancelStore};
