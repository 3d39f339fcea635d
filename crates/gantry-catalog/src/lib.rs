pub mod catalog;
pub mod fuzzy;
pub mod resolver;

pub use catalog::Catalog;
pub use resolver::{ModelResolver, Resolution};
