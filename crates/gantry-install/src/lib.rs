pub mod bootstrap;
pub mod detect;
pub mod installer;

pub use bootstrap::ServerBootstrap;
pub use detect::{find_missing, Detection};
pub use installer::NodeInstaller;
