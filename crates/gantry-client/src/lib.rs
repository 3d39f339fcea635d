pub mod api;
pub mod process;
pub mod ws;

pub use api::{RemoteModelEntry, RemoteNodeEntry, ServerClient};
pub use process::ServerProcess;
pub use ws::PushChannel;
