pub mod handlers;
pub mod rpc;
pub mod server;
pub mod view_state;
pub mod wire;

pub use server::{start, ServerConfig, ServerHandle};
