pub mod context;
mod handler;

pub use context::{empty_body, full_body, BoxBody};
pub use handler::{handle_request, ProxyDeps};
