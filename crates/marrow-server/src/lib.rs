pub mod protocol;
mod server;
mod session;

pub use protocol::{Request, Response};
pub use server::Server;
pub use session::Session;
