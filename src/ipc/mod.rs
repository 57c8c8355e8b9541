pub mod client;
pub mod frame;
pub mod protocol;
pub mod server;
