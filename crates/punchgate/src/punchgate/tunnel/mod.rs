pub mod client;
pub mod frame;
pub mod link;
pub mod mux;
pub mod server;
pub mod sniff;
