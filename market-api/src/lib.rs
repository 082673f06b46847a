pub mod auth;
pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{router, run};
