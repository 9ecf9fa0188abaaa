pub mod api;
mod websocket;

pub use websocket::{Connection, connect};
