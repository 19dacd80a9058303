//! HTTP Handlers

mod control;
mod ping;
mod websocket;

pub use control::*;
pub use ping::*;
pub use websocket::*;
