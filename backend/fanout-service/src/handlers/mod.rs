pub mod events;
pub mod feed;
pub mod websocket;
