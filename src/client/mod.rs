pub mod client;

pub use client::{
    Client,
    ClientConfig,
    ClientHandle,
    WebSocketClient,
    new_web_socket_client,
};
