pub mod auth;
pub mod client;
pub mod core;
pub mod message;
pub mod peer;
pub mod serializer;
pub mod transport;
