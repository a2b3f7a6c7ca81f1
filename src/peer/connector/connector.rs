use anyhow::Result;
use async_trait::async_trait;

use crate::{
    peer::peer::PeerConfig,
    serializer::serializer::SerializerType,
};

/// An established connection to a WAMP router.
///
/// Carries the raw stream and the serializer negotiated during the connection handshake.
pub struct Connection<S> {
    pub stream: S,
    pub serializer: SerializerType,
}

/// A type for initiating a connection to a router.
#[async_trait]
pub trait Connector<S> {
    /// Connects to the router at the given URI.
    async fn connect(&self, config: &PeerConfig, uri: &str) -> Result<Connection<S>>;
}

/// A factory for creating a new [`Connector`].
pub trait ConnectorFactory<S>: Send + Sync {
    /// Creates a new [`Connector`].
    fn new_connector(&self) -> Box<dyn Connector<S> + Send>;
}
