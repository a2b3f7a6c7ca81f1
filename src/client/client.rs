use anyhow::{
    Error,
    Result,
};
use log::{
    info,
    warn,
};
use tokio::{
    net::TcpStream,
    sync::broadcast,
};
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
};

use crate::{
    core::{
        stream::MessageStream,
        uri::Uri,
    },
    peer::{
        ExitInfo,
        Peer,
        PeerConfig,
        SessionInfo,
        SupportedAuthMethod,
        new_web_socket_peer,
    },
};

/// Configuration for a [`Client`].
#[derive(Debug, Default)]
pub struct ClientConfig {
    /// Candidate router endpoints, tried in order until one accepts the connection.
    pub uris: Vec<String>,
    /// The realm to join on the router.
    pub realm: String,
    /// Authentication methods available for session establishment.
    pub auth_methods: Vec<SupportedAuthMethod>,
}

/// A handle to an established client session.
#[derive(Debug)]
pub struct ClientHandle {
    session_info: SessionInfo,
    closed_rx: broadcast::Receiver<ExitInfo>,
}

impl ClientHandle {
    /// Information about the established session.
    pub fn session_info(&self) -> &SessionInfo {
        &self.session_info
    }

    /// Resolves when the whole session ends, with its terminal record.
    ///
    /// The record distinguishes a clean close (GOODBYE handshake or graceful leave) from an
    /// abrupt one (transport loss or ABORT).
    pub async fn finished(&mut self) -> ExitInfo {
        match self.closed_rx.recv().await {
            Ok(exit_info) => exit_info,
            // The session ended without a terminal record being published.
            Err(_) => ExitInfo {
                clean: false,
                reason: None,
            },
        }
    }
}

/// A WAMP client: a peer paired with an ordered list of candidate router endpoints and the realm
/// to join.
///
/// [`Self::connect`] drives the whole establishment — connection (with failover across
/// endpoints), authentication, and realm join — and produces a [`ClientHandle`] whose
/// [`ClientHandle::finished`] future resolves only when the session ends.
pub struct Client<S> {
    config: ClientConfig,
    peer: Peer<S>,
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Client<S>
where
    S: Send + 'static,
{
    /// Creates a new client over the given peer.
    pub fn new(config: ClientConfig, peer: Peer<S>) -> Result<Self> {
        Uri::try_from(config.realm.as_str())?;
        Ok(Self { config, peer })
    }

    /// The underlying peer, for issuing operations and observing lifecycle notifications.
    pub fn peer(&self) -> &Peer<S> {
        &self.peer
    }

    /// Connects to the first reachable configured endpoint and joins the configured realm.
    ///
    /// Endpoints are tried in order; a connection failure moves on to the next candidate. A
    /// failure to establish the session on a reachable endpoint is final.
    pub async fn connect(&self) -> Result<ClientHandle> {
        if self.config.uris.is_empty() {
            return Err(Error::msg("no router endpoint is configured"));
        }
        let mut last_error = None;
        for uri in &self.config.uris {
            match self.peer.connect(uri).await {
                Ok(()) => return self.establish_session().await,
                Err(err) => {
                    warn!("Client failed to connect to {uri}: {err:#}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::msg("no endpoint accepted the connection"))
            .context("all router endpoints failed"))
    }

    /// Establishes the client session over an already-connected message stream, bypassing the
    /// configured endpoints.
    pub async fn direct_connect(&self, stream: Box<dyn MessageStream>) -> Result<ClientHandle> {
        self.peer.direct_connect(stream).await?;
        self.establish_session().await
    }

    async fn establish_session(&self) -> Result<ClientHandle> {
        // Subscribed before the join so the terminal record cannot be missed.
        let closed_rx = self.peer.closed_rx();
        let session_info = self
            .peer
            .join_realm_with_authentication(&self.config.realm, &self.config.auth_methods)
            .await?;
        info!(
            "Client established session {} on realm {}",
            session_info.session_id, session_info.realm
        );
        Ok(ClientHandle {
            session_info,
            closed_rx,
        })
    }

    /// Leaves the realm and closes the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.peer.leave_realm().await.ok();
        self.peer.disconnect().await
    }
}

/// A WAMP client over WebSocket streams.
pub type WebSocketClient = Client<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Creates a new [`WebSocketClient`].
pub fn new_web_socket_client(config: ClientConfig) -> Result<WebSocketClient> {
    let peer = new_web_socket_peer(PeerConfig::default())?;
    Client::new(config, peer)
}
