use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use battler_wamp_values::{
    Dictionary,
    Value,
    WampSerialize,
};
use futures_util::lock::Mutex;
use log::{
    error,
    info,
    warn,
};
use thiserror::Error;
use tokio::{
    sync::{
        broadcast::{
            self,
            error::RecvError,
        },
        mpsc,
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    auth::{
        AuthMethod,
        ClientAuthenticator,
        TicketAuthenticator,
        WampCraAuthenticator,
    },
    core::{
        cancel::CallCancelMode,
        error::SessionLostError,
        hash::{
            HashMap,
            HashSet,
        },
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
        },
        roles::{
            PeerRole,
            PeerRoles,
            PubSubFeatures,
            RpcFeatures,
        },
        service::{
            Service,
            ServiceHandle,
        },
        stream::{
            MessageStream,
            TransportMessageStream,
        },
        uri::Uri,
    },
    message::message::Message,
    peer::{
        connector::ConnectorFactory,
        session::{
            Command,
            ExitInfo,
            Invocation,
            Procedure,
            PublishedEvent,
            RpcCall,
            RpcResult,
            RpcYield,
            Session,
            SessionHandle,
            SessionInfo,
            Subscription,
        },
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::transport::TransportFactory,
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// How long a graceful leave waits for the router's GOODBYE echo before the connection is torn
/// down regardless.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for WebSocket-specific WAMP connections.
#[derive(Debug, Default)]
pub struct WebSocketConfig {
    /// Additional headers to include in the WebSocket handshake request.
    pub headers: HashMap<String, String>,
}

/// Configuration for a [`Peer`].
#[derive(Debug)]
pub struct PeerConfig {
    /// Name of the peer, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles implemented by the peer.
    pub roles: HashSet<PeerRole>,
    /// Allowed serializers.
    ///
    /// The actual serializer is selected when the connection with the router is established.
    pub serializers: HashSet<SerializerType>,
    /// Additional configuration for WebSocket-specific connections.
    pub web_socket: Option<WebSocketConfig>,
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(Error::msg("at least one serializer is required"));
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([
                PeerRole::Callee,
                PeerRole::Caller,
                PeerRole::Publisher,
                PeerRole::Subscriber,
            ]),
            serializers: HashSet::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            web_socket: None,
        }
    }
}

/// Error for a peer not being connected for some operation.
#[derive(Debug, Error)]
#[error("peer is not connected")]
pub struct PeerNotConnectedError;

/// Supported authentication methods for a peer, with the credentials each requires.
#[derive(Debug, Clone)]
pub enum SupportedAuthMethod {
    /// Ticket-based authentication.
    Ticket { id: String, ticket: String },
    /// WAMP Challenge-Response Authentication.
    WampCra { id: String, secret: String },
}

impl SupportedAuthMethod {
    /// The corresponding [`AuthMethod`].
    pub fn auth_method(&self) -> AuthMethod {
        match self {
            Self::Ticket { .. } => AuthMethod::Ticket,
            Self::WampCra { .. } => AuthMethod::WampCra,
        }
    }

    fn new_authenticator(&self) -> Box<dyn ClientAuthenticator> {
        match self {
            Self::Ticket { id, ticket } => {
                Box::new(TicketAuthenticator::new(id.clone(), ticket.clone()))
            }
            Self::WampCra { id, secret } => {
                Box::new(WampCraAuthenticator::new(id.clone(), secret.clone()))
            }
        }
    }
}

/// A handler for invocations of a procedure registered by this peer.
///
/// Used with [`Peer::register_with_handler`] to serve a procedure with a callback instead of
/// consuming the invocation stream directly.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    /// Handles one invocation of the procedure.
    ///
    /// The result is yielded back to the caller; an error is classified by its error URI and
    /// returned to the caller as an ERROR message.
    async fn handle_invocation(&self, invocation: &Invocation) -> Result<RpcYield>;
}

/// An in-flight procedure call.
///
/// The call completes exactly once: with the router's RESULT or ERROR, with a local cancellation,
/// or with a session loss.
pub struct PendingRpc {
    request_id: Id,
    timeout: Option<Duration>,
    result_rx: oneshot::Receiver<Result<RpcResult>>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl PendingRpc {
    /// Waits for the result of the procedure call.
    ///
    /// If the call carries a timeout, expiry performs the same cleanup as [`Self::cancel`] and the
    /// call fails with a canceled error.
    pub async fn result(mut self) -> Result<RpcResult> {
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.result_rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.cancel().ok();
                    self.result_rx.await
                }
            },
            None => (&mut self.result_rx).await,
        };
        match result {
            Ok(result) => result,
            Err(_) => Err(SessionLostError.into()),
        }
    }

    /// Cancels the pending call.
    ///
    /// The call fails locally right away and CANCEL is sent upstream; a late RESULT or ERROR for
    /// the call is dropped.
    pub fn cancel(&self) -> Result<()> {
        self.command_tx
            .send(Command::CancelCall {
                request_id: self.request_id,
                mode: CallCancelMode::KillNoWait,
            })
            .map_err(|_| PeerNotConnectedError.into())
    }
}

struct PeerState {
    session: SessionHandle,
    command_tx: mpsc::UnboundedSender<Command>,
    session_task: JoinHandle<()>,
}

/// A WAMP peer (a.k.a., client) that connects to a WAMP router, establishes sessions in a realm,
/// and interacts with resources in the realm.
///
/// A peer is reusable across connections: a new [`Self::connect`] supersedes and tears down any
/// previous connection. Session lifecycle notifications are delivered on the peer-level
/// [`Self::joined_rx`] and [`Self::closed_rx`] channels, which outlive any one connection.
pub struct Peer<S> {
    config: PeerConfig,
    connector_factory: Box<dyn ConnectorFactory<S>>,
    transport_factory: Box<dyn TransportFactory<S>>,
    id_allocator: Box<dyn IdAllocator>,

    joined_tx: broadcast::Sender<SessionInfo>,
    closed_tx: broadcast::Sender<ExitInfo>,
    end_active_connection_tx: broadcast::Sender<()>,

    peer_state: Arc<Mutex<Option<PeerState>>>,
}

impl<S> Peer<S>
where
    S: Send + 'static,
{
    /// Creates a new peer.
    pub fn new(
        config: PeerConfig,
        connector_factory: Box<dyn ConnectorFactory<S>>,
        transport_factory: Box<dyn TransportFactory<S>>,
    ) -> Result<Self> {
        config.validate()?;
        let (joined_tx, _) = broadcast::channel(16);
        let (closed_tx, _) = broadcast::channel(16);
        let (end_active_connection_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            connector_factory,
            transport_factory,
            id_allocator: Box::new(RandomIdAllocator::default()),
            joined_tx,
            closed_tx,
            end_active_connection_tx,
            peer_state: Arc::new(Mutex::new(None)),
        })
    }

    /// Receiver channel notified every time a session is established.
    pub fn joined_rx(&self) -> broadcast::Receiver<SessionInfo> {
        self.joined_tx.subscribe()
    }

    /// Receiver channel notified when a session ends, with its terminal record.
    pub fn closed_rx(&self) -> broadcast::Receiver<ExitInfo> {
        self.closed_tx.subscribe()
    }

    /// Information about the currently-established session, if any.
    pub async fn current_session_info(&self) -> Option<SessionInfo> {
        match self.peer_state.lock().await.as_ref() {
            Some(peer_state) => peer_state.session.current_session_info(),
            None => None,
        }
    }

    /// Connects to a router.
    ///
    /// This method merely establishes a network connection with the router; it does not establish
    /// any WAMP session. If the peer loses the connection, the connection is dropped in the
    /// background and methods depending on it fail. The peer can reconnect by calling this method
    /// again.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        let connector = self.connector_factory.new_connector();
        let connection = connector.connect(&self.config, uri).await?;
        info!(
            "WAMP connection established with {uri} for peer {}",
            self.config.name
        );

        let serializer = new_serializer(connection.serializer);
        let transport = self
            .transport_factory
            .new_transport(connection.stream, connection.serializer);
        self.direct_connect(Box::new(TransportMessageStream::new(transport, serializer)))
            .await
    }

    /// Directly connects to a router over the given message stream.
    pub async fn direct_connect(&self, stream: Box<dyn MessageStream>) -> Result<()> {
        // End any active connection.
        self.end_active_connection_tx.send(()).ok();

        let service = Service::new(self.config.name.clone(), stream);
        let service_message_rx = service.message_rx();
        let end_rx = service.end_rx();
        let service_handle = service.start();

        let session = Session::new(self.config.name.clone(), service_handle.message_tx());
        let session_handle = session.session_handle();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Lifecycle notifications are forwarded onto the peer-level channels, which outlive any
        // one connection.
        forward_session_notifications(session_handle.joined_rx(), self.joined_tx.clone());
        forward_session_notifications(session_handle.closed_rx(), self.closed_tx.clone());

        let session_task = tokio::spawn(session_loop(
            session,
            service_handle,
            command_rx,
            service_message_rx,
            end_rx,
            self.end_active_connection_tx.subscribe(),
        ));

        *self.peer_state.lock().await = Some(PeerState {
            session: session_handle,
            command_tx,
            session_task,
        });
        Ok(())
    }

    /// Disconnects from the router.
    pub async fn disconnect(&self) -> Result<()> {
        let peer_state = self.peer_state.lock().await.take();
        match peer_state {
            Some(peer_state) => {
                info!(
                    "Peer {} was instructed to disconnect from the router",
                    self.config.name
                );
                self.end_active_connection_tx.send(()).ok();
                peer_state.session_task.await.map_err(Error::new)
            }
            None => Ok(()),
        }
    }

    async fn command_tx(&self) -> Result<mpsc::UnboundedSender<Command>> {
        match self.peer_state.lock().await.as_ref() {
            Some(peer_state) => Ok(peer_state.command_tx.clone()),
            None => Err(PeerNotConnectedError.into()),
        }
    }

    /// Submits a command to the active session and waits for its completion sink to resolve.
    async fn submit<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let command_tx = self.command_tx().await?;
        let (tx, rx) = oneshot::channel();
        command_tx
            .send(command(tx))
            .map_err(|_| PeerNotConnectedError)?;
        match rx.await {
            Ok(result) => result,
            // The session ended before the command was processed.
            Err(_) => Err(SessionLostError.into()),
        }
    }

    /// Joins the realm, establishing a WAMP session.
    ///
    /// The session exists for as long as the router allows it to. The session is lost when
    /// [`Self::leave_realm`] is called, when the router terminates the session, or when the
    /// underlying connection is lost.
    pub async fn join_realm(&self, realm: &str) -> Result<SessionInfo> {
        self.join_realm_internal(realm, &[]).await
    }

    /// Joins the realm, establishing a WAMP session, with a list of supported authentication
    /// methods.
    ///
    /// Behaves the same as [`Self::join_realm`], but answers the router's challenge if the router
    /// requires authentication.
    pub async fn join_realm_with_authentication(
        &self,
        realm: &str,
        auth_methods: &[SupportedAuthMethod],
    ) -> Result<SessionInfo> {
        self.join_realm_internal(realm, auth_methods).await
    }

    async fn join_realm_internal(
        &self,
        realm: &str,
        auth_methods: &[SupportedAuthMethod],
    ) -> Result<SessionInfo> {
        let realm = Uri::try_from(realm)?;

        let mut details = Dictionary::default();
        details.insert("agent".to_owned(), Value::String(self.config.agent.clone()));
        details.insert(
            "roles".to_owned(),
            PeerRoles::new(
                self.config.roles.iter().cloned(),
                PubSubFeatures::default(),
                RpcFeatures {
                    call_canceling: true,
                    call_timeout: true,
                },
            )
            .wamp_serialize()?,
        );

        let authenticators: Vec<Box<dyn ClientAuthenticator>> = auth_methods
            .iter()
            .map(SupportedAuthMethod::new_authenticator)
            .collect();

        self.submit(|joined_tx| Command::Join {
            realm,
            details,
            authenticators,
            joined_tx,
        })
        .await
    }

    /// Leaves the realm, closing the WAMP session with a GOODBYE handshake.
    ///
    /// If the router does not echo the GOODBYE within a timeout, the connection is closed anyway;
    /// the close still counts as clean.
    pub async fn leave_realm(&self) -> Result<()> {
        let command_tx = self.command_tx().await?;
        let (left_tx, left_rx) = oneshot::channel();
        command_tx
            .send(Command::Leave { left_tx })
            .map_err(|_| PeerNotConnectedError)?;
        match tokio::time::timeout(LEAVE_TIMEOUT, left_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionLostError.into()),
            Err(_) => {
                warn!(
                    "Peer {} timed out waiting for the router to echo its GOODBYE",
                    self.config.name
                );
                self.disconnect().await
            }
        }
    }

    /// Calls a procedure in the realm.
    ///
    /// The caller chooses what to do with the pending RPC: wait for its result, or cancel it.
    pub async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<PendingRpc> {
        let command_tx = self.command_tx().await?;
        let request_id = self.id_allocator.generate_id().await;
        let timeout = rpc_call.timeout;
        let (result_tx, result_rx) = oneshot::channel();
        command_tx
            .send(Command::Call {
                request_id,
                procedure,
                rpc_call,
                result_tx,
            })
            .map_err(|_| PeerNotConnectedError)?;
        Ok(PendingRpc {
            request_id,
            timeout,
            result_rx,
            command_tx,
        })
    }

    /// Calls a procedure and waits for its result.
    pub async fn call_and_wait(&self, procedure: Uri, rpc_call: RpcCall) -> Result<RpcResult> {
        self.call(procedure, rpc_call).await?.result().await
    }

    /// Subscribes to a topic in the realm.
    ///
    /// The resulting subscription contains an event receiver stream for published events. The
    /// stream automatically closes when the peer unsubscribes from the topic or when the session
    /// ends. Every local subscriber to the same topic receives every event; only the first
    /// subscription for a topic performs a wire round-trip.
    pub async fn subscribe(&self, topic: Uri) -> Result<Subscription> {
        self.submit(|subscribed_tx| Command::Subscribe {
            topic,
            subscribed_tx,
        })
        .await
    }

    /// Removes the subscription for a topic.
    ///
    /// Safe to call for a topic with no active subscription; nothing is sent to the router.
    pub async fn unsubscribe(&self, topic: Uri) -> Result<()> {
        self.submit(|unsubscribed_tx| Command::Unsubscribe {
            topic,
            unsubscribed_tx,
        })
        .await
    }

    /// Removes every active subscription.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.submit(|unsubscribed_tx| Command::UnsubscribeAll { unsubscribed_tx })
            .await
    }

    /// Publishes an event to a topic.
    ///
    /// By default the publish resolves as soon as the event is handed to the writer path. With
    /// [`PublishOptions::acknowledge`][`crate::peer::session::PublishOptions`], it resolves when
    /// the router acknowledges the publication.
    pub async fn publish(&self, topic: Uri, event: PublishedEvent) -> Result<()> {
        self.submit(|published_tx| Command::Publish {
            topic,
            event,
            published_tx,
        })
        .await
    }

    /// Registers a procedure to an endpoint.
    ///
    /// The resulting procedure contains an invocation receiver stream. The stream automatically
    /// closes when the peer unregisters the procedure or when the session ends.
    pub async fn register(&self, procedure: Uri) -> Result<Procedure> {
        self.submit(|registered_tx| Command::Register {
            procedure,
            registered_tx,
        })
        .await
    }

    /// Registers a procedure and serves it with the given handler.
    ///
    /// Each invocation is handled in its own task, so a slow invocation does not block the ones
    /// after it.
    pub async fn register_with_handler<H>(&self, procedure: Uri, handler: H) -> Result<Id>
    where
        H: InvocationHandler + 'static,
    {
        let registered = self.register(procedure.clone()).await?;
        let registration_id = registered.id;
        let mut invocation_rx = registered.invocation_rx;
        let handler = Arc::new(handler);
        let name = self.config.name.clone();
        tokio::spawn(async move {
            loop {
                let invocation = match invocation_rx.recv().await {
                    Ok(invocation) => invocation,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Peer {name} invocation handler for {procedure} fell behind by {skipped} invocations"
                        );
                        continue;
                    }
                    // The procedure was unregistered or the session ended.
                    Err(RecvError::Closed) => break,
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let result = handler.handle_invocation(&invocation).await;
                    invocation.respond(result).ok();
                });
            }
        });
        Ok(registration_id)
    }

    /// Removes a registered procedure.
    pub async fn unregister(&self, procedure: Uri) -> Result<()> {
        self.submit(|unregistered_tx| Command::Unregister {
            procedure,
            unregistered_tx,
        })
        .await
    }
}

fn forward_session_notifications<T>(mut rx: broadcast::Receiver<T>, tx: broadcast::Sender<T>)
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    tx.send(notification).ok();
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// The task driving one connection's session: application commands and incoming messages are fed
/// to the session strictly sequentially, so the correlation tables have a single owner.
async fn session_loop(
    mut session: Session,
    service: ServiceHandle,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut service_message_rx: broadcast::Receiver<Message>,
    mut end_rx: broadcast::Receiver<()>,
    mut end_active_connection_rx: broadcast::Receiver<()>,
) {
    if session.connection_opened().is_ok() {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if let Err(err) = session.handle_command(command).await {
                            error!("Peer {} session failed: {err:#}", session.name());
                            break;
                        }
                    }
                    // The peer was dropped; the connection goes with it.
                    None => break,
                },
                message = service_message_rx.recv() => match message {
                    Ok(message) => {
                        if let Err(err) = session.handle_message(message).await {
                            error!("Peer {} session failed: {err:#}", session.name());
                            break;
                        }
                    }
                    Err(_) => break,
                },
                // The service ended: the transport closed or failed.
                _ = end_rx.recv() => break,
                // The peer superseded this connection with a new one.
                _ = end_active_connection_rx.recv() => break,
            }
            if session.finished() {
                break;
            }
        }
    }

    // Whatever ended the loop, everything outstanding is resolved before the connection is torn
    // down.
    session.connection_lost();
    service.cancel().ok();
    service.join().await.ok();
    info!("Peer {} connection ended", session.name());
}
