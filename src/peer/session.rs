use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use battler_wamp_values::{
    Dictionary,
    List,
    Value,
    WampDeserialize,
    WampDeserializeError,
};
use log::{
    debug,
    info,
    trace,
    warn,
};
use tokio::sync::{
    broadcast,
    mpsc::UnboundedSender,
    oneshot,
};

use crate::{
    auth::ClientAuthenticator,
    core::{
        cancel::CallCancelMode,
        close::CloseReason,
        error::{
            BasicError,
            InteractionError,
            NotJoinedError,
            SessionLostError,
            error_from_message,
            error_from_uri_reason_and_message,
            uri_for_error,
        },
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            AuthenticateMessage,
            CallMessage,
            CancelMessage,
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
};

/// Information about an established WAMP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// The session ID assigned by the router.
    pub session_id: Id,
    /// The realm the session is joined to.
    pub realm: Uri,
}

/// Terminal record of a session's end.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    /// Whether the session closed cleanly (GOODBYE handshake or graceful leave), as opposed to
    /// abruptly (transport loss or ABORT).
    pub clean: bool,
    /// The close or abort reason communicated by the router, if any.
    pub reason: Option<Uri>,
}

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// A timeout for the whole call, enforced by the caller on top of the completion future.
    pub timeout: Option<Duration>,
}

/// A result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl RpcResult {
    /// Deserializes the positional arguments into the type the caller expects.
    pub fn decode_arguments<T>(&self) -> Result<T, WampDeserializeError>
    where
        T: WampDeserialize,
    {
        T::wamp_deserialize(Value::List(self.arguments.clone()))
    }
}

/// A result yielded from a procedure invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// An event received over a subscription.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// The topic the subscription was made for.
    pub topic: Uri,
    /// The publication ID assigned by the router.
    pub publication_id: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl ReceivedEvent {
    /// Deserializes the positional arguments into the type the subscriber expects.
    ///
    /// A failure here is scoped to this one event.
    pub fn decode_arguments<T>(&self) -> Result<T, WampDeserializeError>
    where
        T: WampDeserialize,
    {
        T::wamp_deserialize(Value::List(self.arguments.clone()))
    }
}

/// Options for publishing an event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Wait for the router to acknowledge the publication with PUBLISHED.
    pub acknowledge: bool,
}

/// An event published to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

/// An invocation of a procedure this peer registered.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The router's request ID for the invocation, echoed in the response.
    pub request_id: Id,
    /// The procedure the invocation is for.
    pub procedure: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,

    message_tx: UnboundedSender<Message>,
}

impl Invocation {
    /// Deserializes the positional arguments into the type the callee expects.
    pub fn decode_arguments<T>(&self) -> Result<T, WampDeserializeError>
    where
        T: WampDeserialize,
    {
        T::wamp_deserialize(Value::List(self.arguments.clone()))
    }

    /// Responds to the invocation, sending YIELD for a result and ERROR for a failure.
    pub fn respond(self, result: Result<RpcYield>) -> Result<()> {
        let message = match result {
            Ok(rpc_yield) => Message::Yield(YieldMessage {
                invocation_request: self.request_id,
                options: Dictionary::default(),
                arguments: rpc_yield.arguments,
                arguments_keyword: rpc_yield.arguments_keyword,
            }),
            Err(err) => Message::Error(ErrorMessage {
                request_type: Message::Invocation(InvocationMessage::default()).tag(),
                request: self.request_id,
                details: Dictionary::from_iter([(
                    "message".to_owned(),
                    Value::String(err.to_string()),
                )]),
                error: uri_for_error(&err),
                ..Default::default()
            }),
        };
        self.message_tx
            .send(message)
            .map_err(|_| SessionLostError.into())
    }
}

/// A subscription to a topic.
///
/// The event receiver stream closes when the peer unsubscribes from the topic or when the session
/// ends. Every local subscriber to the same topic receives every event.
#[derive(Debug)]
pub struct Subscription {
    /// The subscription ID assigned by the router.
    pub id: Id,
    /// The topic subscribed to.
    pub topic: Uri,
    /// The event receiver channel.
    pub event_rx: broadcast::Receiver<ReceivedEvent>,
}

/// A registration of a procedure.
///
/// The invocation receiver stream closes when the peer unregisters the procedure or when the
/// session ends.
#[derive(Debug)]
pub struct Procedure {
    /// The registration ID assigned by the router.
    pub id: Id,
    /// The invocation receiver channel.
    pub invocation_rx: broadcast::Receiver<Invocation>,
}

/// An application request submitted to a [`Session`].
///
/// Every request carries its own completion sink, which the session resolves exactly once.
pub enum Command {
    Join {
        realm: Uri,
        details: Dictionary,
        authenticators: Vec<Box<dyn ClientAuthenticator>>,
        joined_tx: oneshot::Sender<Result<SessionInfo>>,
    },
    Leave {
        left_tx: oneshot::Sender<Result<()>>,
    },
    Call {
        request_id: Id,
        procedure: Uri,
        rpc_call: RpcCall,
        result_tx: oneshot::Sender<Result<RpcResult>>,
    },
    CancelCall {
        request_id: Id,
        mode: CallCancelMode,
    },
    Subscribe {
        topic: Uri,
        subscribed_tx: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        topic: Uri,
        unsubscribed_tx: oneshot::Sender<Result<()>>,
    },
    UnsubscribeAll {
        unsubscribed_tx: oneshot::Sender<Result<()>>,
    },
    Publish {
        topic: Uri,
        event: PublishedEvent,
        published_tx: oneshot::Sender<Result<()>>,
    },
    Register {
        procedure: Uri,
        registered_tx: oneshot::Sender<Result<Procedure>>,
    },
    Unregister {
        procedure: Uri,
        unregistered_tx: oneshot::Sender<Result<()>>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Call { .. } => "call",
            Self::CancelCall { .. } => "cancel call",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::UnsubscribeAll { .. } => "unsubscribe all",
            Self::Publish { .. } => "publish",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthenticatingSessionState {
    realm: Uri,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinedSessionState {
    session_id: Id,
    realm: Uri,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
enum SessionState {
    /// No transport connection exists yet.
    #[default]
    Disconnected,
    /// The transport is open; no session establishment has started.
    Connecting,
    /// HELLO was sent; waiting for the router's CHALLENGE or WELCOME.
    Authenticating(AuthenticatingSessionState),
    /// The router welcomed the session; application traffic is allowed.
    Joined(JoinedSessionState),
    /// GOODBYE was sent; waiting for the router's echo.
    Leaving,
    /// The session ended cleanly.
    Closed,
    /// The session ended abruptly.
    Failed,
}

impl SessionState {
    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Disconnected, Self::Connecting) => true,
            (Self::Connecting, Self::Authenticating(_)) => true,
            (Self::Connecting, Self::Closed) => true,
            (Self::Authenticating(_), Self::Joined(_)) => true,
            (Self::Joined(_), Self::Leaving) => true,
            (Self::Leaving, Self::Closed) => true,
            // Failure can interrupt any non-terminal state.
            (Self::Closed | Self::Failed, _) => false,
            (_, Self::Failed) => true,
            _ => false,
        }
    }

    fn terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

struct PendingCall {
    result_tx: oneshot::Sender<Result<RpcResult>>,
}

struct PendingSubscribe {
    topic: Uri,
    waiters: Vec<oneshot::Sender<Result<Subscription>>>,
}

struct PendingUnsubscribe {
    unsubscribed_tx: Option<oneshot::Sender<Result<()>>>,
}

struct PendingRegister {
    procedure: Uri,
    registered_tx: oneshot::Sender<Result<Procedure>>,
}

struct PendingUnregister {
    unregistered_tx: oneshot::Sender<Result<()>>,
}

struct ActiveSubscription {
    subscription_id: Id,
    event_tx: broadcast::Sender<ReceivedEvent>,
}

struct ActiveRegistration {
    procedure: Uri,
    invocation_tx: broadcast::Sender<Invocation>,
}

/// A handle to a [`Session`] for observing its lifecycle.
pub struct SessionHandle {
    joined_tx: broadcast::Sender<SessionInfo>,
    closed_tx: broadcast::Sender<ExitInfo>,
    session_info: Arc<Mutex<Option<SessionInfo>>>,
}

impl SessionHandle {
    /// Receiver channel notified every time the session is established.
    pub fn joined_rx(&self) -> broadcast::Receiver<SessionInfo> {
        self.joined_tx.subscribe()
    }

    /// Receiver channel notified when the session ends, with its terminal record.
    pub fn closed_rx(&self) -> broadcast::Receiver<ExitInfo> {
        self.closed_tx.subscribe()
    }

    /// Information about the currently-established session, if any.
    pub fn current_session_info(&self) -> Option<SessionInfo> {
        self.session_info.lock().unwrap().clone()
    }
}

/// The protocol engine for one WAMP session over one connection.
///
/// The session owns all correlation state: pending requests keyed by request ID, active
/// subscriptions keyed by subscription ID, and active registrations keyed by registration ID. It
/// is driven by exactly one task, which feeds it application commands and incoming messages; the
/// tables are therefore never shared, and every completion sink is resolved exactly once. A
/// pending entry is always registered in the same sequential step that enqueues the outbound
/// frame, so a response can never arrive before its entry exists.
pub struct Session {
    name: String,
    message_tx: UnboundedSender<Message>,
    id_allocator: Box<dyn IdAllocator>,
    state: SessionState,

    authenticators: Vec<Box<dyn ClientAuthenticator>>,
    challenge_rounds: u32,

    pending_join: Option<oneshot::Sender<Result<SessionInfo>>>,
    pending_leaves: Vec<oneshot::Sender<Result<()>>>,
    pending_calls: HashMap<Id, PendingCall>,
    pending_subscribes: HashMap<Id, PendingSubscribe>,
    pending_unsubscribes: HashMap<Id, PendingUnsubscribe>,
    pending_publishes: HashMap<Id, oneshot::Sender<Result<()>>>,
    pending_registers: HashMap<Id, PendingRegister>,
    pending_unregisters: HashMap<Id, PendingUnregister>,

    topics: HashMap<Uri, ActiveSubscription>,
    subscriptions: HashMap<Id, Uri>,
    registrations: HashMap<Id, ActiveRegistration>,
    procedures: HashMap<Uri, Id>,

    close_reason: Option<Uri>,

    joined_tx: broadcast::Sender<SessionInfo>,
    closed_tx: broadcast::Sender<ExitInfo>,
    session_info: Arc<Mutex<Option<SessionInfo>>>,
}

impl Session {
    /// Creates a new session that writes outbound messages to the given channel.
    pub fn new(name: String, message_tx: UnboundedSender<Message>) -> Self {
        let (joined_tx, _) = broadcast::channel(16);
        let (closed_tx, _) = broadcast::channel(16);
        Self {
            name,
            message_tx,
            id_allocator: Box::new(RandomIdAllocator::default()),
            state: SessionState::default(),
            authenticators: Vec::new(),
            challenge_rounds: 0,
            pending_join: None,
            pending_leaves: Vec::new(),
            pending_calls: HashMap::default(),
            pending_subscribes: HashMap::default(),
            pending_unsubscribes: HashMap::default(),
            pending_publishes: HashMap::default(),
            pending_registers: HashMap::default(),
            pending_unregisters: HashMap::default(),
            topics: HashMap::default(),
            subscriptions: HashMap::default(),
            registrations: HashMap::default(),
            procedures: HashMap::default(),
            close_reason: None,
            joined_tx,
            closed_tx,
            session_info: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the session reached a terminal state.
    pub fn finished(&self) -> bool {
        self.state.terminal()
    }

    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            joined_tx: self.joined_tx.clone(),
            closed_tx: self.closed_tx.clone(),
            session_info: self.session_info.clone(),
        }
    }

    /// Marks the underlying transport as open.
    pub fn connection_opened(&mut self) -> Result<()> {
        self.transition_state(SessionState::Connecting)
    }

    /// Marks the underlying transport as lost.
    ///
    /// Everything outstanding is invalidated; the close is unclean unless the session already
    /// finished its GOODBYE handshake.
    pub fn connection_lost(&mut self) {
        if self.state.terminal() {
            return;
        }
        // A GOODBYE handshake already in flight still counts as a graceful close, even if the
        // router never echoed it.
        if matches!(self.state, SessionState::Leaving) {
            self.transition_state(SessionState::Closed).ok();
        } else {
            self.transition_state(SessionState::Failed).ok();
        }
    }

    /// Handles an application command.
    ///
    /// Per-request failures are reported through the command's completion sink; an error returned
    /// here is fatal to the session, which will have been aborted already.
    pub async fn handle_command(&mut self, command: Command) -> Result<()> {
        trace!("Peer {} handling {} command", self.name, command.name());
        if let Err(err) = self.handle_command_internal(command).await {
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    async fn handle_command_internal(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Join {
                realm,
                details,
                authenticators,
                joined_tx,
            } => self.handle_join(realm, details, authenticators, joined_tx),
            Command::Leave { left_tx } => self.handle_leave(left_tx),
            Command::Call {
                request_id,
                procedure,
                rpc_call,
                result_tx,
            } => self.handle_call(request_id, procedure, rpc_call, result_tx),
            Command::CancelCall { request_id, mode } => {
                self.handle_cancel_call(request_id, mode)
            }
            Command::Subscribe {
                topic,
                subscribed_tx,
            } => self.handle_subscribe(topic, subscribed_tx).await,
            Command::Unsubscribe {
                topic,
                unsubscribed_tx,
            } => self.handle_unsubscribe(topic, unsubscribed_tx).await,
            Command::UnsubscribeAll { unsubscribed_tx } => {
                self.handle_unsubscribe_all(unsubscribed_tx).await
            }
            Command::Publish {
                topic,
                event,
                published_tx,
            } => self.handle_publish(topic, event, published_tx).await,
            Command::Register {
                procedure,
                registered_tx,
            } => self.handle_register(procedure, registered_tx).await,
            Command::Unregister {
                procedure,
                unregistered_tx,
            } => self.handle_unregister(procedure, unregistered_tx).await,
        }
    }

    fn handle_join(
        &mut self,
        realm: Uri,
        details: Dictionary,
        authenticators: Vec<Box<dyn ClientAuthenticator>>,
        joined_tx: oneshot::Sender<Result<SessionInfo>>,
    ) -> Result<()> {
        match self.state {
            SessionState::Connecting => (),
            SessionState::Joined(_) | SessionState::Authenticating(_) => {
                joined_tx
                    .send(Err(Error::msg("session is already established")))
                    .ok();
                return Ok(());
            }
            _ => {
                joined_tx.send(Err(SessionLostError.into())).ok();
                return Ok(());
            }
        }

        let mut message = HelloMessage { realm, details };
        crate::auth::embed_auth_into_hello_message(&authenticators, &mut message)?;
        self.authenticators = authenticators;
        self.challenge_rounds = 0;
        self.pending_join = Some(joined_tx);
        self.send_message(Message::Hello(message))
    }

    fn handle_leave(&mut self, left_tx: oneshot::Sender<Result<()>>) -> Result<()> {
        match self.state {
            SessionState::Joined(_) => {
                self.pending_leaves.push(left_tx);
                self.send_message(goodbye_with_close_reason(CloseReason::Normal))
            }
            SessionState::Leaving => {
                self.pending_leaves.push(left_tx);
                Ok(())
            }
            _ => {
                left_tx.send(Err(NotJoinedError.into())).ok();
                Ok(())
            }
        }
    }

    fn handle_call(
        &mut self,
        request_id: Id,
        procedure: Uri,
        rpc_call: RpcCall,
        result_tx: oneshot::Sender<Result<RpcResult>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            result_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }
        self.ensure_request_id_free(request_id)?;

        let mut options = Dictionary::default();
        if let Some(timeout) = rpc_call.timeout {
            options.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }

        // The entry must exist before the frame can possibly be answered.
        self.pending_calls
            .insert(request_id, PendingCall { result_tx });
        if let Err(err) = self.send_message(Message::Call(CallMessage {
            request: request_id,
            options,
            procedure,
            arguments: rpc_call.arguments,
            arguments_keyword: rpc_call.arguments_keyword,
        })) {
            if let Some(pending) = self.pending_calls.remove(&request_id) {
                pending.result_tx.send(Err(SessionLostError.into())).ok();
            }
            return Err(err);
        }
        Ok(())
    }

    fn handle_cancel_call(&mut self, request_id: Id, mode: CallCancelMode) -> Result<()> {
        let pending = match self.pending_calls.remove(&request_id) {
            Some(pending) => pending,
            // The call already completed; nothing to cancel.
            None => return Ok(()),
        };
        pending
            .result_tx
            .send(Err(InteractionError::Canceled.into()))
            .ok();
        if matches!(self.state, SessionState::Joined(_)) {
            self.send_message(Message::Cancel(CancelMessage {
                call_request: request_id,
                options: Dictionary::from_iter([(
                    "mode".to_owned(),
                    Value::String(mode.into()),
                )]),
            }))?;
        }
        Ok(())
    }

    async fn handle_subscribe(
        &mut self,
        topic: Uri,
        subscribed_tx: oneshot::Sender<Result<Subscription>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            subscribed_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }

        // An active subscription for the topic is shared directly.
        if let Some(active) = self.topics.get(&topic) {
            subscribed_tx
                .send(Ok(Subscription {
                    id: active.subscription_id,
                    topic,
                    event_rx: active.event_tx.subscribe(),
                }))
                .ok();
            return Ok(());
        }

        // A subscription request already in flight is joined, not repeated.
        if let Some(pending) = self
            .pending_subscribes
            .values_mut()
            .find(|pending| pending.topic == topic)
        {
            pending.waiters.push(subscribed_tx);
            return Ok(());
        }

        let request_id = self.allocate_request_id().await?;
        self.pending_subscribes.insert(
            request_id,
            PendingSubscribe {
                topic: topic.clone(),
                waiters: Vec::from_iter([subscribed_tx]),
            },
        );
        if let Err(err) = self.send_message(Message::Subscribe(SubscribeMessage {
            request: request_id,
            options: Dictionary::default(),
            topic,
        })) {
            if let Some(pending) = self.pending_subscribes.remove(&request_id) {
                for waiter in pending.waiters {
                    waiter.send(Err(SessionLostError.into())).ok();
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn handle_unsubscribe(
        &mut self,
        topic: Uri,
        unsubscribed_tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            unsubscribed_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }
        let active = match self.topics.remove(&topic) {
            Some(active) => active,
            // No active subscription for the topic; nothing to do.
            None => {
                unsubscribed_tx.send(Ok(())).ok();
                return Ok(());
            }
        };
        self.subscriptions.remove(&active.subscription_id);
        self.send_unsubscribe(active.subscription_id, Some(unsubscribed_tx))
            .await
    }

    async fn handle_unsubscribe_all(
        &mut self,
        unsubscribed_tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            unsubscribed_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }
        let active = self.topics.drain().map(|(_, active)| active).collect::<Vec<_>>();
        self.subscriptions.clear();
        for subscription in active {
            self.send_unsubscribe(subscription.subscription_id, None)
                .await?;
        }
        unsubscribed_tx.send(Ok(())).ok();
        Ok(())
    }

    async fn send_unsubscribe(
        &mut self,
        subscription_id: Id,
        unsubscribed_tx: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let request_id = self.allocate_request_id().await?;
        self.pending_unsubscribes
            .insert(request_id, PendingUnsubscribe { unsubscribed_tx });
        if let Err(err) = self.send_message(Message::Unsubscribe(UnsubscribeMessage {
            request: request_id,
            subscribed_subscription: subscription_id,
        })) {
            if let Some(pending) = self.pending_unsubscribes.remove(&request_id) {
                if let Some(tx) = pending.unsubscribed_tx {
                    tx.send(Err(SessionLostError.into())).ok();
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn handle_publish(
        &mut self,
        topic: Uri,
        event: PublishedEvent,
        published_tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            published_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }
        let request_id = self.allocate_request_id().await?;

        let mut options = Dictionary::default();
        let acknowledge = event.options.acknowledge;
        if acknowledge {
            options.insert("acknowledge".to_owned(), Value::Bool(true));
            self.pending_publishes.insert(request_id, published_tx);

            let result = self.send_message(Message::Publish(PublishMessage {
                request: request_id,
                options,
                topic,
                arguments: event.arguments,
                arguments_keyword: event.arguments_keyword,
            }));
            if let Err(err) = result {
                if let Some(tx) = self.pending_publishes.remove(&request_id) {
                    tx.send(Err(SessionLostError.into())).ok();
                }
                return Err(err);
            }
        } else {
            let result = self.send_message(Message::Publish(PublishMessage {
                request: request_id,
                options,
                topic,
                arguments: event.arguments,
                arguments_keyword: event.arguments_keyword,
            }));
            // Fire and forget: resolve as soon as the frame is accepted by the writer path.
            published_tx.send(result).ok();
        }
        Ok(())
    }

    async fn handle_register(
        &mut self,
        procedure: Uri,
        registered_tx: oneshot::Sender<Result<Procedure>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            registered_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }

        // One registration per procedure URI per session.
        if self.procedures.contains_key(&procedure)
            || self
                .pending_registers
                .values()
                .any(|pending| pending.procedure == procedure)
        {
            registered_tx
                .send(Err(InteractionError::ProcedureAlreadyExists.into()))
                .ok();
            return Ok(());
        }

        let request_id = self.allocate_request_id().await?;
        self.pending_registers.insert(
            request_id,
            PendingRegister {
                procedure: procedure.clone(),
                registered_tx,
            },
        );
        if let Err(err) = self.send_message(Message::Register(RegisterMessage {
            request: request_id,
            options: Dictionary::default(),
            procedure,
        })) {
            if let Some(pending) = self.pending_registers.remove(&request_id) {
                pending
                    .registered_tx
                    .send(Err(SessionLostError.into()))
                    .ok();
            }
            return Err(err);
        }
        Ok(())
    }

    async fn handle_unregister(
        &mut self,
        procedure: Uri,
        unregistered_tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Joined(_)) {
            unregistered_tx.send(Err(NotJoinedError.into())).ok();
            return Ok(());
        }
        let registration_id = match self.procedures.remove(&procedure) {
            Some(registration_id) => registration_id,
            None => {
                unregistered_tx
                    .send(Err(InteractionError::NoSuchRegistration.into()))
                    .ok();
                return Ok(());
            }
        };
        self.registrations.remove(&registration_id);

        let request_id = self.allocate_request_id().await?;
        self.pending_unregisters
            .insert(request_id, PendingUnregister { unregistered_tx });
        if let Err(err) = self.send_message(Message::Unregister(UnregisterMessage {
            request: request_id,
            registered_registration: registration_id,
        })) {
            if let Some(pending) = self.pending_unregisters.remove(&request_id) {
                pending
                    .unregistered_tx
                    .send(Err(SessionLostError.into()))
                    .ok();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Allocates a request ID that is not outstanding in any correlation table.
    async fn allocate_request_id(&mut self) -> Result<Id> {
        let id = self.id_allocator.generate_id().await;
        self.ensure_request_id_free(id)?;
        Ok(id)
    }

    /// Verifies a request ID is not outstanding in any correlation table.
    ///
    /// Random IDs make a collision vanishingly unlikely; if one does occur, the existing entry
    /// must not be overwritten, so the session is torn down as ill-behaved rather than risking a
    /// response being delivered to the wrong request.
    fn ensure_request_id_free(&self, id: Id) -> Result<()> {
        if self.pending_calls.contains_key(&id)
            || self.pending_subscribes.contains_key(&id)
            || self.pending_unsubscribes.contains_key(&id)
            || self.pending_publishes.contains_key(&id)
            || self.pending_registers.contains_key(&id)
            || self.pending_unregisters.contains_key(&id)
        {
            return Err(InteractionError::ProtocolViolation(format!(
                "request id {id} collides with an outstanding request"
            ))
            .into());
        }
        Ok(())
    }

    /// Sends a message out on the writer path, applying any state transition the message implies.
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        self.transition_state_from_sending_message(&message)?;
        self.message_tx
            .send(message)
            .map_err(|_| SessionLostError.into())
    }

    fn transition_state_from_sending_message(&mut self, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Hello(message) => SessionState::Authenticating(AuthenticatingSessionState {
                realm: message.realm.clone(),
            }),
            Message::Goodbye(_) => match self.state {
                SessionState::Leaving => return Ok(()),
                _ => SessionState::Leaving,
            },
            Message::Abort(_) => SessionState::Failed,
            _ => return Ok(()),
        };
        self.transition_state(next_state)
    }

    /// Handles a message received from the router.
    ///
    /// An error returned here is fatal: the session sends ABORT and fails.
    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("Peer {} received message: {message:?}", self.name);
        if let Err(err) = self.handle_message_on_state_machine(message).await {
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine(&mut self, message: Message) -> Result<()> {
        match &self.state {
            SessionState::Disconnected | SessionState::Connecting => {
                Err(InteractionError::ProtocolViolation(format!(
                    "received {} message before session establishment started",
                    message.message_name()
                ))
                .into())
            }
            SessionState::Authenticating(_) => self.handle_authenticating(message).await,
            SessionState::Joined(_) => self.handle_joined(message).await,
            SessionState::Leaving => self.handle_leaving(message),
            SessionState::Closed | SessionState::Failed => {
                // The connection is already finished; late messages are meaningless.
                debug!(
                    "Peer {} dropped {} message received on a finished session",
                    self.name,
                    message.message_name()
                );
                Ok(())
            }
        }
    }

    async fn handle_authenticating(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Challenge(message) => self.handle_challenge(message).await,
            Message::Welcome(message) => self.handle_welcome(message),
            message @ Message::Abort(_) => {
                warn!(
                    "Peer {} session establishment aborted by router: {message:?}",
                    self.name
                );
                let err = error_from_message(&message)?;
                if let Some(joined_tx) = self.pending_join.take() {
                    joined_tx.send(Err(err)).ok();
                }
                self.close_reason = message.reason().cloned();
                self.transition_state(SessionState::Failed)
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an establishing session",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_challenge(&mut self, challenge: ChallengeMessage) -> Result<()> {
        if self.challenge_rounds >= 2 {
            return Err(InteractionError::ProtocolViolation(
                "authentication did not progress after repeated challenges".to_owned(),
            )
            .into());
        }
        self.challenge_rounds += 1;
        let authenticator = self
            .authenticators
            .iter()
            .find(|authenticator| authenticator.auth_method() == challenge.auth_method)
            .ok_or_else(|| {
                InteractionError::AuthenticationFailed(format!(
                    "no authenticator for method {}",
                    challenge.auth_method
                ))
            })?;
        let response = authenticator.handle_challenge(&challenge).await?;
        self.send_authenticate(response)
    }

    fn send_authenticate(&mut self, message: AuthenticateMessage) -> Result<()> {
        self.send_message(Message::Authenticate(message))
    }

    fn handle_welcome(&mut self, message: WelcomeMessage) -> Result<()> {
        let realm = match &self.state {
            SessionState::Authenticating(state) => state.realm.clone(),
            _ => return Err(BasicError::Internal("expected establishing state".to_owned()).into()),
        };
        let session_info = SessionInfo {
            session_id: message.session,
            realm: realm.clone(),
        };
        self.transition_state(SessionState::Joined(JoinedSessionState {
            session_id: message.session,
            realm,
        }))?;
        info!(
            "Peer {} started session {} on realm {}",
            self.name, session_info.session_id, session_info.realm
        );
        *self.session_info.lock().unwrap() = Some(session_info.clone());
        if let Some(joined_tx) = self.pending_join.take() {
            joined_tx.send(Ok(session_info.clone())).ok();
        }
        self.joined_tx.send(session_info).ok();
        Ok(())
    }

    async fn handle_joined(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Result(message) => self.handle_result(message),
            Message::Error(message) => self.handle_error(message),
            Message::Event(message) => self.handle_event(message),
            Message::Subscribed(message) => self.handle_subscribed(message),
            Message::Unsubscribed(message) => self.handle_unsubscribed(message),
            Message::Published(message) => self.handle_published(message),
            Message::Registered(message) => self.handle_registered(message),
            Message::Unregistered(message) => self.handle_unregistered(message),
            Message::Invocation(message) => self.handle_invocation(message),
            Message::Goodbye(message) => {
                info!(
                    "Peer {} session closed by router ({})",
                    self.name, message.reason
                );
                self.close_reason = Some(message.reason.clone());
                self.send_message(goodbye_and_out())?;
                self.transition_state(SessionState::Closed)
            }
            message @ Message::Abort(_) => {
                warn!("Peer {} session aborted by router: {message:?}", self.name);
                self.close_reason = message.reason().cloned();
                self.transition_state(SessionState::Failed)
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_leaving(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(message) => {
                self.close_reason.get_or_insert(message.reason);
                self.transition_state(SessionState::Closed)
            }
            // Responses racing with the GOODBYE handshake are meaningless to their callers, which
            // are about to observe the session ending.
            Message::Result(_)
            | Message::Error(_)
            | Message::Event(_)
            | Message::Subscribed(_)
            | Message::Unsubscribed(_)
            | Message::Published(_)
            | Message::Registered(_)
            | Message::Unregistered(_)
            | Message::Invocation(_) => {
                debug!(
                    "Peer {} dropped {} message received while leaving",
                    self.name,
                    message.message_name()
                );
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a closing session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_result(&mut self, message: ResultMessage) -> Result<()> {
        match self.pending_calls.remove(&message.call_request) {
            Some(pending) => {
                pending
                    .result_tx
                    .send(Ok(RpcResult {
                        arguments: message.yield_arguments,
                        arguments_keyword: message.yield_arguments_keyword,
                    }))
                    .ok();
            }
            None => {
                // Can legitimately race with cancellation.
                debug!(
                    "Peer {} dropped RESULT for unknown request {}",
                    self.name, message.call_request
                );
            }
        }
        Ok(())
    }

    fn handle_error(&mut self, message: ErrorMessage) -> Result<()> {
        let request_id = message.request;
        let details_message = match message.details.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => message.error.to_string(),
        };
        let reason = message.error;
        let make_err = || error_from_uri_reason_and_message(reason.clone(), details_message.clone());

        if let Some(pending) = self.pending_calls.remove(&request_id) {
            pending.result_tx.send(Err(make_err())).ok();
        } else if let Some(pending) = self.pending_subscribes.remove(&request_id) {
            for waiter in pending.waiters {
                waiter.send(Err(make_err())).ok();
            }
        } else if let Some(pending) = self.pending_unsubscribes.remove(&request_id) {
            if let Some(tx) = pending.unsubscribed_tx {
                tx.send(Err(make_err())).ok();
            }
        } else if let Some(tx) = self.pending_publishes.remove(&request_id) {
            tx.send(Err(make_err())).ok();
        } else if let Some(pending) = self.pending_registers.remove(&request_id) {
            pending.registered_tx.send(Err(make_err())).ok();
        } else if let Some(pending) = self.pending_unregisters.remove(&request_id) {
            pending.unregistered_tx.send(Err(make_err())).ok();
        } else {
            // Can legitimately race with cancellation.
            debug!(
                "Peer {} dropped ERROR for unknown request {request_id} ({reason})",
                self.name
            );
        }
        Ok(())
    }

    fn handle_subscribed(&mut self, message: SubscribedMessage) -> Result<()> {
        let pending = match self.pending_subscribes.remove(&message.subscribe_request) {
            Some(pending) => pending,
            None => {
                debug!(
                    "Peer {} dropped SUBSCRIBED for unknown request {}",
                    self.name, message.subscribe_request
                );
                return Ok(());
            }
        };
        let (event_tx, _) = broadcast::channel(16);
        self.subscriptions
            .insert(message.subscription, pending.topic.clone());
        self.topics.insert(
            pending.topic.clone(),
            ActiveSubscription {
                subscription_id: message.subscription,
                event_tx: event_tx.clone(),
            },
        );
        for waiter in pending.waiters {
            waiter
                .send(Ok(Subscription {
                    id: message.subscription,
                    topic: pending.topic.clone(),
                    event_rx: event_tx.subscribe(),
                }))
                .ok();
        }
        Ok(())
    }

    fn handle_unsubscribed(&mut self, message: UnsubscribedMessage) -> Result<()> {
        match self.pending_unsubscribes.remove(&message.unsubscribe_request) {
            Some(pending) => {
                if let Some(tx) = pending.unsubscribed_tx {
                    tx.send(Ok(())).ok();
                }
            }
            None => {
                debug!(
                    "Peer {} dropped UNSUBSCRIBED for unknown request {}",
                    self.name, message.unsubscribe_request
                );
            }
        }
        Ok(())
    }

    fn handle_published(&mut self, message: PublishedMessage) -> Result<()> {
        match self.pending_publishes.remove(&message.publish_request) {
            Some(tx) => {
                tx.send(Ok(())).ok();
            }
            None => {
                debug!(
                    "Peer {} dropped PUBLISHED for unknown request {}",
                    self.name, message.publish_request
                );
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, message: EventMessage) -> Result<()> {
        // The router-assigned subscription ID is authoritative, not the topic.
        let topic = match self.subscriptions.get(&message.subscribed_subscription) {
            Some(topic) => topic,
            None => {
                debug!(
                    "Peer {} dropped EVENT for unknown subscription {}",
                    self.name, message.subscribed_subscription
                );
                return Ok(());
            }
        };
        let active = match self.topics.get(topic) {
            Some(active) => active,
            None => return Err(BasicError::Internal("subscription has no topic".to_owned()).into()),
        };
        active
            .event_tx
            .send(ReceivedEvent {
                topic: topic.clone(),
                publication_id: message.published_publication,
                arguments: message.publish_arguments,
                arguments_keyword: message.publish_arguments_keyword,
            })
            .ok();
        Ok(())
    }

    fn handle_registered(&mut self, message: RegisteredMessage) -> Result<()> {
        let pending = match self.pending_registers.remove(&message.register_request) {
            Some(pending) => pending,
            None => {
                debug!(
                    "Peer {} dropped REGISTERED for unknown request {}",
                    self.name, message.register_request
                );
                return Ok(());
            }
        };
        let (invocation_tx, invocation_rx) = broadcast::channel(16);
        self.procedures
            .insert(pending.procedure.clone(), message.registration);
        self.registrations.insert(
            message.registration,
            ActiveRegistration {
                procedure: pending.procedure,
                invocation_tx,
            },
        );
        pending
            .registered_tx
            .send(Ok(Procedure {
                id: message.registration,
                invocation_rx,
            }))
            .ok();
        Ok(())
    }

    fn handle_unregistered(&mut self, message: UnregisteredMessage) -> Result<()> {
        match self.pending_unregisters.remove(&message.unregister_request) {
            Some(pending) => {
                pending.unregistered_tx.send(Ok(())).ok();
            }
            None => {
                debug!(
                    "Peer {} dropped UNREGISTERED for unknown request {}",
                    self.name, message.unregister_request
                );
            }
        }
        Ok(())
    }

    fn handle_invocation(&mut self, message: InvocationMessage) -> Result<()> {
        let registration = match self.registrations.get(&message.registered_registration) {
            Some(registration) => registration,
            None => {
                let message = Message::Invocation(message);
                return self.send_message(error_for_request(
                    &message,
                    &InteractionError::NoSuchRegistration.into(),
                ));
            }
        };
        let invocation = Invocation {
            request_id: message.request,
            procedure: registration.procedure.clone(),
            arguments: message.call_arguments,
            arguments_keyword: message.call_arguments_keyword,
            message_tx: self.message_tx.clone(),
        };
        if registration.invocation_tx.send(invocation).is_err() {
            let message = Message::Invocation(InvocationMessage {
                request: message.request,
                ..Default::default()
            });
            return self.send_message(error_for_request(
                &message,
                &BasicError::Internal("procedure has no active handler".to_owned()).into(),
            ));
        }
        Ok(())
    }

    /// Fails the session after an unrecoverable error: ABORT is sent (best effort) and the
    /// session transitions to its failed state.
    fn fail(&mut self, err: &Error) {
        if self.state.terminal() {
            return;
        }
        if let Some(joined_tx) = self.pending_join.take() {
            // The original error cannot be cloned; reconstruct an equivalent one for the waiter.
            joined_tx
                .send(Err(error_from_uri_reason_and_message(
                    uri_for_error(err),
                    err.to_string(),
                )))
                .ok();
        }
        self.message_tx.send(abort_message_for_error(err)).ok();
        self.transition_state(SessionState::Failed).ok();
    }

    fn transition_state(&mut self, state: SessionState) -> Result<()> {
        if state == self.state {
            return Ok(());
        }

        if !self.state.allowed_state_transition(&state) {
            return Err(BasicError::Internal(format!(
                "invalid state transition from {:?} to {state:?}",
                self.state
            ))
            .into());
        }

        trace!(
            "Peer {} transitioned from {:?} to {state:?}",
            self.name, self.state
        );
        self.state = state;

        match self.state {
            SessionState::Closed => self.finish(true),
            SessionState::Failed => self.finish(false),
            _ => (),
        }

        Ok(())
    }

    /// Invalidates all correlation state and notifies closed listeners.
    ///
    /// Every outstanding completion sink is resolved here, so no caller is ever left dangling.
    fn finish(&mut self, clean: bool) {
        *self.session_info.lock().unwrap() = None;

        if let Some(joined_tx) = self.pending_join.take() {
            joined_tx.send(Err(SessionLostError.into())).ok();
        }
        for left_tx in self.pending_leaves.drain(..) {
            if clean {
                left_tx.send(Ok(())).ok();
            } else {
                left_tx.send(Err(SessionLostError.into())).ok();
            }
        }
        for (_, pending) in self.pending_calls.drain() {
            pending.result_tx.send(Err(SessionLostError.into())).ok();
        }
        for (_, pending) in self.pending_subscribes.drain() {
            for waiter in pending.waiters {
                waiter.send(Err(SessionLostError.into())).ok();
            }
        }
        for (_, pending) in self.pending_unsubscribes.drain() {
            if let Some(tx) = pending.unsubscribed_tx {
                tx.send(Err(SessionLostError.into())).ok();
            }
        }
        for (_, tx) in self.pending_publishes.drain() {
            tx.send(Err(SessionLostError.into())).ok();
        }
        for (_, pending) in self.pending_registers.drain() {
            pending
                .registered_tx
                .send(Err(SessionLostError.into()))
                .ok();
        }
        for (_, pending) in self.pending_unregisters.drain() {
            pending
                .unregistered_tx
                .send(Err(SessionLostError.into()))
                .ok();
        }

        // Dropping the senders ends every subscriber's event stream and every procedure's
        // invocation stream.
        self.topics.clear();
        self.subscriptions.clear();
        self.registrations.clear();
        self.procedures.clear();
        self.authenticators.clear();

        info!(
            "Peer {} session finished ({})",
            self.name,
            if clean { "clean" } else { "unclean" }
        );
        self.closed_tx
            .send(ExitInfo {
                clean,
                reason: self.close_reason.clone(),
            })
            .ok();
    }
}
