pub mod connector;
pub mod peer;
pub mod session;
pub mod web_socket_peer;

pub use peer::{
    InvocationHandler,
    Peer,
    PeerConfig,
    PeerNotConnectedError,
    PendingRpc,
    SupportedAuthMethod,
    WebSocketConfig,
};
pub use session::{
    ExitInfo,
    Invocation,
    Procedure,
    PublishOptions,
    PublishedEvent,
    ReceivedEvent,
    RpcCall,
    RpcResult,
    RpcYield,
    SessionInfo,
    Subscription,
};
pub use web_socket_peer::{
    WebSocketPeer,
    new_web_socket_peer,
};
