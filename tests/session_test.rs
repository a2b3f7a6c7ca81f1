mod common;

use battler_wamp_values::{
    Dictionary,
    Value,
};
use wamp_peer::{
    core::{
        error::{
            InteractionError,
            NotJoinedError,
        },
        id::Id,
        stream::{
            DirectMessageStream,
            direct_message_stream_pair,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        GoodbyeMessage,
        Message,
        WelcomeMessage,
    },
    peer::{
        PeerConfig,
        PublishedEvent,
        RpcCall,
        WebSocketPeer,
        new_web_socket_peer,
    },
};

const REALM: &str = "com.example.realm";

fn create_peer(name: &str) -> WebSocketPeer {
    let mut config = PeerConfig::default();
    config.name = name.to_owned();
    new_web_socket_peer(config).unwrap()
}

async fn connected_peer(name: &str) -> (WebSocketPeer, DirectMessageStream) {
    let peer = create_peer(name);
    let (peer_stream, router_stream) = direct_message_stream_pair();
    peer.direct_connect(Box::new(peer_stream)).await.unwrap();
    (peer, router_stream)
}

async fn joined_peer(name: &str) -> (WebSocketPeer, DirectMessageStream) {
    let (peer, mut router) = connected_peer(name).await;
    let (result, _) = tokio::join!(
        peer.join_realm(REALM),
        common::accept_session(&mut router, 8212)
    );
    result.unwrap();
    (peer, router)
}

#[tokio::test]
async fn joins_realm_and_notifies_joined_listeners() {
    common::setup_test_environment();

    let (peer, mut router) = connected_peer("peer").await;
    let mut joined_rx = peer.joined_rx();

    let (result, hello) = tokio::join!(
        peer.join_realm(REALM),
        common::accept_session(&mut router, 12345)
    );
    assert_matches::assert_matches!(result, Ok(session_info) => {
        assert_eq!(session_info.session_id, Id::try_from(12345).unwrap());
        assert_eq!(session_info.realm.as_ref(), REALM);
    });

    assert_eq!(hello.realm.as_ref(), REALM);
    assert_matches::assert_matches!(hello.details.get("agent"), Some(Value::String(_)));
    assert_matches::assert_matches!(hello.details.get("roles"), Some(Value::Dictionary(roles)) => {
        assert!(roles.contains_key("caller"));
        assert!(roles.contains_key("callee"));
        assert!(roles.contains_key("publisher"));
        assert!(roles.contains_key("subscriber"));
    });

    assert_matches::assert_matches!(joined_rx.recv().await, Ok(session_info) => {
        assert_eq!(session_info.session_id, Id::try_from(12345).unwrap());
    });
    assert_matches::assert_matches!(peer.current_session_info().await, Some(session_info) => {
        assert_eq!(session_info.session_id, Id::try_from(12345).unwrap());
    });
}

#[tokio::test]
async fn application_operations_fail_before_joining() {
    common::setup_test_environment();

    let (peer, _router) = connected_peer("peer").await;

    assert_matches::assert_matches!(
        peer.call_and_wait(
            Uri::try_from("com.example.fn").unwrap(),
            RpcCall::default(),
        )
        .await,
        Err(err) => assert!(err.is::<NotJoinedError>())
    );
    assert_matches::assert_matches!(
        peer.subscribe(Uri::try_from("com.example.topic").unwrap()).await,
        Err(err) => assert!(err.is::<NotJoinedError>())
    );
    assert_matches::assert_matches!(
        peer.publish(
            Uri::try_from("com.example.topic").unwrap(),
            PublishedEvent::default(),
        )
        .await,
        Err(err) => assert!(err.is::<NotJoinedError>())
    );
    assert_matches::assert_matches!(
        peer.register(Uri::try_from("com.example.fn").unwrap()).await,
        Err(err) => assert!(err.is::<NotJoinedError>())
    );
}

#[tokio::test]
async fn leaves_realm_with_goodbye_handshake() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("peer").await;
    let mut closed_rx = peer.closed_rx();

    let (result, _) = tokio::join!(peer.leave_realm(), async {
        let goodbye = assert_matches::assert_matches!(
            common::receive_message(&mut router).await,
            Message::Goodbye(message) => message
        );
        assert_eq!(goodbye.reason.as_ref(), "wamp.close.normal");
        common::send_message(
            &mut router,
            Message::Goodbye(GoodbyeMessage {
                details: Dictionary::default(),
                reason: Uri::try_from("wamp.close.goodbye_and_out").unwrap(),
            }),
        )
        .await;
    });
    result.unwrap();

    assert_matches::assert_matches!(closed_rx.recv().await, Ok(exit_info) => {
        assert!(exit_info.clean);
    });
    assert_eq!(peer.current_session_info().await, None);
}

#[tokio::test]
async fn router_initiated_goodbye_closes_cleanly() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("peer").await;
    let mut closed_rx = peer.closed_rx();

    common::send_message(
        &mut router,
        Message::Goodbye(GoodbyeMessage {
            details: Dictionary::default(),
            reason: Uri::try_from("wamp.close.system_shutdown").unwrap(),
        }),
    )
    .await;

    let echo = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Goodbye(message) => message
    );
    assert_eq!(echo.reason.as_ref(), "wamp.close.goodbye_and_out");

    assert_matches::assert_matches!(closed_rx.recv().await, Ok(exit_info) => {
        assert!(exit_info.clean);
        assert_matches::assert_matches!(exit_info.reason, Some(reason) => {
            assert_eq!(reason.as_ref(), "wamp.close.system_shutdown");
        });
    });
}

#[tokio::test]
async fn abort_fails_the_session() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("peer").await;
    let mut closed_rx = peer.closed_rx();

    common::send_message(
        &mut router,
        Message::Abort(AbortMessage {
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String("session killed".to_owned()),
            )]),
            reason: Uri::try_from("wamp.error.internal").unwrap(),
            ..Default::default()
        }),
    )
    .await;

    assert_matches::assert_matches!(closed_rx.recv().await, Ok(exit_info) => {
        assert!(!exit_info.clean);
        assert_matches::assert_matches!(exit_info.reason, Some(reason) => {
            assert_eq!(reason.as_ref(), "wamp.error.internal");
        });
    });
    assert_eq!(peer.current_session_info().await, None);
}

#[tokio::test]
async fn out_of_sequence_message_aborts_session() {
    common::setup_test_environment();

    let (_peer, mut router) = joined_peer("peer").await;

    // A second WELCOME on an established session violates the protocol.
    common::send_message(
        &mut router,
        Message::Welcome(WelcomeMessage {
            session: Id::try_from(1).unwrap(),
            details: Dictionary::default(),
        }),
    )
    .await;

    let abort = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Abort(message) => message
    );
    assert_eq!(abort.reason.as_ref(), "wamp.error.protocol_violation");
}

#[tokio::test]
async fn join_fails_when_router_aborts_establishment() {
    common::setup_test_environment();

    let (peer, mut router) = connected_peer("peer").await;

    let (result, _) = tokio::join!(peer.join_realm(REALM), async {
        assert_matches::assert_matches!(
            common::receive_message(&mut router).await,
            Message::Hello(_)
        );
        common::send_message(
            &mut router,
            Message::Abort(AbortMessage {
                details: Dictionary::from_iter([(
                    "message".to_owned(),
                    Value::String("no such realm".to_owned()),
                )]),
                reason: Uri::try_from("wamp.error.no_such_realm").unwrap(),
                ..Default::default()
            }),
        )
        .await;
    });
    assert_matches::assert_matches!(result, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast::<InteractionError>(),
            Ok(InteractionError::NoSuchRealm)
        );
    });
}

#[tokio::test]
async fn peer_reconnects_after_disconnecting() {
    common::setup_test_environment();

    let (peer, _router) = joined_peer("peer").await;
    peer.disconnect().await.unwrap();

    let (peer_stream, mut router) = direct_message_stream_pair();
    peer.direct_connect(Box::new(peer_stream)).await.unwrap();
    let (result, _) = tokio::join!(
        peer.join_realm(REALM),
        common::accept_session(&mut router, 999)
    );
    assert_matches::assert_matches!(result, Ok(session_info) => {
        assert_eq!(session_info.session_id, Id::try_from(999).unwrap());
    });
}
