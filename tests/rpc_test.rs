mod common;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use battler_wamp_values::{
    Dictionary,
    Integer,
    List,
    Value,
    WampList,
};
use wamp_peer::{
    core::{
        error::{
            BasicError,
            InteractionError,
            RemoteError,
            SessionLostError,
        },
        id::Id,
        stream::{
            DirectMessageStream,
            direct_message_stream_pair,
        },
        uri::Uri,
    },
    message::message::{
        ErrorMessage,
        InvocationMessage,
        Message,
        RegisteredMessage,
        ResultMessage,
        UnregisteredMessage,
    },
    peer::{
        Invocation,
        InvocationHandler,
        PeerConfig,
        RpcCall,
        RpcYield,
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

async fn joined_peer(name: &str) -> (WebSocketPeer, DirectMessageStream) {
    let peer = create_peer(name);
    let (peer_stream, mut router) = direct_message_stream_pair();
    peer.direct_connect(Box::new(peer_stream)).await.unwrap();
    let (result, _) = tokio::join!(
        peer.join_realm(REALM),
        common::accept_session(&mut router, 8212)
    );
    result.unwrap();
    (peer, router)
}

async fn answer_call_echoing_arguments(router: &mut DirectMessageStream) {
    let call = assert_matches::assert_matches!(
        common::receive_message(router).await,
        Message::Call(message) => message
    );
    common::send_message(
        router,
        Message::Result(ResultMessage {
            call_request: call.request,
            details: Dictionary::default(),
            yield_arguments: call.arguments,
            yield_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;
}

#[derive(Debug, PartialEq, WampList)]
struct Sum {
    value: Integer,
}

#[tokio::test]
async fn call_resolves_with_matching_result() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;

    let (result, _) = tokio::join!(
        peer.call_and_wait(
            Uri::try_from("com.example.add2").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(2), Value::Integer(3)]),
                ..Default::default()
            },
        ),
        async {
            let call = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Call(message) => message
            );
            assert_eq!(call.procedure.as_ref(), "com.example.add2");
            assert_eq!(
                call.arguments,
                List::from_iter([Value::Integer(2), Value::Integer(3)])
            );
            common::send_message(
                &mut router,
                Message::Result(ResultMessage {
                    call_request: call.request,
                    details: Dictionary::default(),
                    yield_arguments: List::from_iter([Value::Integer(5)]),
                    yield_arguments_keyword: Dictionary::default(),
                }),
            )
            .await;
        }
    );
    assert_matches::assert_matches!(result, Ok(result) => {
        pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(5)]));
        assert_eq!(result.decode_arguments::<Sum>().unwrap(), Sum { value: 5 });
    });
}

#[tokio::test]
async fn call_rejects_with_remote_error() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;

    let (result, _) = tokio::join!(
        peer.call_and_wait(
            Uri::try_from("com.example.fail").unwrap(),
            RpcCall::default(),
        ),
        async {
            let call = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Call(message) => message
            );
            common::send_message(
                &mut router,
                Message::Error(ErrorMessage {
                    request_type: 48,
                    request: call.request,
                    details: Dictionary::from_iter([(
                        "message".to_owned(),
                        Value::String("bad".to_owned()),
                    )]),
                    error: Uri::try_from("com.example.error").unwrap(),
                    ..Default::default()
                }),
            )
            .await;
        }
    );
    assert_matches::assert_matches!(result, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<RemoteError>(), Ok(err) => {
            assert_eq!(err.reason.as_ref(), "com.example.error");
            assert_eq!(err.message, "bad");
        });
    });
}

#[tokio::test]
async fn concurrent_calls_resolve_independently_out_of_order() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;

    let mut pending = Vec::new();
    for i in 0..5 {
        pending.push(
            peer.call(
                Uri::try_from("com.example.echo").unwrap(),
                RpcCall {
                    arguments: List::from_iter([Value::Integer(i)]),
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );
    }

    let mut calls = Vec::new();
    for _ in 0..5 {
        calls.push(assert_matches::assert_matches!(
            common::receive_message(&mut router).await,
            Message::Call(message) => message
        ));
    }
    // The router may answer in any order relative to issue order.
    for call in calls.iter().rev() {
        common::send_message(
            &mut router,
            Message::Result(ResultMessage {
                call_request: call.request,
                details: Dictionary::default(),
                yield_arguments: call.arguments.clone(),
                yield_arguments_keyword: Dictionary::default(),
            }),
        )
        .await;
    }

    for (i, pending) in pending.into_iter().enumerate() {
        let result = pending.result().await.unwrap();
        pretty_assertions::assert_eq!(
            result.arguments,
            List::from_iter([Value::Integer(i as Integer)])
        );
    }
}

#[tokio::test]
async fn result_for_unknown_request_is_dropped() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;

    common::send_message(
        &mut router,
        Message::Result(ResultMessage {
            call_request: Id::try_from(99999).unwrap(),
            details: Dictionary::default(),
            yield_arguments: List::default(),
            yield_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;

    // The session survives and serves calls normally.
    let (result, _) = tokio::join!(
        peer.call_and_wait(
            Uri::try_from("com.example.echo").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(1)]),
                ..Default::default()
            },
        ),
        answer_call_echoing_arguments(&mut router)
    );
    assert_matches::assert_matches!(result, Ok(result) => {
        assert_eq!(result.arguments, List::from_iter([Value::Integer(1)]));
    });
}

#[tokio::test]
async fn session_loss_fails_outstanding_calls() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;
    let mut closed_rx = peer.closed_rx();

    let pending_a = peer
        .call(Uri::try_from("com.example.a").unwrap(), RpcCall::default())
        .await
        .unwrap();
    let pending_b = peer
        .call(Uri::try_from("com.example.b").unwrap(), RpcCall::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Call(_)
    );
    assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Call(_)
    );

    drop(router);

    assert_matches::assert_matches!(pending_a.result().await, Err(err) => {
        assert!(err.is::<SessionLostError>());
    });
    assert_matches::assert_matches!(pending_b.result().await, Err(err) => {
        assert!(err.is::<SessionLostError>());
    });
    assert_matches::assert_matches!(closed_rx.recv().await, Ok(exit_info) => {
        assert!(!exit_info.clean);
    });
}

#[tokio::test]
async fn canceled_call_fails_locally_and_sends_cancel() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;

    let pending = peer
        .call(
            Uri::try_from("com.example.slow").unwrap(),
            RpcCall::default(),
        )
        .await
        .unwrap();
    let call = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Call(message) => message
    );

    pending.cancel().unwrap();
    let cancel = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Cancel(message) => message
    );
    assert_eq!(cancel.call_request, call.request);
    assert_matches::assert_matches!(cancel.options.get("mode"), Some(Value::String(mode)) => {
        assert_eq!(mode, "killnowait");
    });
    assert_matches::assert_matches!(pending.result().await, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast::<InteractionError>(),
            Ok(InteractionError::Canceled)
        );
    });

    // A late RESULT for the canceled call is dropped; the session stays usable.
    common::send_message(
        &mut router,
        Message::Result(ResultMessage {
            call_request: call.request,
            details: Dictionary::default(),
            yield_arguments: List::default(),
            yield_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;
    let (result, _) = tokio::join!(
        peer.call_and_wait(
            Uri::try_from("com.example.echo").unwrap(),
            RpcCall::default(),
        ),
        answer_call_echoing_arguments(&mut router)
    );
    result.unwrap();
}

#[tokio::test]
async fn call_timeout_cancels_the_call() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("caller").await;

    let pending = peer
        .call(
            Uri::try_from("com.example.slow").unwrap(),
            RpcCall {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let call = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Call(message) => message
    );
    assert_matches::assert_matches!(call.options.get("timeout"), Some(Value::Integer(100)));

    // The router never answers; expiry cancels the call.
    assert_matches::assert_matches!(pending.result().await, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast::<InteractionError>(),
            Ok(InteractionError::Canceled)
        );
    });
    let cancel = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Cancel(message) => message
    );
    assert_eq!(cancel.call_request, call.request);
}

#[tokio::test]
async fn registered_procedure_handles_invocations() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("callee").await;

    let (procedure, _) = tokio::join!(
        peer.register(Uri::try_from("com.example.add2").unwrap()),
        async {
            let register = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Register(message) => message
            );
            assert_eq!(register.procedure.as_ref(), "com.example.add2");
            common::send_message(
                &mut router,
                Message::Registered(RegisteredMessage {
                    register_request: register.request,
                    registration: Id::try_from(7777).unwrap(),
                }),
            )
            .await;
        }
    );
    let mut procedure = procedure.unwrap();
    assert_eq!(procedure.id, Id::try_from(7777).unwrap());

    common::send_message(
        &mut router,
        Message::Invocation(InvocationMessage {
            request: Id::try_from(4242).unwrap(),
            registered_registration: Id::try_from(7777).unwrap(),
            details: Dictionary::default(),
            call_arguments: List::from_iter([Value::Integer(2), Value::Integer(3)]),
            call_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;

    let invocation = procedure.invocation_rx.recv().await.unwrap();
    assert_eq!(invocation.procedure.as_ref(), "com.example.add2");
    let sum = invocation
        .arguments
        .iter()
        .filter_map(|value| value.integer())
        .sum::<Integer>();
    invocation
        .respond(Ok(RpcYield {
            arguments: List::from_iter([Value::Integer(sum)]),
            ..Default::default()
        }))
        .unwrap();

    let yield_message = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Yield(message) => message
    );
    assert_eq!(yield_message.invocation_request, Id::try_from(4242).unwrap());
    pretty_assertions::assert_eq!(
        yield_message.arguments,
        List::from_iter([Value::Integer(5)])
    );

    // A failed invocation is answered with an ERROR carrying the classified error URI.
    common::send_message(
        &mut router,
        Message::Invocation(InvocationMessage {
            request: Id::try_from(4243).unwrap(),
            registered_registration: Id::try_from(7777).unwrap(),
            details: Dictionary::default(),
            call_arguments: List::default(),
            call_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;
    let invocation = procedure.invocation_rx.recv().await.unwrap();
    invocation
        .respond(Err(BasicError::InvalidArgument(
            "invalid number of arguments".to_owned(),
        )
        .into()))
        .unwrap();
    let error = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Error(message) => message
    );
    assert_eq!(error.request, Id::try_from(4243).unwrap());
    assert_eq!(error.error.as_ref(), "wamp.error.invalid_argument");
}

struct Adder;

#[async_trait]
impl InvocationHandler for Adder {
    async fn handle_invocation(&self, invocation: &Invocation) -> Result<RpcYield> {
        let sum = invocation
            .arguments
            .iter()
            .map(|value| {
                value.integer().ok_or_else(|| {
                    BasicError::InvalidArgument("arguments must be integers".to_owned())
                })
            })
            .sum::<Result<Integer, _>>()?;
        Ok(RpcYield {
            arguments: List::from_iter([Value::Integer(sum)]),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn handler_serves_concurrent_invocations() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("callee").await;

    let (registration_id, _) = tokio::join!(
        peer.register_with_handler(Uri::try_from("com.example.add").unwrap(), Adder),
        async {
            let register = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Register(message) => message
            );
            common::send_message(
                &mut router,
                Message::Registered(RegisteredMessage {
                    register_request: register.request,
                    registration: Id::try_from(7777).unwrap(),
                }),
            )
            .await;
        }
    );
    assert_eq!(registration_id.unwrap(), Id::try_from(7777).unwrap());

    for (request, arguments) in [
        (1001, [Value::Integer(1), Value::Integer(2)]),
        (1002, [Value::Integer(30), Value::Integer(40)]),
    ] {
        common::send_message(
            &mut router,
            Message::Invocation(InvocationMessage {
                request: Id::try_from(request).unwrap(),
                registered_registration: Id::try_from(7777).unwrap(),
                details: Dictionary::default(),
                call_arguments: List::from_iter(arguments),
                call_arguments_keyword: Dictionary::default(),
            }),
        )
        .await;
    }

    // Invocations are handled independently, so the YIELDs may come back in either order.
    let mut results = Vec::new();
    for _ in 0..2 {
        let yield_message = assert_matches::assert_matches!(
            common::receive_message(&mut router).await,
            Message::Yield(message) => message
        );
        results.push((yield_message.invocation_request, yield_message.arguments));
    }
    let arguments_for = |request: u64| {
        results
            .iter()
            .find(|(id, _)| *id == Id::try_from(request).unwrap())
            .map(|(_, arguments)| arguments.clone())
            .unwrap()
    };
    pretty_assertions::assert_eq!(arguments_for(1001), List::from_iter([Value::Integer(3)]));
    pretty_assertions::assert_eq!(arguments_for(1002), List::from_iter([Value::Integer(70)]));
}

#[tokio::test]
async fn invocation_for_unknown_registration_is_answered_with_error() {
    common::setup_test_environment();

    let (_peer, mut router) = joined_peer("callee").await;

    common::send_message(
        &mut router,
        Message::Invocation(InvocationMessage {
            request: Id::try_from(4040).unwrap(),
            registered_registration: Id::try_from(12321).unwrap(),
            details: Dictionary::default(),
            call_arguments: List::default(),
            call_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;

    let error = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Error(message) => message
    );
    assert_eq!(error.request, Id::try_from(4040).unwrap());
    assert_eq!(error.error.as_ref(), "wamp.error.no_such_registration");
}

#[tokio::test]
async fn duplicate_registration_fails_locally() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("callee").await;

    let (procedure, _) = tokio::join!(
        peer.register(Uri::try_from("com.example.add2").unwrap()),
        async {
            let register = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Register(message) => message
            );
            common::send_message(
                &mut router,
                Message::Registered(RegisteredMessage {
                    register_request: register.request,
                    registration: Id::try_from(7777).unwrap(),
                }),
            )
            .await;
        }
    );
    procedure.unwrap();

    // The second registration fails without a wire round-trip.
    assert_matches::assert_matches!(
        peer.register(Uri::try_from("com.example.add2").unwrap()).await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast::<InteractionError>(),
                Ok(InteractionError::ProcedureAlreadyExists)
            );
        }
    );
}

#[tokio::test]
async fn unregister_removes_procedure() {
    common::setup_test_environment();

    let (peer, mut router) = joined_peer("callee").await;

    let (procedure, _) = tokio::join!(
        peer.register(Uri::try_from("com.example.add2").unwrap()),
        async {
            let register = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Register(message) => message
            );
            common::send_message(
                &mut router,
                Message::Registered(RegisteredMessage {
                    register_request: register.request,
                    registration: Id::try_from(7777).unwrap(),
                }),
            )
            .await;
        }
    );
    procedure.unwrap();

    let (result, _) = tokio::join!(
        peer.unregister(Uri::try_from("com.example.add2").unwrap()),
        async {
            let unregister = assert_matches::assert_matches!(
                common::receive_message(&mut router).await,
                Message::Unregister(message) => message
            );
            assert_eq!(
                unregister.registered_registration,
                Id::try_from(7777).unwrap()
            );
            common::send_message(
                &mut router,
                Message::Unregistered(UnregisteredMessage {
                    unregister_request: unregister.request,
                }),
            )
            .await;
        }
    );
    result.unwrap();

    // An invocation for the removed registration is rejected.
    common::send_message(
        &mut router,
        Message::Invocation(InvocationMessage {
            request: Id::try_from(4040).unwrap(),
            registered_registration: Id::try_from(7777).unwrap(),
            details: Dictionary::default(),
            call_arguments: List::default(),
            call_arguments_keyword: Dictionary::default(),
        }),
    )
    .await;
    let error = assert_matches::assert_matches!(
        common::receive_message(&mut router).await,
        Message::Error(message) => message
    );
    assert_eq!(error.error.as_ref(), "wamp.error.no_such_registration");

    // Unregistering a procedure that is not registered fails locally.
    assert_matches::assert_matches!(
        peer.unregister(Uri::try_from("com.example.add2").unwrap()).await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast::<InteractionError>(),
                Ok(InteractionError::NoSuchRegistration)
            );
        }
    );
}
