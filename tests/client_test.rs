mod common;

use battler_wamp_values::{
    Dictionary,
    List,
    Value,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio_tungstenite::{
    WebSocketStream,
    accept_hdr_async,
    tungstenite::{
        Message as WsMessage,
        handshake::server::{
            Request,
            Response,
        },
        http::{
            HeaderValue,
            header::SEC_WEBSOCKET_PROTOCOL,
        },
    },
};
use wamp_peer::{
    client::{
        Client,
        ClientConfig,
        new_web_socket_client,
    },
    core::{
        id::Id,
        stream::direct_message_stream_pair,
        uri::Uri,
    },
    message::message::{
        GoodbyeMessage,
        Message,
        ResultMessage,
        WelcomeMessage,
    },
    peer::{
        PeerConfig,
        RpcCall,
        new_web_socket_peer,
    },
    serializer::serializer::{
        Serializer,
        SerializerType,
        new_serializer,
    },
};

const REALM: &str = "com.example.realm";

async fn receive_ws_message(
    stream: &mut WebSocketStream<TcpStream>,
    serializer: &dyn Serializer,
) -> Message {
    loop {
        let message = stream.next().await.unwrap().unwrap();
        if message.is_text() || message.is_binary() {
            return serializer.deserialize(&message.into_data()).unwrap();
        }
    }
}

async fn send_ws_message(
    stream: &mut WebSocketStream<TcpStream>,
    serializer: &dyn Serializer,
    message: Message,
) {
    let data = serializer.serialize(&message).unwrap();
    stream
        .send(WsMessage::Text(String::from_utf8(data).unwrap().into()))
        .await
        .unwrap();
}

/// A minimal router over a real WebSocket acceptor: negotiates the JSON subprotocol, welcomes one
/// session, echoes calls, and completes the GOODBYE handshake.
async fn run_json_router(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut stream = accept_hdr_async(stream, |_: &Request, mut response: Response| {
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("wamp.2.json"),
        );
        Ok(response)
    })
    .await
    .unwrap();
    let serializer = new_serializer(SerializerType::Json);

    assert_matches::assert_matches!(
        receive_ws_message(&mut stream, serializer.as_ref()).await,
        Message::Hello(_)
    );
    send_ws_message(
        &mut stream,
        serializer.as_ref(),
        Message::Welcome(WelcomeMessage {
            session: Id::try_from(31337).unwrap(),
            details: Dictionary::default(),
        }),
    )
    .await;

    loop {
        match receive_ws_message(&mut stream, serializer.as_ref()).await {
            Message::Call(call) => {
                send_ws_message(
                    &mut stream,
                    serializer.as_ref(),
                    Message::Result(ResultMessage {
                        call_request: call.request,
                        details: Dictionary::default(),
                        yield_arguments: call.arguments,
                        yield_arguments_keyword: Dictionary::default(),
                    }),
                )
                .await;
            }
            Message::Goodbye(_) => {
                send_ws_message(
                    &mut stream,
                    serializer.as_ref(),
                    Message::Goodbye(GoodbyeMessage {
                        details: Dictionary::default(),
                        reason: Uri::try_from("wamp.close.goodbye_and_out").unwrap(),
                    }),
                )
                .await;
                break;
            }
            message => panic!("unexpected {} message", message.message_name()),
        }
    }
}

/// Binds a local port and drops the listener, producing an endpoint that refuses connections.
async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    format!("ws://{addr}")
}

#[tokio::test]
async fn client_fails_over_to_next_endpoint() {
    common::setup_test_environment();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let router = tokio::spawn(run_json_router(listener));

    let client = new_web_socket_client(ClientConfig {
        uris: Vec::from_iter([dead_endpoint().await, live_endpoint]),
        realm: REALM.to_owned(),
        auth_methods: Vec::new(),
    })
    .unwrap();

    let mut handle = client.connect().await.unwrap();
    assert_eq!(handle.session_info().session_id, Id::try_from(31337).unwrap());
    assert_eq!(handle.session_info().realm.as_ref(), REALM);

    let result = client
        .peer()
        .call_and_wait(
            Uri::try_from("com.example.echo").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::String("ping".to_owned())]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    pretty_assertions::assert_eq!(
        result.arguments,
        List::from_iter([Value::String("ping".to_owned())])
    );

    client.disconnect().await.unwrap();
    let exit_info = handle.finished().await;
    assert!(exit_info.clean);
    router.await.unwrap();
}

#[tokio::test]
async fn client_with_no_reachable_endpoint_fails() {
    common::setup_test_environment();

    let client = new_web_socket_client(ClientConfig {
        uris: Vec::from_iter([dead_endpoint().await, dead_endpoint().await]),
        realm: REALM.to_owned(),
        auth_methods: Vec::new(),
    })
    .unwrap();
    assert_matches::assert_matches!(client.connect().await, Err(err) => {
        assert!(err.to_string().contains("all router endpoints failed"));
    });

    let client = new_web_socket_client(ClientConfig {
        uris: Vec::new(),
        realm: REALM.to_owned(),
        auth_methods: Vec::new(),
    })
    .unwrap();
    assert_matches::assert_matches!(client.connect().await, Err(err) => {
        assert!(err.to_string().contains("no router endpoint is configured"));
    });
}

#[tokio::test]
async fn client_rejects_invalid_realm() {
    common::setup_test_environment();

    assert_matches::assert_matches!(
        new_web_socket_client(ClientConfig {
            uris: Vec::new(),
            realm: "Not A Realm".to_owned(),
            auth_methods: Vec::new(),
        }),
        Err(_)
    );
}

#[tokio::test]
async fn client_reports_unclean_exit_on_connection_loss() {
    common::setup_test_environment();

    let client = Client::new(
        ClientConfig {
            uris: Vec::new(),
            realm: REALM.to_owned(),
            auth_methods: Vec::new(),
        },
        new_web_socket_peer(PeerConfig::default()).unwrap(),
    )
    .unwrap();

    let (peer_stream, mut router) = direct_message_stream_pair();
    let (handle, _) = tokio::join!(
        client.direct_connect(Box::new(peer_stream)),
        common::accept_session(&mut router, 12345)
    );
    let mut handle = handle.unwrap();

    // The transport drops with the session up.
    drop(router);

    let exit_info = handle.finished().await;
    assert!(!exit_info.clean);
}
