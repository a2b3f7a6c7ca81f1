#![allow(dead_code)]

use std::sync::Once;

use battler_wamp_values::Dictionary;
use futures_util::{
    SinkExt,
    StreamExt,
};
use wamp_peer::{
    core::{
        id::Id,
        stream::{
            DirectMessageStream,
            StreamMessage,
        },
    },
    message::message::{
        HelloMessage,
        Message,
        WelcomeMessage,
    },
};

static INIT: Once = Once::new();

pub fn setup_test_environment() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing_core::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    });
}

/// Receives the next WAMP message on the router side of a direct stream.
pub async fn receive_message(stream: &mut DirectMessageStream) -> Message {
    loop {
        match stream.next().await {
            Some(Ok(StreamMessage::Message(message))) => return message,
            Some(Ok(StreamMessage::Ping(_))) => continue,
            Some(Err(err)) => panic!("router-side stream failed: {err}"),
            None => panic!("router-side stream ended"),
        }
    }
}

/// Sends a WAMP message from the router side of a direct stream.
pub async fn send_message(stream: &mut DirectMessageStream, message: Message) {
    stream
        .send(StreamMessage::Message(message))
        .await
        .unwrap();
}

/// Accepts the peer's HELLO and welcomes the session with the given session ID.
pub async fn accept_session(stream: &mut DirectMessageStream, session_id: u64) -> HelloMessage {
    let hello = match receive_message(stream).await {
        Message::Hello(hello) => hello,
        message => panic!("expected HELLO, got {}", message.message_name()),
    };
    send_message(
        stream,
        Message::Welcome(WelcomeMessage {
            session: Id::try_from(session_id).unwrap(),
            details: Dictionary::default(),
        }),
    )
    .await;
    hello
}
