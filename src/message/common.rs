use anyhow::Error;
use battler_wamp_values::{
    Dictionary,
    Value,
};

use crate::{
    core::{
        close::CloseReason,
        error::uri_for_error,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

/// Constructs an ABORT message communicating the given error, for tearing down a session.
pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))]),
        reason: uri_for_error(error),
        ..Default::default()
    })
}

/// Constructs a GOODBYE message with the given close reason.
pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

/// Constructs the GOODBYE message that acknowledges the other side's GOODBYE.
pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// Constructs the ERROR message answering the given request message with the given error.
pub fn error_for_request(message: &Message, error: &Error) -> Message {
    Message::Error(ErrorMessage {
        request_type: message.tag(),
        request: message.request_id().unwrap_or_default(),
        details: Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))]),
        error: uri_for_error(error),
        ..Default::default()
    })
}
