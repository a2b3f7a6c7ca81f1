use anyhow::Result;
use async_trait::async_trait;
use battler_wamp_values::{
    Value,
    WampSerialize,
};

use crate::{
    auth::auth_method::AuthMethod,
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
        HelloMessage,
    },
};

/// Module for handling client-side authentication for WAMP sessions.
///
/// A session holds an ordered list of authenticators. The HELLO message advertises the methods of
/// every authenticator in the list; when the router issues a CHALLENGE, the first authenticator
/// whose method matches computes the response.
#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Authentication method.
    fn auth_method(&self) -> AuthMethod;

    /// The identity to authenticate as, advertised in the HELLO message.
    fn auth_id(&self) -> &str;

    /// Answers the router's authentication challenge.
    async fn handle_challenge(&self, challenge: &ChallengeMessage) -> Result<AuthenticateMessage>;
}

/// Embeds the authentication information of an ordered list of authenticators into a HELLO
/// message.
///
/// All supported methods are advertised together. WAMP carries a single `authid` per HELLO, so
/// the first authenticator's identity wins.
pub fn embed_auth_into_hello_message(
    authenticators: &[Box<dyn ClientAuthenticator>],
    message: &mut HelloMessage,
) -> Result<()> {
    if authenticators.is_empty() {
        return Ok(());
    }
    let methods = authenticators
        .iter()
        .map(|authenticator| authenticator.auth_method().wamp_serialize())
        .collect::<Result<Vec<_>, _>>()?;
    message
        .details
        .insert("authmethods".to_owned(), Value::List(methods));
    message.details.insert(
        "authid".to_owned(),
        Value::String(authenticators[0].auth_id().to_owned()),
    );
    Ok(())
}
