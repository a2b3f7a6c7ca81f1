use anyhow::Result;
use async_trait::async_trait;
use battler_wamp_values::Dictionary;

use crate::{
    auth::{
        auth_method::AuthMethod,
        authenticator::ClientAuthenticator,
    },
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
    },
};

/// Client authenticator for ticket-based authentication.
///
/// The ticket is sent as the signature of the AUTHENTICATE message, so this method should only be
/// used over an encrypted transport.
pub struct TicketAuthenticator {
    id: String,
    ticket: String,
}

impl TicketAuthenticator {
    /// Creates a new ticket authenticator.
    pub fn new(id: String, ticket: String) -> Self {
        Self { id, ticket }
    }
}

#[async_trait]
impl ClientAuthenticator for TicketAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Ticket
    }

    fn auth_id(&self) -> &str {
        &self.id
    }

    async fn handle_challenge(&self, _: &ChallengeMessage) -> Result<AuthenticateMessage> {
        Ok(AuthenticateMessage {
            signature: self.ticket.clone(),
            extra: Dictionary::default(),
        })
    }
}
