use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use battler_wamp_values::{
    Dictionary,
    Value,
};
use hmac::{
    Hmac,
    Mac,
};
use sha2::Sha256;

use crate::{
    auth::{
        auth_method::AuthMethod,
        authenticator::ClientAuthenticator,
    },
    core::error::InteractionError,
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
    },
};

const DEFAULT_ITERATIONS: u32 = 1000;
const DEFAULT_KEY_LENGTH: usize = 32;

/// Client authenticator for WAMP Challenge-Response Authentication.
///
/// The router's challenge string is signed with HMAC-SHA256 under the shared secret. If the
/// challenge carries `salt` (with optional `iterations` and `keylen`), the signing key is first
/// derived from the secret with PBKDF2-SHA256 and base64-encoded, per the WAMP-CRA key derivation
/// scheme.
pub struct WampCraAuthenticator {
    id: String,
    secret: String,
}

impl WampCraAuthenticator {
    /// Creates a new WAMP-CRA authenticator.
    pub fn new(id: String, secret: String) -> Self {
        Self { id, secret }
    }

    fn signing_key(&self, extra: &Dictionary) -> Result<Vec<u8>> {
        let salt = match extra.get("salt") {
            Some(Value::String(salt)) => salt,
            Some(_) => return Err(Error::msg("challenge salt must be a string")),
            None => return Ok(self.secret.as_bytes().to_vec()),
        };
        let iterations = match extra.get("iterations") {
            Some(value) => value
                .integer()
                .ok_or_else(|| Error::msg("challenge iterations must be an integer"))?
                as u32,
            None => DEFAULT_ITERATIONS,
        };
        let key_length = match extra.get("keylen") {
            Some(value) => value
                .integer()
                .ok_or_else(|| Error::msg("challenge keylen must be an integer"))?
                as usize,
            None => DEFAULT_KEY_LENGTH,
        };
        let mut key = vec![0u8; key_length];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.secret.as_bytes(),
            salt.as_bytes(),
            iterations,
            &mut key,
        );
        Ok(STANDARD.encode(key).into_bytes())
    }

    fn sign(&self, key: &[u8], challenge: &str) -> Result<String> {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(key).map_err(|err| Error::msg(err.to_string()))?;
        mac.update(challenge.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ClientAuthenticator for WampCraAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::WampCra
    }

    fn auth_id(&self) -> &str {
        &self.id
    }

    async fn handle_challenge(&self, challenge: &ChallengeMessage) -> Result<AuthenticateMessage> {
        let challenge_string = match challenge.extra.get("challenge") {
            Some(Value::String(challenge)) => challenge,
            _ => {
                return Err(InteractionError::AuthenticationFailed(
                    "challenge is missing the challenge string".to_owned(),
                )
                .into());
            }
        };
        let key = self.signing_key(&challenge.extra)?;
        Ok(AuthenticateMessage {
            signature: self.sign(&key, challenge_string)?,
            extra: Dictionary::default(),
        })
    }
}
