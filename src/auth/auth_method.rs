use std::{
    fmt::Display,
    str::FromStr,
};

use battler_wamp_values::{
    Value,
    WampDeserialize,
    WampDeserializeError,
    WampSerialize,
    WampSerializeError,
};
use serde_string_enum::{
    DeserializeStringEnum,
    SerializeStringEnum,
};

/// Authentication methods.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, SerializeStringEnum, DeserializeStringEnum,
)]
pub enum AuthMethod {
    /// Ticket-based authentication.
    ///
    /// The client answers the challenge with a static ticket (a shared secret or a token issued
    /// out of band), transmitted in plain text over the underlying transport.
    #[default]
    Ticket,
    /// WAMP Challenge-Response Authentication.
    ///
    /// The client proves possession of a shared secret by signing the router's challenge with
    /// HMAC-SHA256. The secret itself is never transmitted.
    WampCra,
}

impl TryFrom<&str> for AuthMethod {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ticket" => Ok(Self::Ticket),
            "wampcra" => Ok(Self::WampCra),
            _ => Err(Self::Error::msg(format!("invalid auth method: {value}"))),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl From<AuthMethod> for &'static str {
    fn from(value: AuthMethod) -> Self {
        match value {
            AuthMethod::Ticket => "ticket",
            AuthMethod::WampCra => "wampcra",
        }
    }
}

impl From<AuthMethod> for String {
    fn from(value: AuthMethod) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Into::<&'static str>::into(*self))
    }
}

impl WampSerialize for AuthMethod {
    fn wamp_serialize(self) -> Result<Value, WampSerializeError> {
        Ok(Value::String(self.into()))
    }
}

impl WampDeserialize for AuthMethod {
    fn wamp_deserialize(value: Value) -> Result<Self, WampDeserializeError> {
        value
            .string()
            .ok_or_else(|| WampDeserializeError::new("auth method must be a string"))?
            .try_into()
            .map_err(|err: anyhow::Error| WampDeserializeError::new(err.to_string()))
    }
}
