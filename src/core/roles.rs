use std::fmt::Display;

use battler_wamp_values::{
    Dictionary,
    Value,
    WampDictionary,
    WampSerialize,
    WampSerializeError,
};

use crate::core::hash::HashSet;

/// A role a peer can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl TryFrom<&str> for PeerRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err(Self::Error::msg(format!("invalid peer role: {value}"))),
        }
    }
}

impl From<PeerRole> for &'static str {
    fn from(value: PeerRole) -> Self {
        match value {
            PeerRole::Caller => "caller",
            PeerRole::Callee => "callee",
            PeerRole::Publisher => "publisher",
            PeerRole::Subscriber => "subscriber",
        }
    }
}

impl Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Into::<&'static str>::into(*self))
    }
}

/// Advanced pub/sub features implemented by a peer, announced to the router.
#[derive(Debug, Default, Clone, WampDictionary)]
pub struct PubSubFeatures {}

/// Advanced RPC features implemented by a peer, announced to the router.
#[derive(Debug, Default, Clone, WampDictionary)]
pub struct RpcFeatures {
    /// A caller may actively cancel a procedure call.
    pub call_canceling: bool,
    /// A caller may attach a timeout to a procedure call.
    pub call_timeout: bool,
}

/// The set of roles a peer implements, with per-role feature announcements.
///
/// Serializes into the `roles` dictionary of a HELLO message.
#[derive(Debug, Clone)]
pub struct PeerRoles {
    roles: HashSet<PeerRole>,
    pub_sub_features: PubSubFeatures,
    rpc_features: RpcFeatures,
}

impl PeerRoles {
    /// Creates a new set of peer roles.
    pub fn new<I>(roles: I, pub_sub_features: PubSubFeatures, rpc_features: RpcFeatures) -> Self
    where
        I: IntoIterator<Item = PeerRole>,
    {
        Self {
            roles: HashSet::from_iter(roles),
            pub_sub_features,
            rpc_features,
        }
    }
}

impl WampSerialize for PeerRoles {
    fn wamp_serialize(self) -> Result<Value, WampSerializeError> {
        let mut roles = Dictionary::default();
        for role in self.roles {
            let features = match role {
                PeerRole::Caller | PeerRole::Callee => self.rpc_features.clone().wamp_serialize(),
                PeerRole::Publisher | PeerRole::Subscriber => {
                    self.pub_sub_features.clone().wamp_serialize()
                }
            }?;
            roles.insert(
                role.to_string(),
                Value::Dictionary(Dictionary::from_iter([("features".to_owned(), features)])),
            );
        }
        Ok(Value::Dictionary(roles))
    }
}
