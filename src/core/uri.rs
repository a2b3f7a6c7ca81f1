use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// Error for an invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI")]
pub struct InvalidUri;

static STRICT_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]+)$").unwrap());

/// A uniform resource identifier, which WAMP messaging uses to name realms, topics, procedures,
/// and error reasons.
///
/// Validated against the strict URI grammar: lowercase alphanumeric components joined by dots,
/// with no empty component.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping validation.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    fn parse(value: String) -> Result<Self, InvalidUri> {
        if !STRICT_URI.is_match(&value) {
            return Err(InvalidUri);
        }
        Ok(Self(value))
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value.to_owned())
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Uri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

#[cfg(test)]
mod uri_test {
    use crate::core::uri::Uri;

    #[test]
    fn validates_strict_uris() {
        assert_matches::assert_matches!(Uri::try_from("com"), Ok(_));
        assert_matches::assert_matches!(Uri::try_from("com.example.topic"), Ok(_));
        assert_matches::assert_matches!(Uri::try_from("com.1"), Ok(_));
        assert_matches::assert_matches!(Uri::try_from("wamp.error.not_found"), Ok(_));
        assert_matches::assert_matches!(Uri::try_from("com.example.TOPIC"), Err(_));
        assert_matches::assert_matches!(Uri::try_from("com example"), Err(_));
        assert_matches::assert_matches!(Uri::try_from("com..example"), Err(_));
        assert_matches::assert_matches!(Uri::try_from("."), Err(_));
        assert_matches::assert_matches!(Uri::try_from(".com.example.topic1"), Err(_));
        assert_matches::assert_matches!(Uri::try_from("com.example#"), Err(_));
        assert_matches::assert_matches!(Uri::try_from(""), Err(_));
    }

    #[test]
    fn fails_deserialization_invalid_uri() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com.example.TOPIC""#), Err(err) => {
            assert!(err.to_string().contains("expected a URI"));
        });
    }

    #[test]
    fn deserializes_valid_uri() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com.example.topic""#), Ok(uri) => {
            assert_eq!(uri.as_ref(), "com.example.topic");
        });
    }
}
