/// How the router should treat a canceled procedure call, carried in the `mode` option of a
/// CANCEL message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallCancelMode {
    /// The router answers the caller with an ERROR right away; the callee is not interrupted.
    #[default]
    Skip,
    /// The callee is interrupted, and the caller waits for the callee's acknowledgement in the
    /// form of an ERROR or RESULT.
    Kill,
    /// The callee is interrupted, and the caller is answered with an ERROR right away.
    KillNoWait,
}

impl TryFrom<&str> for CallCancelMode {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "skip" => Ok(Self::Skip),
            "kill" => Ok(Self::Kill),
            "killnowait" => Ok(Self::KillNoWait),
            _ => Err(Self::Error::msg(format!(
                "invalid call cancel mode: {value}"
            ))),
        }
    }
}

impl From<CallCancelMode> for &'static str {
    fn from(value: CallCancelMode) -> Self {
        match value {
            CallCancelMode::Skip => "skip",
            CallCancelMode::Kill => "kill",
            CallCancelMode::KillNoWait => "killnowait",
        }
    }
}

impl From<CallCancelMode> for String {
    fn from(value: CallCancelMode) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}
