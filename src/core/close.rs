use crate::core::uri::Uri;

/// The reason a WAMP session is being closed, carried in a GOODBYE message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// An ordinary, locally-initiated close.
    #[default]
    Normal,
    /// The closing side is shutting down entirely.
    SystemShutdown,
    /// The session was terminated by the other side.
    Killed,
    /// The session idled past its allowed lifetime.
    TimedOut,
    /// Acknowledgement of the other side's GOODBYE.
    GoodbyeAndOut,
}

impl CloseReason {
    fn uri_component(&self) -> &str {
        match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
            Self::GoodbyeAndOut => "goodbye_and_out",
        }
    }

    /// URI for the close reason.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.close.{}", self.uri_component()))
    }
}
