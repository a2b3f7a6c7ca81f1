pub mod auth_method;
pub mod authenticator;
pub mod ticket;
pub mod wamp_cra;

pub use auth_method::AuthMethod;
pub use authenticator::{
    ClientAuthenticator,
    embed_auth_into_hello_message,
};
pub use ticket::TicketAuthenticator;
pub use wamp_cra::WampCraAuthenticator;
