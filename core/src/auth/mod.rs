pub mod session;
pub mod token;

pub use session::{AuthSession, InitSessionReply, SessionInitiator};
pub use token::{SignedPayload, Token, CLUSTER_TOKEN_ID};
