//! Authentication layer: login-state transport, cookies, claims processing,
//! provider lifecycle and the OAuth2 authenticator itself.

pub mod authenticator;
pub mod claims;
pub mod cookies;
pub mod provider;
pub mod state;

pub use authenticator::{ApiAuthOutcome, AuthError, Authenticator};
pub use claims::Details;
pub use cookies::CredentialStorage;
pub use provider::OidcProvider;
pub use state::StateCodec;
