//! Security-token lifecycle: credentials, token values and the
//! single-flight [`TokenStore`].

pub mod credential;
pub mod store;
pub mod token;

pub use credential::{AuthKind, Credential, CredentialSource};
pub use store::{TokenIssuer, TokenStore};
pub use token::{SecurityToken, TokenKey};
