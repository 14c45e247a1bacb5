//! Credentials and the credential-store collaborator boundary.
//!
//! Secrets arrive pre-decrypted from the external store and are never
//! persisted by this crate. The `Debug` impl of [`Credential`] redacts the
//! secret so it cannot leak through logs.

use crate::error::InsurerId;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// How the insurer's STS authenticates this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthKind {
    /// UsernameToken in the WS-Security header.
    UsernamePassword,
    /// TLS client certificate, referenced by `cert_ref`.
    Certificate,
}

/// One insurer account: who we are towards a VU.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub insurer: InsurerId,
    pub auth_kind: AuthKind,
    pub username: String,
    /// Decrypted secret (password or certificate passphrase).
    pub secret: String,
    /// Reference into the external certificate store, if `auth_kind` is
    /// [`AuthKind::Certificate`].
    pub cert_ref: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("insurer", &self.insurer)
            .field("auth_kind", &self.auth_kind)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("cert_ref", &self.cert_ref)
            .finish()
    }
}

/// External credential store. Implemented by the embedding application;
/// called once per run per insurer.
pub trait CredentialSource: Send + Sync {
    fn credential(
        &self,
        insurer: &InsurerId,
    ) -> impl Future<Output = anyhow::Result<Credential>> + Send;
}
