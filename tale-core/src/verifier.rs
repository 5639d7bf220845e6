use crate::{Result, UserId};
use async_trait::async_trait;

/// Injected bearer-token verification.
///
/// `Ok(Some(user))` is a verified identity and `Ok(None)` means anonymous
/// access is acceptable. On `Err(AuthInvalid)` the gateway closes with a
/// policy code.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: Option<&str>) -> Result<Option<UserId>>;
}

/// Verifier for deployments without an identity provider: every connection is
/// anonymous and any presented token is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnonymous;

#[async_trait]
impl TokenVerifier for AllowAnonymous {
    async fn verify(&self, _token: Option<&str>) -> Result<Option<UserId>> {
        Ok(None)
    }
}
