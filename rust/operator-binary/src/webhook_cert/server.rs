use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use stackable_operator::time::Duration;
use tracing::{debug, info};

use super::{
    crypto::{self, CertChainChecker, CertExpiryChecker, CertKeyPair, ServerCertGenerator, ServerCertRequest},
    storage::{self, ServerCertStorage},
};
use crate::{
    error::{ClassifyError, FailureKind},
    utils::error_full_message,
};

/// The serving certificate is reissued once its CA is this close to expiring.
pub const CA_EXPIRY_WINDOW: Duration = Duration::from_days_unchecked(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to check ca cert expiry"))]
    CheckCaExpiry { source: crypto::Error },

    #[snafu(display("failed to generate server cert"))]
    GenerateServerCert { source: crypto::Error },

    #[snafu(display("failed to store server cert"))]
    StoreServerCert { source: storage::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::CheckCaExpiry { .. } => FailureKind::Fatal,
            Error::GenerateServerCert { source } => source.failure_kind(),
            Error::StoreServerCert { source } => source.failure_kind(),
        }
    }
}

/// Keeps the webhook server's certificate in the operator's cert directory signed by the current CA.
pub struct ServerCertProvider<S> {
    pub storage: S,
    pub generator: Arc<dyn ServerCertGenerator>,
    /// Applied to the CA, see [`CA_EXPIRY_WINDOW`].
    pub ca_expiry_checker: Arc<dyn CertExpiryChecker>,
    /// Applied to the stored serving certificate itself.
    pub expiry_checker: Arc<dyn CertExpiryChecker>,
    pub chain_checker: Arc<dyn CertChainChecker>,
}

impl<S: ServerCertStorage> ServerCertProvider<S> {
    /// Reuses the stored pair while it chains to `request.ca` and neither it nor the CA is about to expire.
    ///
    /// The chain check is what reissues the pair after the CA was rotated, the new CA passes its own expiry check.
    pub async fn provide_cert(&self, request: &ServerCertRequest<'_>) -> Result<CertKeyPair> {
        match self.storage.load().await {
            Ok(existing) => {
                if !self
                    .ca_expiry_checker
                    .check_expiry(&request.ca.cert_pem)
                    .context(CheckCaExpirySnafu)?
                {
                    info!("Reissuing server certificate, because its CA is about to expire");
                } else if let Some(reason) = self.stale_reason(&existing, request) {
                    info!(%reason, "Reissuing server certificate");
                } else {
                    debug!("Reusing stored server certificate");
                    return Ok(existing);
                }
            }
            Err(err) => {
                info!(
                    error = %error_full_message(&err),
                    "Issuing server certificate, because no usable one is stored"
                );
            }
        }

        let issued = self
            .generator
            .generate_server_cert(request)
            .context(GenerateServerCertSnafu)?;
        self.storage
            .save(&issued)
            .await
            .context(StoreServerCertSnafu)?;
        Ok(issued)
    }

    /// Problems with the stored certificate are not errors, they just mean it is replaced.
    fn stale_reason(&self, existing: &CertKeyPair, request: &ServerCertRequest<'_>) -> Option<String> {
        match self
            .chain_checker
            .check_chain(&existing.cert_pem, &request.ca.cert_pem)
        {
            Ok(true) => {}
            Ok(false) => return Some("it was not signed by the current CA".to_string()),
            Err(err) => return Some(error_full_message(&err)),
        }
        match self.expiry_checker.check_expiry(&existing.cert_pem) {
            Ok(true) => None,
            Ok(false) => Some("it is about to expire".to_string()),
            Err(err) => Some(error_full_message(&err)),
        }
    }
}
