use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{
        self,
        api::{ObjectMeta, PostParams},
        runtime::reflector::ObjectRef,
        Api,
    },
    time::Duration,
};
use telemetry_operator_utils::reference::NamespacedName;
use tracing::info;

use super::crypto::{self, CaCertGenerator, CertExpiryChecker, CertKeyPair};
use crate::error::{ClassifyError, FailureKind};

pub const SECRET_KEY_CERT: &str = "ca.crt";
pub const SECRET_KEY_KEY: &str = "ca.key";

/// CAs are replaced once they are this close to expiring.
pub const CA_ROTATION_WINDOW: Duration = Duration::from_days_unchecked(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get ca cert secret {secret}"))]
    ReadCaSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to generate ca cert"))]
    GenerateCa { source: crypto::Error },

    #[snafu(display("failed to create ca cert secret {secret}"))]
    CreateCaSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to update ca cert secret {secret}"))]
    UpdateCaSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::ReadCaSecret { source, .. } => source.failure_kind(),
            Error::GenerateCa { source } => source.failure_kind(),
            Error::CreateCaSecret { source, .. } => source.failure_kind(),
            Error::UpdateCaSecret { source, .. } => source.failure_kind(),
        }
    }
}

/// Why an existing CA secret can't be reused.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum InvalidCa {
    #[snafu(display("secret has no {key:?} entry"))]
    MissingEntry { key: &'static str },

    #[snafu(display("certificate will expire within {window}"))]
    AboutToExpire { window: Duration },

    #[snafu(display("failed to check certificate expiry"))]
    CheckExpiry { source: crypto::Error },

    #[snafu(display("private key is unusable"))]
    CheckKey { source: crypto::Error },

    #[snafu(display("private key is not {key_size} bits long"))]
    WrongKeyLength { key_size: u32 },
}

/// Where the CA lives between operator restarts.
///
/// Writes are conditional: `existing` is the object last returned by [`CaSecretStore::read`], so a concurrent
/// writer makes the write fail with a conflict instead of being silently overwritten.
#[async_trait]
pub trait CaSecretStore: Send + Sync {
    fn secret_ref(&self) -> ObjectRef<Secret>;
    async fn read(&self) -> Result<Option<Secret>, kube::Error>;
    async fn create(&self, data: BTreeMap<String, ByteString>) -> Result<(), kube::Error>;
    async fn replace(
        &self,
        existing: Secret,
        data: BTreeMap<String, ByteString>,
    ) -> Result<(), kube::Error>;
}

pub struct KubeCaSecretStore {
    api: Api<Secret>,
    secret: NamespacedName,
}

impl KubeCaSecretStore {
    pub fn new(client: &stackable_operator::client::Client, secret: NamespacedName) -> Self {
        Self {
            api: client.get_api::<Secret>(&secret.namespace),
            secret,
        }
    }
}

#[async_trait]
impl CaSecretStore for KubeCaSecretStore {
    fn secret_ref(&self) -> ObjectRef<Secret> {
        (&self.secret).into()
    }

    async fn read(&self) -> Result<Option<Secret>, kube::Error> {
        self.api.get_opt(&self.secret.name).await
    }

    async fn create(&self, data: BTreeMap<String, ByteString>) -> Result<(), kube::Error> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.secret.name.clone()),
                namespace: Some(self.secret.namespace.clone()),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Secret::default()
        };
        self.api.create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn replace(
        &self,
        mut existing: Secret,
        data: BTreeMap<String, ByteString>,
    ) -> Result<(), kube::Error> {
        // metadata.resourceVersion is kept from the read, which makes the replace conditional
        existing.data = Some(data);
        existing.string_data = None;
        self.api
            .replace(&self.secret.name, &PostParams::default(), &existing)
            .await?;
        Ok(())
    }
}

/// Loads the webhook CA from its secret, (re)generating it when it is missing or unusable.
pub struct CaCertProvider<S> {
    pub store: S,
    pub generator: Arc<dyn CaCertGenerator>,
    pub expiry_checker: Arc<dyn CertExpiryChecker>,
    pub key_size: u32,
}

impl<S: CaSecretStore> CaCertProvider<S> {
    pub async fn provide_cert(&self) -> Result<CertKeyPair> {
        let secret_ref = || self.store.secret_ref();
        let existing = self
            .store
            .read()
            .await
            .with_context(|_| ReadCaSecretSnafu {
                secret: secret_ref(),
            })?;
        let Some(existing) = existing else {
            info!(
                secret = %secret_ref(),
                "Provisioning a new CA certificate, because it could not be found"
            );
            let ca = self.generator.generate_ca().context(GenerateCaSnafu)?;
            self.store
                .create(secret_data(&ca))
                .await
                .with_context(|_| CreateCaSecretSnafu {
                    secret: secret_ref(),
                })?;
            return Ok(ca);
        };

        match self.validate(&existing) {
            Ok(ca) => {
                info!(
                    secret = %secret_ref(),
                    cutoff.duration = %CA_ROTATION_WINDOW,
                    "CA is not close to expiring, reusing it"
                );
                Ok(ca)
            }
            Err(reason) => {
                info!(
                    secret = %secret_ref(),
                    reason = %crate::utils::error_full_message(&reason),
                    "Replacing CA certificate"
                );
                let ca = self.generator.generate_ca().context(GenerateCaSnafu)?;
                self.store
                    .replace(existing, secret_data(&ca))
                    .await
                    .with_context(|_| UpdateCaSecretSnafu {
                        secret: secret_ref(),
                    })?;
                Ok(ca)
            }
        }
    }

    fn validate(&self, secret: &Secret) -> Result<CertKeyPair, InvalidCa> {
        use invalid_ca::*;
        let entry = |key: &'static str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.0.clone())
                .ok_or(InvalidCa::MissingEntry { key })
        };
        let ca = CertKeyPair {
            cert_pem: entry(SECRET_KEY_CERT)?,
            key_pem: entry(SECRET_KEY_KEY)?,
        };
        if !self
            .expiry_checker
            .check_expiry(&ca.cert_pem)
            .context(CheckExpirySnafu)?
        {
            return AboutToExpireSnafu {
                window: CA_ROTATION_WINDOW,
            }
            .fail();
        }
        if !crypto::check_key_length(&ca.key_pem, self.key_size).context(CheckKeySnafu)? {
            return WrongKeyLengthSnafu {
                key_size: self.key_size,
            }
            .fail();
        }
        Ok(ca)
    }
}

fn secret_data(ca: &CertKeyPair) -> BTreeMap<String, ByteString> {
    [
        (SECRET_KEY_CERT.to_string(), ByteString(ca.cert_pem.clone())),
        (SECRET_KEY_KEY.to_string(), ByteString(ca.key_pem.clone())),
    ]
    .into()
}
