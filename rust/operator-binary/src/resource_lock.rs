//! Bounds how many objects may concurrently own a shared resource.
//!
//! The ledger is the owner reference list of an otherwise empty [`ConfigMap`]. Every write is conditional on the
//! resourceVersion that was read, so two reconcilers racing for the last slot can't both win; the loser gets a
//! [`FailureKind::Conflict`] and is expected to requeue.

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::OwnerReference},
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef, Resource, ResourceExt},
};
use telemetry_operator_utils::reference::NamespacedName;
use tracing::{debug, info};

use crate::{
    cluster::{self, ClusterClient},
    error::{ClassifyError, FailureKind},
};

const LOCKER_SUFFIX: &str = "lock";
const SYNCER_SUFFIX: &str = "syncer";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("maximum pipeline count limit exceeded"))]
    LockInUse,

    #[snafu(display("owner {owner:?} has no name or uid"))]
    OwnerWithoutIdentity { owner: String },

    #[snafu(display("failed to get lock {lock}"))]
    GetLock {
        source: cluster::Error,
        lock: ObjectRef<ConfigMap>,
    },

    #[snafu(display("failed to create lock {lock}"))]
    CreateLock {
        source: cluster::Error,
        lock: ObjectRef<ConfigMap>,
    },

    #[snafu(display("failed to update lock {lock}"))]
    UpdateLock {
        source: cluster::Error,
        lock: ObjectRef<ConfigMap>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::LockInUse => FailureKind::LockInUse,
            Error::OwnerWithoutIdentity { .. } => FailureKind::Fatal,
            Error::GetLock { source, .. } => source.failure_kind(),
            Error::CreateLock { source, .. } => source.failure_kind(),
            Error::UpdateLock { source, .. } => source.failure_kind(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLock {
    lock: NamespacedName,
    /// `0` means unbounded.
    max_owners: usize,
}

impl ResourceLock {
    /// A lock that admits at most `max_owners` holders, stored in `<name>-lock`.
    pub fn locker(lock: NamespacedName, max_owners: usize) -> Self {
        Self::with_suffix(lock, max_owners, LOCKER_SUFFIX)
    }

    /// An unbounded lock stored in `<name>-syncer`, which only records who participates.
    pub fn syncer(lock: NamespacedName) -> Self {
        Self::with_suffix(lock, 0, SYNCER_SUFFIX)
    }

    fn with_suffix(mut lock: NamespacedName, max_owners: usize, suffix: &str) -> Self {
        if !lock.name.ends_with(&format!("-{suffix}")) {
            lock.name = format!("{}-{suffix}", lock.name);
        }
        Self { lock, max_owners }
    }

    pub fn lock_name(&self) -> &NamespacedName {
        &self.lock
    }

    fn lock_ref(&self) -> ObjectRef<ConfigMap> {
        (&self.lock).into()
    }

    async fn read(&self, cluster: &impl ClusterClient) -> Result<Option<ConfigMap>> {
        cluster::get_opt::<ConfigMap>(cluster, Some(&self.lock.namespace), &self.lock.name)
            .await
            .with_context(|_| GetLockSnafu {
                lock: self.lock_ref(),
            })
    }

    /// Registers `owner` as a holder, unless it already is one.
    ///
    /// Fails with [`Error::LockInUse`] if all slots are taken by other owners.
    pub async fn try_acquire<K>(&self, cluster: &impl ClusterClient, owner: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let owner_ref = owner_reference(owner)?;
        let Some(mut lock) = self.read(cluster).await? else {
            let lock = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.lock.name.clone()),
                    namespace: Some(self.lock.namespace.clone()),
                    owner_references: Some(vec![owner_ref]),
                    ..ObjectMeta::default()
                },
                ..ConfigMap::default()
            };
            cluster::create(cluster, &lock)
                .await
                .with_context(|_| CreateLockSnafu {
                    lock: self.lock_ref(),
                })?;
            info!(lock = %self.lock, owner = %owner.name_any(), "Created lock");
            return Ok(());
        };

        let owners = lock.owner_references();
        if owners.iter().any(|existing| is_same_owner(existing, &owner_ref)) {
            return Ok(());
        }
        if self.max_owners != 0 && owners.len() >= self.max_owners {
            info!(
                lock = %self.lock,
                owner = %owner.name_any(),
                max_owners = self.max_owners,
                "Lock is in use"
            );
            return LockInUseSnafu.fail();
        }

        lock.owner_references_mut().push(owner_ref);
        cluster::replace(cluster, &lock)
            .await
            .with_context(|_| UpdateLockSnafu {
                lock: self.lock_ref(),
            })?;
        debug!(lock = %self.lock, owner = %owner.name_any(), "Acquired lock");
        Ok(())
    }

    /// Whether `owner` is among the holders. A lock that does not exist yet has no holders.
    ///
    /// A missing lock yields `Ok(false)` rather than a not-found error, other read failures are surfaced.
    pub async fn is_holder<K>(&self, cluster: &impl ClusterClient, owner: &K) -> Result<bool>
    where
        K: Resource<DynamicType = ()>,
    {
        let owner_ref = owner_reference(owner)?;
        Ok(self.read(cluster).await?.is_some_and(|lock| {
            lock.owner_references()
                .iter()
                .any(|existing| is_same_owner(existing, &owner_ref))
        }))
    }

    pub async fn release_if_held<K>(&self, cluster: &impl ClusterClient, owner: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let owner_ref = owner_reference(owner)?;
        let Some(mut lock) = self.read(cluster).await? else {
            return Ok(());
        };
        let owners = lock.owner_references_mut();
        let held = owners.len();
        owners.retain(|existing| !is_same_owner(existing, &owner_ref));
        if owners.len() == held {
            return Ok(());
        }
        cluster::replace(cluster, &lock)
            .await
            .with_context(|_| UpdateLockSnafu {
                lock: self.lock_ref(),
            })?;
        info!(lock = %self.lock, owner = %owner.name_any(), "Released lock");
        Ok(())
    }

    /// Keeps only those `candidates` that currently hold the lock.
    pub async fn holders<K>(&self, cluster: &impl ClusterClient, candidates: Vec<K>) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = ()>,
    {
        let Some(lock) = self.read(cluster).await? else {
            return Ok(Vec::new());
        };
        let owners = lock.owner_references();
        Ok(candidates
            .into_iter()
            .filter(|candidate| {
                candidate
                    .uid()
                    .is_some_and(|uid| owners.iter().any(|owner| owner.uid == uid))
            })
            .collect())
    }
}

fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    owner.owner_ref(&()).with_context(|| OwnerWithoutIdentitySnafu {
        owner: owner.name_any(),
    })
}

fn is_same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.name == b.name && a.uid == b.uid
}
