// Copyright 2026 O7 Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! IAM persistence layer.
//!
//! `IamObjectStore` maps entity operations onto keyed JSON records in the
//! object layer under the fixed path schema, and owns the coarse
//! reader/writer lock that serializes multi-step mutations against
//! concurrent full loads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use o7_core::{ObjectStore, StoreError, StoreEvent};

use crate::error::IamError;
use crate::models::{Credentials, GroupInfo, IamFormat, MappedPolicy, UserIdentity, UserType};
use crate::paths;
use crate::policy::Policy;

/// Options accepted by save operations.
///
/// `ttl` is honored by backends with native expiry; the object backend
/// ignores it and relies on the load-time expiration sweep instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Record time-to-live in seconds.
    pub ttl: Option<i64>,
}

impl SaveOptions {
    pub fn with_ttl(ttl: i64) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Persistence interface of the IAM subsystem.
///
/// `lock`/`rlock` expose the store-scoped coarse lock: every mutation in
/// the orchestrator holds the write guard for its full
/// load-validate-write sequence, the full loader holds the read guard.
#[async_trait]
pub trait IamStorage: Send + Sync {
    /// Acquires the coarse store lock for writing.
    async fn lock(&self) -> OwnedRwLockWriteGuard<()>;

    /// Acquires the coarse store lock for reading.
    async fn rlock(&self) -> OwnedRwLockReadGuard<()>;

    /// Idempotent upgrade of the durable layout to the current format.
    /// The format marker is written last.
    async fn migrate_backend_format(&self) -> Result<(), IamError>;

    /// Loads one policy document into `docs`. `NoSuchPolicy` when absent.
    async fn load_policy_doc(
        &self,
        name: &str,
        docs: &mut HashMap<String, Policy>,
    ) -> Result<(), IamError>;

    /// Loads all policy documents into `docs`.
    async fn load_policy_docs(&self, docs: &mut HashMap<String, Policy>) -> Result<(), IamError>;

    /// Reads one user's credentials. `NoSuchUser` when absent.
    async fn get_user_credentials(
        &self,
        user: &str,
        user_type: UserType,
    ) -> Result<Credentials, IamError>;

    /// Loads one user into `users`. `NoSuchUser` when absent.
    async fn load_user(
        &self,
        user: &str,
        user_type: UserType,
        users: &mut HashMap<String, Credentials>,
    ) -> Result<(), IamError>;

    /// Loads every user of the given kind into `users`.
    async fn load_users(
        &self,
        user_type: UserType,
        users: &mut HashMap<String, Credentials>,
    ) -> Result<(), IamError>;

    /// Reads one group record. `NoSuchGroup` when absent.
    async fn get_group_info(&self, group: &str) -> Result<GroupInfo, IamError>;

    /// Loads every group into `groups`.
    async fn load_groups(&self, groups: &mut HashMap<String, GroupInfo>) -> Result<(), IamError>;

    /// Reads one mapping record. `NoSuchPolicy` when absent.
    async fn get_mapped_policy(
        &self,
        name: &str,
        user_type: UserType,
        is_group: bool,
    ) -> Result<MappedPolicy, IamError>;

    /// Loads every mapping of the given kind into `mappings`.
    async fn load_mapped_policies(
        &self,
        user_type: UserType,
        is_group: bool,
        mappings: &mut HashMap<String, MappedPolicy>,
    ) -> Result<(), IamError>;

    async fn save_policy_doc(&self, name: &str, policy: &Policy) -> Result<(), IamError>;

    async fn save_user_identity(
        &self,
        name: &str,
        user_type: UserType,
        identity: &UserIdentity,
        opts: SaveOptions,
    ) -> Result<(), IamError>;

    async fn save_group_info(&self, group: &str, gi: &GroupInfo) -> Result<(), IamError>;

    async fn save_mapped_policy(
        &self,
        name: &str,
        user_type: UserType,
        is_group: bool,
        mapping: &MappedPolicy,
        opts: SaveOptions,
    ) -> Result<(), IamError>;

    /// Deletes return the matching `NoSuch*` error when the record is
    /// already absent; callers treat that as success.
    async fn delete_policy_doc(&self, name: &str) -> Result<(), IamError>;

    async fn delete_user_identity(&self, name: &str, user_type: UserType)
        -> Result<(), IamError>;

    async fn delete_group_info(&self, group: &str) -> Result<(), IamError>;

    async fn delete_mapped_policy(
        &self,
        name: &str,
        user_type: UserType,
        is_group: bool,
    ) -> Result<(), IamError>;

    /// Subscribes to durable-state change events for the watcher.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// `IamStorage` over the object layer.
pub struct IamObjectStore {
    objects: Arc<dyn ObjectStore>,
    store_lock: Arc<RwLock<()>>,
}

impl IamObjectStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            objects,
            store_lock: Arc::new(RwLock::new(())),
        })
    }

    async fn save_iam_config<T: Serialize + Sync>(
        &self,
        item: &T,
        path: &str,
    ) -> Result<(), IamError> {
        let data = serde_json::to_vec(item)?;
        self.objects.put_object(path, &data).await?;
        Ok(())
    }

    async fn load_iam_config<T: DeserializeOwned>(&self, path: &str) -> Result<T, IamError> {
        let data = self.objects.get_object(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn delete_iam_config(&self, path: &str) -> Result<(), IamError> {
        self.objects.delete_object(path).await?;
        Ok(())
    }

    /// Lists the distinct child names directly under `prefix`.
    ///
    /// Record keys look like `<prefix><name>/<file>` (directory layout)
    /// or `<prefix><name>.json` (policy db layout).
    async fn list_names(&self, prefix: &str) -> Result<Vec<String>, IamError> {
        let keys = match self.objects.list_objects(prefix).await {
            Ok(keys) => keys,
            // A missing container means nothing was ever stored.
            Err(StoreError::ContainerNotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(prefix))
            .map(|rest| match rest.split_once('/') {
                Some((name, _)) => name.to_string(),
                None => rest.trim_end_matches(".json").to_string(),
            })
            .collect();
        names.dedup();
        Ok(names)
    }
}

fn mapped_not_found(err: IamError, not_found: IamError) -> IamError {
    match err {
        IamError::Store(StoreError::NotFound { .. }) => not_found,
        other => other,
    }
}

#[async_trait]
impl IamStorage for IamObjectStore {
    async fn lock(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.store_lock).write_owned().await
    }

    async fn rlock(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.store_lock).read_owned().await
    }

    async fn migrate_backend_format(&self) -> Result<(), IamError> {
        let path = paths::format_path();
        match self.objects.get_object(&path).await {
            Ok(data) => {
                let format: IamFormat = serde_json::from_slice(&data)
                    .map_err(|_| IamError::MaliciousData { path: path.clone() })?;
                debug!(version = format.version, "IAM format marker present");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) | Err(StoreError::ContainerNotFound) => {
                // Fresh deployment; nothing older than version 1 to
                // migrate. The marker is the last write of the upgrade.
                self.save_iam_config(&IamFormat::current(), &path).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_policy_doc(
        &self,
        name: &str,
        docs: &mut HashMap<String, Policy>,
    ) -> Result<(), IamError> {
        let policy: Policy = self
            .load_iam_config(&paths::policy_doc_path(name))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchPolicy))?;
        docs.insert(name.to_string(), policy);
        Ok(())
    }

    async fn load_policy_docs(&self, docs: &mut HashMap<String, Policy>) -> Result<(), IamError> {
        for name in self.list_names(paths::POLICIES_PREFIX).await? {
            match self.load_policy_doc(&name, docs).await {
                Ok(()) | Err(IamError::NoSuchPolicy) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn get_user_credentials(
        &self,
        user: &str,
        user_type: UserType,
    ) -> Result<Credentials, IamError> {
        let identity: UserIdentity = self
            .load_iam_config(&paths::user_identity_path(user, user_type))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchUser))?;
        let mut cred = identity.credentials;
        // The directory a record lives in is authoritative for its kind.
        cred.kind = user_type;
        if cred.access_key.is_empty() {
            cred.access_key = user.to_string();
        }
        Ok(cred)
    }

    async fn load_user(
        &self,
        user: &str,
        user_type: UserType,
        users: &mut HashMap<String, Credentials>,
    ) -> Result<(), IamError> {
        let cred = self.get_user_credentials(user, user_type).await?;
        users.insert(cred.access_key.clone(), cred);
        Ok(())
    }

    async fn load_users(
        &self,
        user_type: UserType,
        users: &mut HashMap<String, Credentials>,
    ) -> Result<(), IamError> {
        let prefix = match user_type {
            UserType::Regular => paths::USERS_PREFIX,
            UserType::Sts => paths::STS_PREFIX,
            UserType::ServiceAccount => paths::SERVICE_ACCOUNTS_PREFIX,
        };
        for name in self.list_names(prefix).await? {
            match self.load_user(&name, user_type, users).await {
                // Deleted behind the listing; skip.
                Ok(()) | Err(IamError::NoSuchUser) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn get_group_info(&self, group: &str) -> Result<GroupInfo, IamError> {
        self.load_iam_config(&paths::group_info_path(group))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchGroup))
    }

    async fn load_groups(&self, groups: &mut HashMap<String, GroupInfo>) -> Result<(), IamError> {
        for name in self.list_names(paths::GROUPS_PREFIX).await? {
            match self.get_group_info(&name).await {
                Ok(gi) => {
                    groups.insert(name, gi);
                }
                Err(IamError::NoSuchGroup) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn get_mapped_policy(
        &self,
        name: &str,
        user_type: UserType,
        is_group: bool,
    ) -> Result<MappedPolicy, IamError> {
        self.load_iam_config(&paths::mapped_policy_path(name, user_type, is_group))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchPolicy))
    }

    async fn load_mapped_policies(
        &self,
        user_type: UserType,
        is_group: bool,
        mappings: &mut HashMap<String, MappedPolicy>,
    ) -> Result<(), IamError> {
        let prefix = if is_group {
            paths::POLICY_DB_GROUPS_PREFIX
        } else {
            match user_type {
                UserType::Regular => paths::POLICY_DB_USERS_PREFIX,
                UserType::Sts => paths::POLICY_DB_STS_USERS_PREFIX,
                UserType::ServiceAccount => paths::POLICY_DB_SERVICE_ACCOUNTS_PREFIX,
            }
        };
        for name in self.list_names(prefix).await? {
            match self.get_mapped_policy(&name, user_type, is_group).await {
                Ok(mapping) => {
                    mappings.insert(name, mapping);
                }
                Err(IamError::NoSuchPolicy) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn save_policy_doc(&self, name: &str, policy: &Policy) -> Result<(), IamError> {
        self.save_iam_config(policy, &paths::policy_doc_path(name)).await
    }

    async fn save_user_identity(
        &self,
        name: &str,
        user_type: UserType,
        identity: &UserIdentity,
        _opts: SaveOptions,
    ) -> Result<(), IamError> {
        self.save_iam_config(identity, &paths::user_identity_path(name, user_type)).await
    }

    async fn save_group_info(&self, group: &str, gi: &GroupInfo) -> Result<(), IamError> {
        self.save_iam_config(gi, &paths::group_info_path(group)).await
    }

    async fn save_mapped_policy(
        &self,
        name: &str,
        user_type: UserType,
        is_group: bool,
        mapping: &MappedPolicy,
        _opts: SaveOptions,
    ) -> Result<(), IamError> {
        self.save_iam_config(mapping, &paths::mapped_policy_path(name, user_type, is_group))
            .await
    }

    async fn delete_policy_doc(&self, name: &str) -> Result<(), IamError> {
        self.delete_iam_config(&paths::policy_doc_path(name))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchPolicy))
    }

    async fn delete_user_identity(
        &self,
        name: &str,
        user_type: UserType,
    ) -> Result<(), IamError> {
        self.delete_iam_config(&paths::user_identity_path(name, user_type))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchUser))
    }

    async fn delete_group_info(&self, group: &str) -> Result<(), IamError> {
        self.delete_iam_config(&paths::group_info_path(group))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchGroup))
    }

    async fn delete_mapped_policy(
        &self,
        name: &str,
        user_type: UserType,
        is_group: bool,
    ) -> Result<(), IamError> {
        self.delete_iam_config(&paths::mapped_policy_path(name, user_type, is_group))
            .await
            .map_err(|err| mapped_not_found(err, IamError::NoSuchPolicy))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.objects.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountStatus;
    use crate::policy::Statement;
    use o7_core::MemObjectStore;

    fn new_store() -> Arc<IamObjectStore> {
        IamObjectStore::new(MemObjectStore::new())
    }

    #[tokio::test]
    async fn test_policy_doc_round_trip() {
        let store = new_store();
        let policy = Policy::new(vec![Statement::allow(&["s3:GetObject"], &["*"])]);
        store.save_policy_doc("readonly", &policy).await.unwrap();

        let mut docs = HashMap::new();
        store.load_policy_doc("readonly", &mut docs).await.unwrap();
        assert!(docs.contains_key("readonly"));

        assert!(matches!(
            store.load_policy_doc("missing", &mut docs).await,
            Err(IamError::NoSuchPolicy)
        ));
    }

    #[tokio::test]
    async fn test_user_identity_kind_is_stamped_from_path() {
        let store = new_store();
        let cred = Credentials::new("TMPKEY", "secret123", AccountStatus::Enabled);
        store
            .save_user_identity("TMPKEY", UserType::Sts, &UserIdentity::new(cred), SaveOptions::default())
            .await
            .unwrap();

        let loaded = store.get_user_credentials("TMPKEY", UserType::Sts).await.unwrap();
        assert_eq!(loaded.kind, UserType::Sts);
        assert!(loaded.is_temp());

        assert!(matches!(
            store.get_user_credentials("TMPKEY", UserType::Regular).await,
            Err(IamError::NoSuchUser)
        ));
    }

    #[tokio::test]
    async fn test_bulk_load_users() {
        let store = new_store();
        for name in ["alice", "bob"] {
            let cred = Credentials::new(name, "secret123", AccountStatus::Enabled);
            store
                .save_user_identity(name, UserType::Regular, &UserIdentity::new(cred), SaveOptions::default())
                .await
                .unwrap();
        }

        let mut users = HashMap::new();
        store.load_users(UserType::Regular, &mut users).await.unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.contains_key("alice") && users.contains_key("bob"));

        // Empty collections load as empty, not as errors.
        let mut sts = HashMap::new();
        store.load_users(UserType::Sts, &mut sts).await.unwrap();
        assert!(sts.is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_reports_no_such() {
        let store = new_store();
        assert!(matches!(
            store.delete_policy_doc("nope").await,
            Err(IamError::NoSuchPolicy)
        ));
        assert!(matches!(
            store.delete_user_identity("nope", UserType::Regular).await,
            Err(IamError::NoSuchUser)
        ));
        assert!(matches!(
            store.delete_group_info("nope").await,
            Err(IamError::NoSuchGroup)
        ));
        assert!(matches!(
            store.delete_mapped_policy("nope", UserType::Regular, false).await,
            Err(IamError::NoSuchPolicy)
        ));
    }

    #[tokio::test]
    async fn test_migrate_writes_marker_once() {
        let store = new_store();
        store.migrate_backend_format().await.unwrap();
        store.migrate_backend_format().await.unwrap();

        let format: IamFormat = store.load_iam_config(&paths::format_path()).await.unwrap();
        assert_eq!(format.version, 1);
    }

    #[tokio::test]
    async fn test_migrate_rejects_garbage_marker() {
        let objects = MemObjectStore::new();
        objects.put_object(&paths::format_path(), b"not-json").await.unwrap();
        let store = IamObjectStore::new(objects);
        assert!(matches!(
            store.migrate_backend_format().await,
            Err(IamError::MaliciousData { .. })
        ));
    }

    #[tokio::test]
    async fn test_mapped_policy_round_trip() {
        let store = new_store();
        let mapping = MappedPolicy::new("readonly,readwrite");
        store
            .save_mapped_policy("alice", UserType::Regular, false, &mapping, SaveOptions::default())
            .await
            .unwrap();

        let loaded = store.get_mapped_policy("alice", UserType::Regular, false).await.unwrap();
        assert_eq!(loaded.policy_set(), mapping.policy_set());

        let mut mappings = HashMap::new();
        store
            .load_mapped_policies(UserType::Regular, false, &mut mappings)
            .await
            .unwrap();
        assert!(mappings.contains_key("alice"));
    }
}
