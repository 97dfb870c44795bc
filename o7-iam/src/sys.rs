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

//! The IAM authority.
//!
//! `IamSys` owns the in-memory projection and coordinates every mutation
//! against the durable store. The locking discipline is two-tier:
//!
//! * the store's coarse reader/writer lock serializes multi-step
//!   mutations against each other and against full loads;
//! * the cache mutex guards map integrity only, and is never held
//!   across a store call (the guard is `!Send`, so the compiler rejects
//!   futures that try).
//!
//! Every mutation follows the same sequence: check initialized, take the
//! store write lock, reload the slices needed to validate, write through
//! the store, then apply the in-memory delta under the cache mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use o7_core::{DynamicTimeout, NsLockService};

use crate::cache::IamCache;
use crate::error::IamError;
use crate::models::{
    self, AccountStatus, Credentials, GroupInfo, KeyStatus, MappedPolicy, UserIdentity, UserType,
    UsersSysType,
};
use crate::policy::{Args, Policy};
use crate::store::{IamStorage, SaveOptions};
use crate::token;
use crate::watch as iam_watch;

/// Environment variable disabling the migration election (read-only
/// metadata deployments).
pub const READ_ONLY_ENV: &str = "O7_META_READ_ONLY";

/// Named lock elected during bootstrap to pick the format migrator.
const MIGRATION_LOCK_BUCKET: &str = "meta";
const MIGRATION_LOCK_OBJECT: &str = "iam-lock";

/// Session policies embedded in claims may not exceed this size.
const MAX_SESSION_POLICY_SIZE: usize = 16 * 1024;

/// Pluggable policy engine that fully supersedes internal evaluation
/// when configured.
#[async_trait]
pub trait ExternalEvaluator: Send + Sync {
    async fn is_allowed(&self, args: &Args) -> Result<bool, IamError>;
}

/// Admin-facing description of a user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub policy_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
    pub member_of: Vec<String>,
}

/// Admin-facing description of a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupDesc {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
    pub members: Vec<String>,
    pub policy: String,
}

/// Inputs for service-account creation.
#[derive(Default)]
pub struct NewServiceAccountOpts {
    pub session_policy: Option<Policy>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Inputs for service-account updates. Unset fields are left unchanged.
#[derive(Default)]
pub struct UpdateServiceAccountOpts {
    pub secret_key: Option<String>,
    pub status: Option<AccountStatus>,
    pub session_policy: Option<Policy>,
}

/// The IAM subsystem.
pub struct IamSys {
    directory_mode: AtomicBool,
    cache: Mutex<IamCache>,
    store: OnceLock<Arc<dyn IamStorage>>,
    external: OnceLock<Arc<dyn ExternalEvaluator>>,
    server_cred: OnceLock<Credentials>,
    // Previous administrative credential handed over for startup
    // re-keying; wiped once init completes.
    transient_admin_cred: Mutex<Option<Credentials>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl IamSys {
    pub fn new() -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            directory_mode: AtomicBool::new(false),
            cache: Mutex::new(IamCache::default()),
            store: OnceLock::new(),
            external: OnceLock::new(),
            server_cred: OnceLock::new(),
            transient_admin_cred: Mutex::new(None),
            ready_tx,
            ready_rx,
        })
    }

    /// Stashes the outgoing administrative credential while the server
    /// re-keys during startup. Init wipes it unconditionally.
    pub fn set_transient_admin_cred(&self, cred: Credentials) {
        let mut transient = self
            .transient_admin_cred
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *transient = Some(cred);
    }

    /// Configures the external policy evaluator. May be called at most
    /// once, before serving traffic.
    pub fn set_external_evaluator(&self, evaluator: Arc<dyn ExternalEvaluator>) {
        let _ = self.external.set(evaluator);
    }

    pub fn users_sys_type(&self) -> UsersSysType {
        if self.directory_mode.load(Ordering::Relaxed) {
            UsersSysType::Directory
        } else {
            UsersSysType::Internal
        }
    }

    /// True once a persistence layer is attached.
    pub fn initialized(&self) -> bool {
        self.store.get().is_some()
    }

    /// True once the first full load has completed.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Blocks until the first full load has completed.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        // The sender lives on self, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn store(&self) -> Result<Arc<dyn IamStorage>, IamError> {
        self.store.get().cloned().ok_or(IamError::ServerNotInitialized)
    }

    fn cache(&self) -> MutexGuard<'_, IamCache> {
        // A poisoned cache is still structurally sound and converges on
        // the next load, so recover rather than propagate.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn server_cred(&self) -> Result<&Credentials, IamError> {
        self.server_cred.get().ok_or(IamError::ServerNotInitialized)
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Attaches the persistence layer and selects the identity system.
    pub fn init_store(&self, store: Arc<dyn IamStorage>, directory_mode: bool) {
        let _ = self.store.set(store);
        self.directory_mode.store(directory_mode, Ordering::Relaxed);
    }

    /// One-time initialization: elects the format migrator among peers,
    /// runs the first full load, and spawns the watcher.
    ///
    /// Returns the watcher handle, or `None` when init stopped early
    /// leaving the subsystem partially initialized (a non-retriable
    /// migration failure). Tampered configuration is fatal and surfaces
    /// as an error.
    pub async fn init(
        self: &Arc<Self>,
        store: Arc<dyn IamStorage>,
        locks: Arc<dyn NsLockService>,
        server_cred: Credentials,
        directory_mode: bool,
    ) -> Result<Option<JoinHandle<()>>, IamError> {
        self.init_store(Arc::clone(&store), directory_mode);
        let _ = self.server_cred.set(server_cred);

        if std::env::var_os(READ_ONLY_ENV).is_none() {
            let lock_timeout =
                DynamicTimeout::new(Duration::from_secs(5), Duration::from_secs(3));
            loop {
                // Let one peer win the lock; the rest time out and retry.
                let timeout = lock_timeout.timeout().await;
                if let Err(err) = locks
                    .acquire(MIGRATION_LOCK_BUCKET, MIGRATION_LOCK_OBJECT, timeout)
                    .await
                {
                    lock_timeout.log_failure().await;
                    info!(%err, "waiting for IAM subsystem init, retrying lock acquisition");
                    tokio::time::sleep(random_backoff()).await;
                    continue;
                }
                lock_timeout.log_success().await;

                match store.migrate_backend_format().await {
                    Ok(()) => {
                        locks.release(MIGRATION_LOCK_BUCKET, MIGRATION_LOCK_OBJECT).await;
                        break;
                    }
                    Err(err @ IamError::MaliciousData { .. }) => {
                        locks.release(MIGRATION_LOCK_BUCKET, MIGRATION_LOCK_OBJECT).await;
                        error!(%err, "unable to read IAM configuration, check server credentials");
                        return Err(err);
                    }
                    Err(err) if err.is_retriable() => {
                        locks.release(MIGRATION_LOCK_BUCKET, MIGRATION_LOCK_OBJECT).await;
                        info!(%err, "waiting for IAM subsystem init, retrying migration");
                        continue;
                    }
                    Err(err) => {
                        locks.release(MIGRATION_LOCK_BUCKET, MIGRATION_LOCK_OBJECT).await;
                        warn!(%err, "unable to migrate IAM configuration to the new format");
                        warn!("IAM subsystem is partially initialized, some users may not be available");
                        return Ok(None);
                    }
                }
            }
        }

        loop {
            match self.load_all().await {
                Ok(()) => break,
                Err(err) if err.is_retriable() => {
                    info!(%err, "waiting for IAM subsystem init, retrying load");
                    tokio::time::sleep(random_backoff()).await;
                }
                Err(err) => {
                    error!(%err, "unable to initialize IAM subsystem, some users may not be available");
                    break;
                }
            }
        }

        // Drop the handover credential even when the load failed, so it
        // cannot leak past bootstrap.
        {
            let mut transient = self
                .transient_admin_cred
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *transient = None;
        }

        let handle = iam_watch::spawn_watcher(Arc::clone(self), store.subscribe());
        info!("IAM initialization complete");
        Ok(Some(handle))
    }

    /// Full load: rebuilds the projection from the store under the store
    /// read lock, sweeps expired credentials, and sets the ready latch.
    pub async fn load_all(&self) -> Result<(), IamError> {
        let store = self.store()?;
        let _rguard = store.rlock().await;

        let internal = self.users_sys_type() == UsersSysType::Internal;

        let mut policy_docs = HashMap::new();
        store.load_policy_docs(&mut policy_docs).await?;
        crate::policy::set_default_canned_policies(&mut policy_docs);

        let mut users = HashMap::new();
        let mut groups = HashMap::new();
        if internal {
            store.load_users(UserType::Regular, &mut users).await?;
            store.load_groups(&mut groups).await?;
        }

        let mut user_policies = HashMap::new();
        let mut group_policies = HashMap::new();
        store.load_mapped_policies(UserType::Regular, false, &mut user_policies).await?;
        store.load_mapped_policies(UserType::Regular, true, &mut group_policies).await?;

        store.load_users(UserType::ServiceAccount, &mut users).await?;
        store.load_users(UserType::Sts, &mut users).await?;
        store.load_mapped_policies(UserType::Sts, false, &mut user_policies).await?;

        // Sweep credentials that have expired since they were written.
        let expired: Vec<String> = users
            .values()
            .filter(|cred| cred.is_expired())
            .map(|cred| cred.access_key.clone())
            .collect();
        for access_key in &expired {
            users.remove(access_key);
            user_policies.remove(access_key);
        }

        // Service accounts whose parent just expired go with it, durably.
        let orphaned: Vec<String> = users
            .values()
            .filter(|cred| {
                cred.is_service_account()
                    && cred
                        .parent_user
                        .as_deref()
                        .map(|parent| expired.iter().any(|e| e == parent))
                        .unwrap_or(false)
            })
            .map(|cred| cred.access_key.clone())
            .collect();
        for access_key in &orphaned {
            let _ = store.delete_user_identity(access_key, UserType::ServiceAccount).await;
            users.remove(access_key);
        }

        {
            let mut cache = self.cache();
            cache.policy_docs = policy_docs;
            cache.users = users;
            cache.groups = groups;
            cache.user_policies = user_policies;
            cache.group_policies = group_policies;
            cache.build_user_group_memberships();
        }

        // One-shot transition; later loads leave the latch set.
        self.ready_tx.send_replace(true);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Targeted loaders (watcher entry points and cold-cache fallbacks)
    // ------------------------------------------------------------------

    /// Reloads one canned policy. Absence removes the cache entry.
    pub async fn load_policy(&self, name: &str) -> Result<(), IamError> {
        let store = self.store()?;
        let mut docs = HashMap::new();
        match store.load_policy_doc(name, &mut docs).await {
            Ok(()) => {
                let mut cache = self.cache();
                cache.policy_docs.extend(docs);
                Ok(())
            }
            Err(IamError::NoSuchPolicy) => {
                self.cache().policy_docs.remove(name);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reloads one user and their mapping.
    pub async fn load_user(&self, access_key: &str, user_type: UserType) -> Result<(), IamError> {
        let store = self.store()?;
        let cred = store.get_user_credentials(access_key, user_type).await?;
        let mapping = match store.get_mapped_policy(access_key, user_type, false).await {
            Ok(mapping) => Some(mapping),
            Err(IamError::NoSuchPolicy) => None,
            Err(err) => return Err(err),
        };

        let mut cache = self.cache();
        cache.users.insert(access_key.to_string(), cred);
        cache
            .user_policies
            .insert(access_key.to_string(), mapping.unwrap_or_default());
        Ok(())
    }

    /// Reloads one service account.
    pub async fn load_service_account(&self, access_key: &str) -> Result<(), IamError> {
        self.load_user(access_key, UserType::ServiceAccount).await
    }

    /// Drops a user and their mapping from the projection. Used when a
    /// peer deletes the identity record.
    pub fn forget_user(&self, access_key: &str) {
        let mut cache = self.cache();
        cache.users.remove(access_key);
        cache.user_policies.remove(access_key);
    }

    /// Reloads one group and reindexes memberships. A group missing from
    /// the store is removed from memory, which is how group deletion
    /// propagates to peers.
    pub async fn load_group(&self, group: &str) -> Result<(), IamError> {
        let store = self.store()?;
        match store.get_group_info(group).await {
            Ok(gi) => {
                let mut cache = self.cache();
                cache.groups.insert(group.to_string(), gi.clone());
                // Two steps, in this order, so the reverse index stays
                // the exact transpose regardless of adds or removals.
                cache.remove_group_from_memberships(group);
                cache.update_group_memberships(group, &gi);
                Ok(())
            }
            Err(IamError::NoSuchGroup) => {
                self.cache().remove_group(group);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reloads the mapping of one user or group. An absent record loads
    /// as the empty mapping.
    pub async fn load_policy_mapping(
        &self,
        user_or_group: &str,
        user_type: UserType,
        is_group: bool,
    ) -> Result<(), IamError> {
        let store = self.store()?;
        let mapping = match store.get_mapped_policy(user_or_group, user_type, is_group).await {
            Ok(mapping) => mapping,
            Err(IamError::NoSuchPolicy) => MappedPolicy::default(),
            Err(err) => return Err(err),
        };

        let mut cache = self.cache();
        let target = if is_group {
            &mut cache.group_policies
        } else {
            &mut cache.user_policies
        };
        target.insert(user_or_group.to_string(), mapping);
        Ok(())
    }

    /// Replaces one side of the mapping maps wholesale. The user side
    /// carries both long-term and STS mappings, exactly as the full
    /// load builds it.
    pub async fn load_mapped_policies(&self, is_group: bool) -> Result<(), IamError> {
        let store = self.store()?;
        let mut mappings = HashMap::new();
        store.load_mapped_policies(UserType::Regular, is_group, &mut mappings).await?;
        if !is_group {
            store.load_mapped_policies(UserType::Sts, false, &mut mappings).await?;
        }

        let mut cache = self.cache();
        if is_group {
            cache.group_policies = mappings;
        } else {
            cache.user_policies = mappings;
        }
        Ok(())
    }

    /// Replaces the user map with a fresh load of all principal kinds.
    pub async fn load_all_type_users(&self) -> Result<(), IamError> {
        let store = self.store()?;
        let mut users = HashMap::new();
        for user_type in [UserType::Regular, UserType::Sts, UserType::ServiceAccount] {
            store.load_users(user_type, &mut users).await?;
        }
        self.cache().users = users;
        Ok(())
    }

    async fn reload_policy_docs(&self) -> Result<(), IamError> {
        let store = self.store()?;
        let mut docs = HashMap::new();
        store.load_policy_docs(&mut docs).await?;
        crate::policy::set_default_canned_policies(&mut docs);
        self.cache().policy_docs = docs;
        Ok(())
    }

    async fn reload_groups(&self) -> Result<(), IamError> {
        let store = self.store()?;
        let mut groups = HashMap::new();
        store.load_groups(&mut groups).await?;

        let mut cache = self.cache();
        cache.groups = groups;
        cache.build_user_group_memberships();
        Ok(())
    }

    /// Best-effort cold-cache fallback: pull one principal and whatever
    /// hangs off it (parent, mappings, referenced policies) from the
    /// store.
    async fn load_user_from_store(&self, access_key: &str) {
        let known = self.cache().users.contains_key(access_key);
        if !known {
            if self.load_user(access_key, UserType::Regular).await.is_ok() {
                // Mapping came along with the identity.
            } else if self.load_user(access_key, UserType::ServiceAccount).await.is_ok() {
                let parent = self.cache().users.get(access_key).and_then(|c| c.parent_user.clone());
                if let Some(parent) = parent {
                    if self.users_sys_type() == UsersSysType::Internal {
                        let _ = self.load_user(&parent, UserType::Regular).await;
                    }
                    let _ = self.load_policy_mapping(&parent, UserType::Regular, false).await;
                }
            } else {
                let _ = self.load_user(access_key, UserType::Sts).await;
            }
        }

        let missing: Vec<String> = {
            let cache = self.cache();
            cache
                .user_policies
                .get(access_key)
                .map(MappedPolicy::to_vec)
                .unwrap_or_default()
                .into_iter()
                .filter(|name| !cache.policy_docs.contains_key(name))
                .collect()
        };
        for name in missing {
            let _ = self.load_policy(&name).await;
        }

        self.cache().build_user_group_memberships();
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    /// Installs or overwrites a canned policy.
    pub async fn set_policy(&self, name: &str, policy: Policy) -> Result<(), IamError> {
        let store = self.store()?;
        if name.is_empty() || policy.is_empty() {
            return Err(IamError::InvalidArgument);
        }
        policy.validate()?;

        let _guard = store.lock().await;
        self.reload_policy_docs().await?;
        store.save_policy_doc(name, &policy).await?;
        self.cache().policy_docs.insert(name.to_string(), policy);
        Ok(())
    }

    /// Deletes a canned policy and prunes it from every stored and
    /// cached mapping.
    pub async fn delete_policy(&self, name: &str) -> Result<(), IamError> {
        let store = self.store()?;
        if name.is_empty() {
            return Err(IamError::InvalidArgument);
        }

        let _guard = store.lock().await;
        match store.delete_policy_doc(name).await {
            // Already gone; the cascade below still applies.
            Ok(()) | Err(IamError::NoSuchPolicy) => {}
            Err(err) => return Err(err),
        }
        self.cache().policy_docs.remove(name);

        // Refresh every slice the cascade consults: users, both sides
        // of the mapping maps, policy docs, and groups.
        self.load_all_type_users().await?;
        self.load_mapped_policies(false).await?;
        self.load_mapped_policies(true).await?;
        self.reload_policy_docs().await?;
        self.reload_groups().await?;

        // Collect mappings that referenced the deleted policy; rewrite
        // them outside the cache lock.
        struct Rewrite {
            principal: String,
            policies: String,
            user_type: UserType,
            is_group: bool,
        }
        let mut rewrites = Vec::new();
        let mut stale_users = Vec::new();
        {
            let cache = self.cache();
            for (user, mapping) in &cache.user_policies {
                let mut pset = mapping.policy_set();
                if !pset.remove(name) {
                    continue;
                }
                match cache.users.get(user) {
                    // A deleted or expired temporary account; its
                    // mapping is dropped rather than rewritten.
                    None => stale_users.push(user.clone()),
                    Some(cred) => rewrites.push(Rewrite {
                        principal: user.clone(),
                        policies: models::join_policies(pset),
                        user_type: if cred.is_temp() { UserType::Sts } else { UserType::Regular },
                        is_group: false,
                    }),
                }
            }
            for (group, mapping) in &cache.group_policies {
                let mut pset = mapping.policy_set();
                if !pset.remove(name) {
                    continue;
                }
                rewrites.push(Rewrite {
                    principal: group.clone(),
                    policies: models::join_policies(pset),
                    user_type: UserType::Regular,
                    is_group: true,
                });
            }
        }

        if !stale_users.is_empty() {
            let mut cache = self.cache();
            for user in &stale_users {
                cache.user_policies.remove(user);
            }
        }

        for rewrite in rewrites {
            self.policy_db_set_internal(
                &store,
                &rewrite.principal,
                &rewrite.policies,
                rewrite.user_type,
                rewrite.is_group,
            )
            .await?;
        }

        Ok(())
    }

    /// Returns the named policy document.
    pub async fn info_policy(&self, name: &str) -> Result<Policy, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        self.cache().policy_docs.get(name).cloned().ok_or(IamError::NoSuchPolicy)
    }

    /// Lists all canned policies. Requires a warm cache.
    pub async fn list_policies(&self) -> Result<HashMap<String, Policy>, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        self.wait_ready().await;
        Ok(self.cache().policy_docs.clone())
    }

    /// Filters a comma-separated policy list down to the names that
    /// exist.
    pub fn current_policies(&self, policy_name: &str) -> String {
        if !self.initialized() {
            return String::new();
        }
        let cache = self.cache();
        let existing: Vec<String> = MappedPolicy::new(policy_name)
            .to_vec()
            .into_iter()
            .filter(|name| cache.policy_docs.contains_key(name))
            .collect();
        models::join_policies(existing)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Creates or overwrites a long-term user.
    pub async fn create_user(&self, access_key: &str, info: UserInfo) -> Result<(), IamError> {
        let store = self.store()?;
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }
        if access_key.is_empty() {
            return Err(IamError::InvalidArgument);
        }

        let _guard = store.lock().await;
        self.load_all_type_users().await?;

        let occupied_by_temp = self
            .cache()
            .users
            .get(access_key)
            .map(Credentials::is_temp)
            .unwrap_or(false);
        if occupied_by_temp {
            return Err(IamError::ActionNotAllowed);
        }

        let cred = Credentials::new(
            access_key,
            info.secret_key.as_deref().unwrap_or_default(),
            info.status.unwrap_or(AccountStatus::Enabled),
        );
        let identity = UserIdentity::new(cred.clone());
        store
            .save_user_identity(access_key, UserType::Regular, &identity, SaveOptions::default())
            .await?;
        self.cache().users.insert(access_key.to_string(), cred);

        if !info.policy_name.is_empty() {
            self.load_policy_mapping(access_key, UserType::Regular, false).await?;
            self.reload_policy_docs().await?;
            return self
                .policy_db_set_internal(&store, access_key, &info.policy_name, UserType::Regular, false)
                .await;
        }
        Ok(())
    }

    /// Deletes a long-term user, cascading into group memberships and
    /// dependent service accounts and STS credentials.
    pub async fn delete_user(&self, access_key: &str) -> Result<(), IamError> {
        let store = self.store()?;
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }

        // Group removal takes the store lock per group, so it runs
        // before this operation's own critical section.
        let info = self.get_user_info(access_key).await?;
        for group in &info.member_of {
            self.remove_users_from_group(group, &[access_key.to_string()]).await?;
        }

        let _guard = store.lock().await;

        // Snapshot dependents under the cache lock, then delete them
        // through the store without holding it.
        let dependents: Vec<(String, UserType)> = {
            let cache = self.cache();
            cache
                .users
                .values()
                .filter(|cred| cred.parent_user.as_deref() == Some(access_key))
                .filter(|cred| cred.is_service_account() || cred.is_temp())
                .map(|cred| (cred.access_key.clone(), cred.kind))
                .collect()
        };
        for (dependent, user_type) in &dependents {
            let _ = store.delete_user_identity(dependent, *user_type).await;
        }
        {
            let mut cache = self.cache();
            for (dependent, _) in &dependents {
                cache.users.remove(dependent);
            }
        }

        // Mapping removal failures are not fatal to user deletion.
        let _ = store.delete_mapped_policy(access_key, UserType::Regular, false).await;
        match store.delete_user_identity(access_key, UserType::Regular).await {
            Ok(()) | Err(IamError::NoSuchUser) => {}
            Err(err) => return Err(err),
        }

        let mut cache = self.cache();
        cache.users.remove(access_key);
        cache.user_policies.remove(access_key);
        Ok(())
    }

    /// Registers temporary (STS) credentials with an optional policy
    /// mapping.
    pub async fn set_temp_user(
        &self,
        access_key: &str,
        cred: Credentials,
        policy_name: &str,
    ) -> Result<(), IamError> {
        let store = self.store()?;
        if access_key.is_empty() {
            return Err(IamError::InvalidArgument);
        }

        let ttl = cred
            .expiration
            .map(|at| (at - Utc::now()).num_seconds())
            .unwrap_or(0);
        let opts = SaveOptions::with_ttl(ttl);

        let _guard = store.lock().await;

        // Without an external evaluator the policy claim must resolve to
        // configured canned policies; with one, claims carry the policy
        // and no mapping is written.
        if self.external.get().is_none() && !policy_name.is_empty() {
            let mapping = MappedPolicy::new(policy_name);
            let combined = self.cache().combined_policy(mapping.to_vec());
            if combined.is_empty() {
                return Err(IamError::NoSuchPolicy);
            }
            store
                .save_mapped_policy(access_key, UserType::Sts, false, &mapping, opts)
                .await?;
            self.cache().user_policies.insert(access_key.to_string(), mapping);
        }

        let mut cred = cred;
        cred.kind = UserType::Sts;
        let identity = UserIdentity::new(cred.clone());
        store.save_user_identity(access_key, UserType::Sts, &identity, opts).await?;
        self.cache().users.insert(access_key.to_string(), cred);
        Ok(())
    }

    /// Enables or disables a long-term user.
    pub async fn set_user_status(
        &self,
        access_key: &str,
        status: AccountStatus,
    ) -> Result<(), IamError> {
        let store = self.store()?;
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }

        let _guard = store.lock().await;
        match self.load_user(access_key, UserType::Regular).await {
            Ok(()) | Err(IamError::NoSuchUser) => {}
            Err(err) => return Err(err),
        }

        let cred = self.cache().users.get(access_key).cloned().ok_or(IamError::NoSuchUser)?;
        if cred.is_temp() || cred.is_service_account() {
            return Err(IamError::ActionNotAllowed);
        }

        let updated = Credentials::new(access_key, &cred.secret_key, status);
        let identity = UserIdentity::new(updated.clone());
        store
            .save_user_identity(access_key, UserType::Regular, &identity, SaveOptions::default())
            .await?;
        self.cache().users.insert(access_key.to_string(), updated);
        Ok(())
    }

    /// Replaces a long-term user's secret key.
    pub async fn set_user_secret_key(
        &self,
        access_key: &str,
        secret_key: &str,
    ) -> Result<(), IamError> {
        let store = self.store()?;
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }
        if !models::is_secret_key_valid(secret_key) {
            return Err(IamError::InvalidSecretKey);
        }

        let _guard = store.lock().await;
        match self.load_user(access_key, UserType::Regular).await {
            Ok(()) | Err(IamError::NoSuchUser) => {}
            Err(err) => return Err(err),
        }

        let mut cred = self.cache().users.get(access_key).cloned().ok_or(IamError::NoSuchUser)?;
        cred.secret_key = secret_key.to_string();
        let identity = UserIdentity::new(cred.clone());
        store
            .save_user_identity(access_key, UserType::Regular, &identity, SaveOptions::default())
            .await?;
        self.cache().users.insert(access_key.to_string(), cred);
        Ok(())
    }

    /// Returns valid credentials for an access key, loading from the
    /// store when the cache is cold.
    pub async fn get_user(&self, access_key: &str) -> Option<Credentials> {
        if !self.initialized() {
            return None;
        }

        let warm = self.is_ready();
        if !warm {
            self.load_user_from_store(access_key).await;
        }

        let mut cred = self.cache().users.get(access_key).cloned();
        if cred.is_none() && warm {
            // Not cached; one targeted retry against the store before
            // failing the lookup.
            self.load_user_from_store(access_key).await;
            cred = self.cache().users.get(access_key).cloned();
        }

        let cred = cred?;
        if !cred.is_valid() {
            return None;
        }
        if self.users_sys_type() == UsersSysType::Internal {
            if let Some(parent) = cred.parent_user.as_deref() {
                if !self.cache().users.contains_key(parent) {
                    return None;
                }
            }
        }
        Some(cred)
    }

    /// Describes a long-term user.
    pub async fn get_user_info(&self, name: &str) -> Result<UserInfo, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        if !self.is_ready() {
            self.load_user_from_store(name).await;
        }

        let cache = self.cache();
        let member_of = cache
            .user_group_memberships
            .get(name)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default();

        if self.users_sys_type() != UsersSysType::Internal {
            // Directory users exist if they have a mapping or belong to
            // a group the server knows about.
            let mapping = cache.user_policies.get(name);
            let member = cache.user_group_memberships.contains_key(name);
            if mapping.is_none() && !member {
                return Err(IamError::NoSuchUser);
            }
            return Ok(UserInfo {
                secret_key: None,
                policy_name: mapping.map(|mp| mp.policies.clone()).unwrap_or_default(),
                status: None,
                member_of,
            });
        }

        let cred = cache.users.get(name).ok_or(IamError::NoSuchUser)?;
        if cred.is_temp() || cred.is_service_account() {
            return Err(IamError::ActionNotAllowed);
        }
        Ok(UserInfo {
            secret_key: None,
            policy_name: cache
                .user_policies
                .get(name)
                .map(|mp| mp.policies.clone())
                .unwrap_or_default(),
            status: Some(cred.account_status()),
            member_of,
        })
    }

    /// Lists long-term users. Requires a warm cache.
    pub async fn list_users(&self) -> Result<HashMap<String, UserInfo>, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }
        self.wait_ready().await;

        let cache = self.cache();
        let mut users = HashMap::new();
        for (access_key, cred) in &cache.users {
            if cred.is_temp() || cred.is_service_account() {
                continue;
            }
            users.insert(
                access_key.clone(),
                UserInfo {
                    secret_key: None,
                    policy_name: cache
                        .user_policies
                        .get(access_key)
                        .map(|mp| mp.policies.clone())
                        .unwrap_or_default(),
                    status: Some(cred.account_status()),
                    member_of: cache
                        .user_group_memberships
                        .get(access_key)
                        .map(|groups| groups.iter().cloned().collect())
                        .unwrap_or_default(),
                },
            );
        }
        Ok(users)
    }

    /// True with the parent's name when the key is a temporary
    /// credential.
    pub fn is_temp_user(&self, name: &str) -> Result<(bool, String), IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        let cache = self.cache();
        let cred = cache.users.get(name).ok_or(IamError::NoSuchUser)?;
        if cred.is_temp() {
            Ok((true, cred.parent_user.clone().unwrap_or_default()))
        } else {
            Ok((false, String::new()))
        }
    }

    /// True with the parent's name when the key is a service account.
    pub fn is_service_account(&self, name: &str) -> Result<(bool, String), IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        let cache = self.cache();
        let cred = cache.users.get(name).ok_or(IamError::NoSuchUser)?;
        if cred.is_service_account() {
            Ok((true, cred.parent_user.clone().unwrap_or_default()))
        } else {
            Ok((false, String::new()))
        }
    }

    // ------------------------------------------------------------------
    // Service accounts
    // ------------------------------------------------------------------

    /// Creates a service account under a parent user.
    pub async fn new_service_account(
        &self,
        parent_user: &str,
        groups: Vec<String>,
        opts: NewServiceAccountOpts,
    ) -> Result<Credentials, IamError> {
        let store = self.store()?;

        let mut policy_buf = Vec::new();
        if let Some(session_policy) = &opts.session_policy {
            session_policy.validate()?;
            policy_buf = serde_json::to_vec(session_policy)?;
            if policy_buf.len() > MAX_SESSION_POLICY_SIZE {
                return Err(IamError::PolicyTooLarge);
            }
        }

        if parent_user == self.server_cred()?.access_key {
            return Err(IamError::ActionNotAllowed);
        }

        let _guard = store.lock().await;
        self.load_all_type_users().await?;

        {
            let cache = self.cache();
            match cache.users.get(parent_user) {
                Some(cred) => {
                    // Service accounts cannot beget service accounts.
                    if cred.is_service_account() {
                        return Err(IamError::ActionNotAllowed);
                    }
                }
                None => {
                    // Directory principals are known only through their
                    // mappings.
                    if self.users_sys_type() == UsersSysType::Internal {
                        return Err(IamError::NoSuchUser);
                    }
                    let mapped = cache.user_policies.contains_key(parent_user)
                        || groups.iter().any(|g| cache.group_policies.contains_key(g));
                    if !mapped {
                        return Err(IamError::NoSuchUser);
                    }
                }
            }
        }

        let mut claims: HashMap<String, Value> = HashMap::new();
        claims.insert(token::PARENT_CLAIM.to_string(), Value::from(parent_user));
        if policy_buf.is_empty() {
            claims.insert(
                token::SA_POLICY_CLAIM.to_string(),
                Value::from(token::SA_POLICY_INHERITED),
            );
        } else {
            claims.insert(
                token::SESSION_POLICY_CLAIM.to_string(),
                Value::from(BASE64.encode(&policy_buf)),
            );
            claims.insert(
                token::SA_POLICY_CLAIM.to_string(),
                Value::from(token::SA_POLICY_EMBEDDED),
            );
        }

        let (access_key, secret_key) = match opts.access_key {
            Some(access_key) => {
                let secret_key = opts.secret_key.unwrap_or_default();
                if !models::is_secret_key_valid(&secret_key) {
                    return Err(IamError::InvalidSecretKey);
                }
                (access_key, secret_key)
            }
            None => models::generate_credentials(),
        };
        let session_token =
            token::sign_claims(&access_key, &claims, &self.server_cred()?.secret_key)?;

        let mut cred = Credentials::new(&access_key, &secret_key, AccountStatus::Enabled);
        cred.parent_user = Some(parent_user.to_string());
        cred.groups = Some(groups);
        cred.session_token = Some(session_token);
        cred.kind = UserType::ServiceAccount;

        let identity = UserIdentity::new(cred.clone());
        store
            .save_user_identity(&access_key, UserType::ServiceAccount, &identity, SaveOptions::default())
            .await?;
        self.cache().users.insert(access_key.clone(), cred.clone());
        Ok(cred)
    }

    /// Edits a service account: secret rotation, status, session policy.
    pub async fn update_service_account(
        &self,
        access_key: &str,
        opts: UpdateServiceAccountOpts,
    ) -> Result<(), IamError> {
        let store = self.store()?;

        let _guard = store.lock().await;
        match self.load_user(access_key, UserType::ServiceAccount).await {
            Ok(()) | Err(IamError::NoSuchUser) => {}
            Err(err) => return Err(err),
        }

        let mut cred = {
            let cache = self.cache();
            match cache.users.get(access_key) {
                Some(cred) if cred.is_service_account() => cred.clone(),
                _ => return Err(IamError::NoSuchServiceAccount),
            }
        };

        if let Some(secret_key) = &opts.secret_key {
            if !models::is_secret_key_valid(secret_key) {
                return Err(IamError::InvalidSecretKey);
            }
            cred.secret_key = secret_key.clone();
        }
        if let Some(status) = opts.status {
            cred.status = match status {
                AccountStatus::Enabled => KeyStatus::On,
                AccountStatus::Disabled => KeyStatus::Off,
            };
        }

        if let Some(session_policy) = &opts.session_policy {
            session_policy.validate()?;
            let policy_buf = serde_json::to_vec(session_policy)?;
            if policy_buf.len() > MAX_SESSION_POLICY_SIZE {
                return Err(IamError::PolicyTooLarge);
            }
            let mut claims: HashMap<String, Value> = HashMap::new();
            claims.insert(
                token::SESSION_POLICY_CLAIM.to_string(),
                Value::from(BASE64.encode(&policy_buf)),
            );
            claims.insert(
                token::SA_POLICY_CLAIM.to_string(),
                Value::from(token::SA_POLICY_EMBEDDED),
            );
            claims.insert(
                token::PARENT_CLAIM.to_string(),
                Value::from(cred.parent_user.clone().unwrap_or_default()),
            );
            cred.session_token = Some(token::sign_claims(
                access_key,
                &claims,
                &self.server_cred()?.secret_key,
            )?);
        }

        let identity = UserIdentity::new(cred.clone());
        store
            .save_user_identity(access_key, UserType::ServiceAccount, &identity, SaveOptions::default())
            .await?;
        self.cache().users.insert(access_key.to_string(), cred);
        Ok(())
    }

    /// Lists the service accounts of a parent user, secrets scrubbed.
    pub async fn list_service_accounts(
        &self,
        parent_user: &str,
    ) -> Result<Vec<Credentials>, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        self.wait_ready().await;

        let cache = self.cache();
        Ok(cache
            .users
            .values()
            .filter(|cred| {
                cred.is_service_account() && cred.parent_user.as_deref() == Some(parent_user)
            })
            .map(Credentials::scrubbed)
            .collect())
    }

    /// Returns a service account and its embedded session policy, if
    /// one is carried in the session token.
    pub async fn get_service_account(
        &self,
        access_key: &str,
    ) -> Result<(Credentials, Option<Policy>), IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }

        let cred = {
            let cache = self.cache();
            match cache.users.get(access_key) {
                Some(cred) if cred.is_service_account() => cred.clone(),
                _ => return Err(IamError::NoSuchServiceAccount),
            }
        };

        let embedded = cred
            .session_token
            .as_deref()
            .and_then(|session_token| {
                let secret = &self.server_cred().ok()?.secret_key;
                token::extract_claims(session_token, secret).ok()
            })
            .and_then(|claims| {
                let kind = token::lookup(&claims, token::SA_POLICY_CLAIM)?;
                if kind != token::SA_POLICY_EMBEDDED {
                    return None;
                }
                let encoded = token::lookup(&claims, token::SESSION_POLICY_CLAIM)?;
                let raw = BASE64.decode(encoded).ok()?;
                Policy::parse(&raw).ok()
            });

        Ok((cred.scrubbed(), embedded))
    }

    /// Deletes a service account. Absence is success.
    pub async fn delete_service_account(&self, access_key: &str) -> Result<(), IamError> {
        let store = self.store()?;

        let _guard = store.lock().await;
        let is_service_account = self
            .cache()
            .users
            .get(access_key)
            .map(Credentials::is_service_account)
            .unwrap_or(false);
        if !is_service_account {
            return Ok(());
        }

        match store.delete_user_identity(access_key, UserType::ServiceAccount).await {
            Ok(()) | Err(IamError::NoSuchUser) => {}
            Err(err) => return Err(err),
        }
        self.cache().users.remove(access_key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Adds users to a group, creating it (enabled) when absent.
    pub async fn add_users_to_group(
        &self,
        group: &str,
        members: &[String],
    ) -> Result<(), IamError> {
        let store = self.store()?;
        if group.is_empty() {
            return Err(IamError::InvalidArgument);
        }
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }

        let _guard = store.lock().await;
        self.load_all_type_users().await?;
        self.load_group(group).await?;

        let gi = {
            let cache = self.cache();
            for member in members {
                let cred = cache.users.get(member).ok_or(IamError::NoSuchUser)?;
                if cred.is_temp() {
                    return Err(IamError::ActionNotAllowed);
                }
            }
            match cache.groups.get(group) {
                Some(existing) => {
                    let mut gi = existing.clone();
                    for member in members {
                        if !gi.contains(member) {
                            gi.members.push(member.clone());
                        }
                    }
                    gi
                }
                None => GroupInfo::new(members.to_vec()),
            }
        };

        store.save_group_info(group, &gi).await?;

        let mut cache = self.cache();
        cache.groups.insert(group.to_string(), gi);
        for member in members {
            cache
                .user_group_memberships
                .entry(member.clone())
                .or_default()
                .insert(group.to_string());
        }
        Ok(())
    }

    /// Removes users from a group. With no users given, deletes the
    /// group, which must already be empty.
    pub async fn remove_users_from_group(
        &self,
        group: &str,
        members: &[String],
    ) -> Result<(), IamError> {
        let store = self.store()?;
        if group.is_empty() {
            return Err(IamError::InvalidArgument);
        }
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }

        let _guard = store.lock().await;
        self.load_all_type_users().await?;
        self.load_group(group).await?;

        let gi = {
            let cache = self.cache();
            for member in members {
                let cred = cache.users.get(member).ok_or(IamError::NoSuchUser)?;
                if cred.is_temp() {
                    return Err(IamError::ActionNotAllowed);
                }
            }
            cache.groups.get(group).cloned().ok_or(IamError::NoSuchGroup)?
        };

        if members.is_empty() && !gi.members.is_empty() {
            return Err(IamError::GroupNotEmpty);
        }

        if members.is_empty() {
            // Empty group, empty removal list: delete the group. The
            // mapping goes first; either record may already be absent.
            match store.delete_mapped_policy(group, UserType::Regular, true).await {
                Ok(()) | Err(IamError::NoSuchPolicy) => {}
                Err(err) => return Err(err),
            }
            match store.delete_group_info(group).await {
                Ok(()) | Err(IamError::NoSuchGroup) => {}
                Err(err) => return Err(err),
            }
            self.cache().remove_group(group);
            return Ok(());
        }

        let mut gi = gi;
        gi.members.retain(|member| !members.contains(member));
        store.save_group_info(group, &gi).await?;

        let mut cache = self.cache();
        cache.groups.insert(group.to_string(), gi);
        for member in members {
            if let Some(groups) = cache.user_group_memberships.get_mut(member) {
                groups.remove(group);
                if groups.is_empty() {
                    cache.user_group_memberships.remove(member);
                }
            }
        }
        Ok(())
    }

    /// Enables or disables a group. Disabled groups contribute no
    /// policies during evaluation.
    pub async fn set_group_status(&self, group: &str, enabled: bool) -> Result<(), IamError> {
        let store = self.store()?;
        if group.is_empty() {
            return Err(IamError::InvalidArgument);
        }
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }

        let _guard = store.lock().await;
        self.load_group(group).await?;

        let mut gi = self.cache().groups.get(group).cloned().ok_or(IamError::NoSuchGroup)?;
        gi.status = if enabled { AccountStatus::Enabled } else { AccountStatus::Disabled };

        store.save_group_info(group, &gi).await?;
        self.cache().groups.insert(group.to_string(), gi);
        Ok(())
    }

    /// Describes a group.
    pub async fn get_group_description(&self, group: &str) -> Result<GroupDesc, IamError> {
        let policies = self.policy_db_get(group, true, &[])?;
        let policy = models::join_policies(policies);

        if self.users_sys_type() != UsersSysType::Internal {
            return Ok(GroupDesc {
                name: group.to_string(),
                status: None,
                members: Vec::new(),
                policy,
            });
        }

        let cache = self.cache();
        let gi = cache.groups.get(group).ok_or(IamError::NoSuchGroup)?;
        Ok(GroupDesc {
            name: group.to_string(),
            status: Some(gi.status),
            members: gi.members.clone(),
            policy,
        })
    }

    /// Lists group names. Requires a warm cache.
    pub async fn list_groups(&self) -> Result<Vec<String>, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        if self.users_sys_type() != UsersSysType::Internal {
            return Err(IamError::ActionNotAllowed);
        }
        self.wait_ready().await;
        Ok(self.cache().groups.keys().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Policy mappings
    // ------------------------------------------------------------------

    /// Sets (or, with an empty policy string, removes) the mapping of a
    /// user or group.
    pub async fn policy_db_set(
        &self,
        name: &str,
        policy: &str,
        is_group: bool,
    ) -> Result<(), IamError> {
        let store = self.store()?;
        let _guard = store.lock().await;

        // Directory principals are tracked under the STS kind.
        let user_type = match self.users_sys_type() {
            UsersSysType::Directory => UserType::Sts,
            UsersSysType::Internal => UserType::Regular,
        };
        self.policy_db_set_internal(&store, name, policy, user_type, is_group).await
    }

    /// Mapping writes all funnel through here. Caller holds the store
    /// write lock.
    async fn policy_db_set_internal(
        &self,
        store: &Arc<dyn IamStorage>,
        name: &str,
        policy: &str,
        user_type: UserType,
        is_group: bool,
    ) -> Result<(), IamError> {
        if name.is_empty() {
            return Err(IamError::InvalidArgument);
        }

        if self.users_sys_type() == UsersSysType::Internal {
            let cache = self.cache();
            if is_group {
                if !cache.groups.contains_key(name) {
                    return Err(IamError::NoSuchGroup);
                }
            } else if !cache.users.contains_key(name) {
                return Err(IamError::NoSuchUser);
            }
        }

        if policy.is_empty() {
            if self.users_sys_type() == UsersSysType::Directory {
                // Compatibility sweep: older releases wrote directory
                // principals under the regular kind.
                let _ = store.delete_mapped_policy(name, UserType::Regular, false).await;
            }
            match store.delete_mapped_policy(name, user_type, is_group).await {
                Ok(()) | Err(IamError::NoSuchPolicy) => {}
                Err(err) => return Err(err),
            }
            let mut cache = self.cache();
            if is_group {
                cache.group_policies.remove(name);
            } else {
                cache.user_policies.remove(name);
            }
            return Ok(());
        }

        let mapping = MappedPolicy::new(policy);
        {
            let cache = self.cache();
            for policy_name in mapping.to_vec() {
                if !cache.policy_docs.contains_key(&policy_name) {
                    warn!(policy = %policy_name, "mapping references a policy that does not exist");
                    return Err(IamError::NoSuchPolicy);
                }
            }
        }

        store
            .save_mapped_policy(name, user_type, is_group, &mapping, SaveOptions::default())
            .await?;

        let mut cache = self.cache();
        if is_group {
            cache.group_policies.insert(name.to_string(), mapping);
        } else {
            cache.user_policies.insert(name.to_string(), mapping);
        }
        Ok(())
    }

    /// Effective policy names for a user or group, including policies
    /// inherited through the given groups.
    pub fn policy_db_get(
        &self,
        name: &str,
        is_group: bool,
        groups: &[String],
    ) -> Result<Vec<String>, IamError> {
        if !self.initialized() {
            return Err(IamError::ServerNotInitialized);
        }
        if name.is_empty() {
            return Err(IamError::InvalidArgument);
        }

        let cache = self.cache();
        let sys_type = self.users_sys_type();
        let mut policies = cache.policy_db_get(name, is_group, sys_type)?;
        if !is_group {
            for group in groups {
                policies.extend(cache.policy_db_get(group, true, sys_type)?);
            }
        }
        Ok(policies)
    }

    /// Combines the named canned policies into one document. Missing
    /// names contribute nothing.
    pub fn get_combined_policy(&self, policies: &[String]) -> Policy {
        self.cache().combined_policy(policies)
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Decides whether the request is allowed.
    pub async fn is_allowed(&self, args: &Args) -> bool {
        // A configured external engine supersedes internal evaluation.
        if let Some(external) = self.external.get() {
            return match external.is_allowed(args).await {
                Ok(decision) => decision,
                Err(err) => {
                    error!(%err, "external policy evaluation failed");
                    false
                }
            };
        }

        // Policies do not apply to the owner.
        if args.is_owner {
            return true;
        }

        // A disabled or expired credential denies regardless of kind;
        // cold-cache fallbacks may re-materialize expired records
        // between sweeps.
        if let Some(cred) = self.cache().users.get(&args.account_name) {
            if !cred.is_valid() {
                return false;
            }
        }

        match self.is_temp_user(&args.account_name) {
            Ok((true, parent)) => return self.is_allowed_sts(args, &parent),
            Ok((false, _)) => {}
            Err(_) => return false,
        }

        match self.is_service_account(&args.account_name) {
            Ok((true, parent)) => return self.is_allowed_service_account(args, &parent),
            Ok((false, _)) => {}
            Err(_) => return false,
        }

        let policies = match self.policy_db_get(&args.account_name, false, &args.groups) {
            Ok(policies) => policies,
            Err(_) => return false,
        };
        if policies.is_empty() {
            return false;
        }
        self.get_combined_policy(&policies).is_allowed(args)
    }

    /// Evaluation path for temporary credentials: strict claim checks
    /// on top of the mapped policies.
    pub fn is_allowed_sts(&self, args: &Args, parent_user: &str) -> bool {
        if self.users_sys_type() == UsersSysType::Directory {
            return self.is_allowed_directory_sts(args, parent_user);
        }

        // The token must carry a policy claim naming exactly the
        // policies the server has mapped to this credential.
        let claimed = match args.get_policies(token::OPENID_POLICY_CLAIM) {
            Some(claimed) if !claimed.is_empty() => claimed,
            _ => return false,
        };

        let cache = self.cache();
        let mapping = match cache.user_policies.get(&args.account_name) {
            Some(mapping) => mapping,
            None => return false,
        };
        if claimed != mapping.policy_set() {
            return false;
        }
        for name in &claimed {
            if !cache.policy_docs.contains_key(name) {
                warn!(policy = %name, "policy in token claim missing from server, rejecting");
                return false;
            }
        }
        let combined = cache.combined_policy(&claimed);
        drop(cache);

        if let Some(session_policy) = args.claims.get(token::SESSION_POLICY_CLAIM) {
            let raw = match session_policy.as_str() {
                Some(raw) => raw,
                None => return false,
            };
            let sub_policy = match Policy::parse(raw.as_bytes()) {
                Ok(sub_policy) => sub_policy,
                Err(_) => return false,
            };
            if sub_policy.version.is_empty() {
                return false;
            }
            return combined.is_allowed(args) && sub_policy.is_allowed(args);
        }

        combined.is_allowed(args)
    }

    /// Directory-mode STS evaluation: the directory-user claim must name
    /// the parent; the parent's mappings decide.
    fn is_allowed_directory_sts(&self, args: &Args, parent_user: &str) -> bool {
        match token::lookup(&args.claims, token::DIRECTORY_USER_CLAIM) {
            Some(claimed) if claimed == parent_user => {}
            _ => return false,
        }

        let policies = match self.policy_db_get(parent_user, false, &args.groups) {
            Ok(policies) => policies,
            Err(_) => return false,
        };
        if policies.is_empty() {
            return false;
        }
        let combined = self.get_combined_policy(&policies);
        if combined.is_empty() {
            return false;
        }
        combined.is_allowed(args)
    }

    /// Evaluation path for service accounts: the parent claim must match
    /// the stored parent, and the parent's policies (optionally narrowed
    /// by an embedded session policy) decide.
    pub fn is_allowed_service_account(&self, args: &Args, parent_user: &str) -> bool {
        // Without a matching parent claim a leaked session token could
        // be replayed with wider privileges.
        match token::lookup(&args.claims, token::PARENT_CLAIM) {
            Some(claimed) if claimed == parent_user => {}
            _ => return false,
        }

        let policies = match self.policy_db_get(parent_user, false, &args.groups) {
            Ok(policies) => policies,
            Err(_) => return false,
        };
        if policies.is_empty() {
            return false;
        }
        let combined = self.get_combined_policy(&policies);
        if combined.is_empty() {
            return false;
        }

        let mut parent_args = args.clone();
        parent_args.account_name = parent_user.to_string();

        let sa_policy = match token::lookup(&args.claims, token::SA_POLICY_CLAIM) {
            Some(sa_policy) => sa_policy,
            None => return false,
        };
        if sa_policy == token::SA_POLICY_INHERITED {
            return combined.is_allowed(&parent_args);
        }

        let encoded = match token::lookup(&args.claims, token::SESSION_POLICY_CLAIM) {
            Some(encoded) => encoded,
            None => return false,
        };
        let raw = match BASE64.decode(encoded) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let sub_policy = match Policy::parse(&raw) {
            Ok(sub_policy) => sub_policy,
            Err(_) => return false,
        };
        if sub_policy.version.is_empty() {
            return false;
        }

        combined.is_allowed(&parent_args) && sub_policy.is_allowed(&parent_args)
    }
}

fn random_backoff() -> Duration {
    Duration::from_secs_f64(rand::random::<f64>() * 5.0)
}
