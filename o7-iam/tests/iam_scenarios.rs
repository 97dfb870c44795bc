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

//! End-to-end scenarios for the IAM subsystem over an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use o7_core::{LocalNsLock, MemObjectStore};
use o7_iam::policy::{Policy, Statement};
use o7_iam::sys::NewServiceAccountOpts;
use o7_iam::token;
use o7_iam::{
    AccountStatus, Args, Credentials, IamError, IamObjectStore, IamStorage, IamSys, UserInfo,
    UserType,
};

const SERVER_SECRET: &str = "o7-server-secret-key-for-tests";

async fn new_sys() -> (Arc<IamSys>, Arc<IamObjectStore>) {
    let store = IamObjectStore::new(MemObjectStore::new());
    let sys = IamSys::new();
    let locks = Arc::new(LocalNsLock::new());
    let server_cred = Credentials::new("O7ADMIN", SERVER_SECRET, AccountStatus::Enabled);
    let _watcher = sys.init(store.clone(), locks, server_cred, false)
        .await
        .expect("init")
        .expect("watcher");
    (sys, store)
}

async fn create_user(sys: &IamSys, access_key: &str) {
    sys.create_user(
        access_key,
        UserInfo {
            secret_key: Some("user-secret-key".to_string()),
            status: Some(AccountStatus::Enabled),
            ..Default::default()
        },
    )
    .await
    .expect("create user");
}

fn request(account: &str, action: &str, resource: &str) -> Args {
    Args {
        account_name: account.to_string(),
        action: action.to_string(),
        resource: resource.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_user_with_readonly_policy() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "alice").await;
    sys.policy_db_set("alice", "readonly", false).await.unwrap();

    assert!(sys.is_allowed(&request("alice", "s3:GetObject", "bkt/obj")).await);
    assert!(!sys.is_allowed(&request("alice", "s3:PutObject", "bkt/obj")).await);
}

#[tokio::test]
async fn test_delete_policy_prunes_mappings() {
    let (sys, store) = new_sys().await;

    create_user(&sys, "alice").await;
    sys.policy_db_set("alice", "readonly", false).await.unwrap();
    assert!(sys.is_allowed(&request("alice", "s3:GetObject", "bkt/obj")).await);

    sys.delete_policy("readonly").await.unwrap();

    assert!(!sys.is_allowed(&request("alice", "s3:GetObject", "bkt/obj")).await);
    // The durable mapping no longer names the deleted policy.
    assert!(matches!(
        store.get_mapped_policy("alice", UserType::Regular, false).await,
        Err(IamError::NoSuchPolicy)
    ));
    assert!(sys.get_user_info("alice").await.unwrap().policy_name.is_empty());
}

#[tokio::test]
async fn test_delete_policy_prunes_sts_mappings() {
    let (sys, store) = new_sys().await;

    let mut cred = Credentials::new("TMPKEY5", "temp-secret-key", AccountStatus::Enabled);
    cred.expiration = Some(Utc::now() + chrono::Duration::hours(1));
    sys.set_temp_user("TMPKEY5", cred, "readonly").await.unwrap();

    sys.delete_policy("readonly").await.unwrap();

    // The STS mapping is rewritten under the STS kind; emptied, it is
    // removed from the store entirely.
    assert!(matches!(
        store.get_mapped_policy("TMPKEY5", UserType::Sts, false).await,
        Err(IamError::NoSuchPolicy)
    ));
}

#[tokio::test]
async fn test_delete_policy_prunes_group_mappings_not_yet_cached() {
    let (sys, store) = new_sys().await;

    // A peer wrote this group and its mapping; this node has not
    // watched the events yet.
    let gi = o7_iam::GroupInfo::new(vec![]);
    store.save_group_info("g2", &gi).await.unwrap();
    let mapping = o7_iam::MappedPolicy::new("readonly,readwrite");
    store
        .save_mapped_policy("g2", UserType::Regular, true, &mapping, o7_iam::SaveOptions::default())
        .await
        .unwrap();

    sys.delete_policy("readonly").await.unwrap();

    let pruned = store.get_mapped_policy("g2", UserType::Regular, true).await.unwrap();
    assert_eq!(pruned.policies, "readwrite");
}

#[tokio::test]
async fn test_group_policy_and_group_disable() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "bob").await;
    sys.add_users_to_group("g1", &["bob".to_string()]).await.unwrap();
    sys.policy_db_set("g1", "readwrite", true).await.unwrap();

    let mut args = request("bob", "s3:PutObject", "bkt/obj");
    args.groups = vec!["g1".to_string()];
    assert!(sys.is_allowed(&args).await);

    sys.set_group_status("g1", false).await.unwrap();
    assert!(!sys.is_allowed(&args).await);
}

#[tokio::test]
async fn test_service_account_with_embedded_session_policy() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "alice").await;
    sys.policy_db_set("alice", "readwrite", false).await.unwrap();

    let session_policy = Policy::new(vec![Statement::allow(&["s3:GetObject"], &["bkt/*"])]);
    let cred = sys
        .new_service_account(
            "alice",
            Vec::new(),
            NewServiceAccountOpts {
                session_policy: Some(session_policy),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let claims =
        token::extract_claims(cred.session_token.as_deref().unwrap(), SERVER_SECRET).unwrap();

    let mut get = request(&cred.access_key, "s3:GetObject", "bkt/x");
    get.claims = claims.clone();
    assert!(sys.is_allowed(&get).await);

    // The parent allows writes, but the session policy narrows the
    // account to reads only.
    let mut put = request(&cred.access_key, "s3:PutObject", "bkt/x");
    put.claims = claims.clone();
    assert!(!sys.is_allowed(&put).await);

    // A forged parent claim denies outright.
    let mut forged = request(&cred.access_key, "s3:GetObject", "bkt/x");
    forged.claims = claims;
    forged
        .claims
        .insert(token::PARENT_CLAIM.to_string(), Value::from("mallory"));
    assert!(!sys.is_allowed(&forged).await);
}

#[tokio::test]
async fn test_temp_user_expires_on_full_load() {
    let (sys, _store) = new_sys().await;

    let mut cred = Credentials::new("TMPKEY1", "temp-secret-key", AccountStatus::Enabled);
    cred.expiration = Some(Utc::now() + chrono::Duration::seconds(1));
    sys.set_temp_user("TMPKEY1", cred, "readonly").await.unwrap();

    let mut args = request("TMPKEY1", "s3:GetObject", "bkt/obj");
    args.claims
        .insert(token::OPENID_POLICY_CLAIM.to_string(), Value::from("readonly"));
    assert!(sys.is_allowed(&args).await);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    sys.load_all().await.unwrap();

    assert!(sys.get_user("TMPKEY1").await.is_none());
    assert!(!sys.is_allowed(&args).await);
}

#[tokio::test]
async fn test_group_removal_flow() {
    let (sys, store) = new_sys().await;

    create_user(&sys, "bob").await;
    sys.add_users_to_group("g1", &["bob".to_string()]).await.unwrap();

    // Deleting a group that still has members is refused.
    assert!(matches!(
        sys.remove_users_from_group("g1", &[]).await,
        Err(IamError::GroupNotEmpty)
    ));

    sys.remove_users_from_group("g1", &["bob".to_string()]).await.unwrap();
    sys.remove_users_from_group("g1", &[]).await.unwrap();

    assert!(matches!(store.get_group_info("g1").await, Err(IamError::NoSuchGroup)));
    assert!(!sys.list_groups().await.unwrap().contains(&"g1".to_string()));
    assert!(matches!(
        sys.get_group_description("g1").await,
        Err(IamError::NoSuchGroup)
    ));
}

#[tokio::test]
async fn test_delete_user_cascades_to_dependents() {
    let (sys, store) = new_sys().await;

    create_user(&sys, "alice").await;
    sys.policy_db_set("alice", "readwrite", false).await.unwrap();
    sys.add_users_to_group("g1", &["alice".to_string()]).await.unwrap();

    let svc = sys
        .new_service_account("alice", Vec::new(), NewServiceAccountOpts::default())
        .await
        .unwrap();

    let mut sts = Credentials::new("TMPKEY2", "temp-secret-key", AccountStatus::Enabled);
    sts.expiration = Some(Utc::now() + chrono::Duration::hours(1));
    sts.parent_user = Some("alice".to_string());
    sys.set_temp_user("TMPKEY2", sts, "").await.unwrap();

    sys.delete_user("alice").await.unwrap();

    for (name, user_type) in [
        ("alice", UserType::Regular),
        (svc.access_key.as_str(), UserType::ServiceAccount),
        ("TMPKEY2", UserType::Sts),
    ] {
        assert!(
            matches!(
                store.get_user_credentials(name, user_type).await,
                Err(IamError::NoSuchUser)
            ),
            "{name} should be durably deleted"
        );
        assert!(sys.get_user(name).await.is_none(), "{name} should be gone from memory");
    }
    assert!(matches!(
        store.get_mapped_policy("alice", UserType::Regular, false).await,
        Err(IamError::NoSuchPolicy)
    ));
}

#[tokio::test]
async fn test_mapping_removal_is_idempotent_and_restorable() {
    let (sys, store) = new_sys().await;

    create_user(&sys, "carol").await;
    sys.policy_db_set("carol", "readonly", false).await.unwrap();

    sys.policy_db_set("carol", "", false).await.unwrap();
    sys.policy_db_set("carol", "", false).await.unwrap();
    assert!(matches!(
        store.get_mapped_policy("carol", UserType::Regular, false).await,
        Err(IamError::NoSuchPolicy)
    ));
    assert!(sys.get_user_info("carol").await.unwrap().policy_name.is_empty());

    sys.policy_db_set("carol", "readonly", false).await.unwrap();
    assert_eq!(sys.get_user_info("carol").await.unwrap().policy_name, "readonly");
}

#[tokio::test]
async fn test_mapping_requires_existing_policy() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "dave").await;
    assert!(matches!(
        sys.policy_db_set("dave", "no-such-policy", false).await,
        Err(IamError::NoSuchPolicy)
    ));
    assert!(matches!(
        sys.policy_db_set("ghost", "readonly", false).await,
        Err(IamError::NoSuchUser)
    ));
}

#[tokio::test]
async fn test_policy_composition_is_order_insensitive() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "erin").await;
    create_user(&sys, "frank").await;
    sys.policy_db_set("erin", "readonly,writeonly", false).await.unwrap();
    sys.policy_db_set("frank", "writeonly,readonly", false).await.unwrap();

    for action in ["s3:GetObject", "s3:PutObject", "s3:DeleteObject"] {
        let erin = sys.is_allowed(&request("erin", action, "bkt/obj")).await;
        let frank = sys.is_allowed(&request("frank", action, "bkt/obj")).await;
        assert_eq!(erin, frank, "decision for {action} must not depend on order");
    }
    assert!(sys.is_allowed(&request("erin", "s3:GetObject", "bkt/obj")).await);
    assert!(sys.is_allowed(&request("erin", "s3:PutObject", "bkt/obj")).await);
    assert!(!sys.is_allowed(&request("erin", "s3:DeleteObject", "bkt/obj")).await);
}

#[tokio::test]
async fn test_user_status_toggle() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "gina").await;
    sys.policy_db_set("gina", "readonly", false).await.unwrap();
    assert!(sys.is_allowed(&request("gina", "s3:GetObject", "bkt/obj")).await);

    sys.set_user_status("gina", AccountStatus::Disabled).await.unwrap();
    assert!(!sys.is_allowed(&request("gina", "s3:GetObject", "bkt/obj")).await);
    assert!(sys.get_user("gina").await.is_none());

    sys.set_user_status("gina", AccountStatus::Enabled).await.unwrap();
    assert!(sys.is_allowed(&request("gina", "s3:GetObject", "bkt/obj")).await);
}

#[tokio::test]
async fn test_service_account_restrictions() {
    let (sys, _store) = new_sys().await;

    // Parent must exist.
    assert!(matches!(
        sys.new_service_account("ghost", Vec::new(), NewServiceAccountOpts::default()).await,
        Err(IamError::NoSuchUser)
    ));

    // The server's own administrative key may not be a parent.
    assert!(matches!(
        sys.new_service_account("O7ADMIN", Vec::new(), NewServiceAccountOpts::default()).await,
        Err(IamError::ActionNotAllowed)
    ));

    create_user(&sys, "henry").await;
    let svc = sys
        .new_service_account("henry", Vec::new(), NewServiceAccountOpts::default())
        .await
        .unwrap();

    // Service accounts cannot beget service accounts.
    assert!(matches!(
        sys.new_service_account(&svc.access_key, Vec::new(), NewServiceAccountOpts::default())
            .await,
        Err(IamError::ActionNotAllowed)
    ));

    // Status changes go through the service-account API, not the user
    // one.
    assert!(matches!(
        sys.set_user_status(&svc.access_key, AccountStatus::Disabled).await,
        Err(IamError::ActionNotAllowed)
    ));

    // Deletion is idempotent.
    sys.delete_service_account(&svc.access_key).await.unwrap();
    sys.delete_service_account(&svc.access_key).await.unwrap();
}

#[tokio::test]
async fn test_oversized_session_policy_rejected() {
    let (sys, _store) = new_sys().await;
    create_user(&sys, "iris").await;

    let resources: Vec<String> = (0..600).map(|i| format!("bkt/very/long/prefix/{i}/*")).collect();
    let resource_refs: Vec<&str> = resources.iter().map(String::as_str).collect();
    let oversized = Policy::new(vec![Statement::allow(&["s3:GetObject"], &resource_refs)]);

    assert!(matches!(
        sys.new_service_account(
            "iris",
            Vec::new(),
            NewServiceAccountOpts {
                session_policy: Some(oversized),
                ..Default::default()
            },
        )
        .await,
        Err(IamError::PolicyTooLarge)
    ));
}

#[tokio::test]
async fn test_inherited_service_account_follows_parent_policy() {
    let (sys, _store) = new_sys().await;

    create_user(&sys, "judy").await;
    sys.policy_db_set("judy", "readonly", false).await.unwrap();

    let cred = sys
        .new_service_account("judy", Vec::new(), NewServiceAccountOpts::default())
        .await
        .unwrap();
    let claims =
        token::extract_claims(cred.session_token.as_deref().unwrap(), SERVER_SECRET).unwrap();

    let mut get = request(&cred.access_key, "s3:GetObject", "bkt/x");
    get.claims = claims.clone();
    assert!(sys.is_allowed(&get).await);

    let mut put = request(&cred.access_key, "s3:PutObject", "bkt/x");
    put.claims = claims;
    assert!(!sys.is_allowed(&put).await);

    // Without claims the request cannot prove its parentage.
    assert!(!sys.is_allowed(&request(&cred.access_key, "s3:GetObject", "bkt/x")).await);
}

#[tokio::test]
async fn test_sts_claims_must_match_mapping() {
    let (sys, _store) = new_sys().await;

    let mut cred = Credentials::new("TMPKEY3", "temp-secret-key", AccountStatus::Enabled);
    cred.expiration = Some(Utc::now() + chrono::Duration::hours(1));
    sys.set_temp_user("TMPKEY3", cred, "readonly").await.unwrap();

    // No policy claim at all.
    assert!(!sys.is_allowed(&request("TMPKEY3", "s3:GetObject", "bkt/obj")).await);

    // Claimed set differs from the stored mapping.
    let mut widened = request("TMPKEY3", "s3:GetObject", "bkt/obj");
    widened.claims.insert(
        token::OPENID_POLICY_CLAIM.to_string(),
        Value::from("readonly,readwrite"),
    );
    assert!(!sys.is_allowed(&widened).await);

    let mut exact = request("TMPKEY3", "s3:GetObject", "bkt/obj");
    exact
        .claims
        .insert(token::OPENID_POLICY_CLAIM.to_string(), Value::from("readonly"));
    assert!(sys.is_allowed(&exact).await);
}

#[tokio::test]
async fn test_temp_user_mapping_requires_known_policy() {
    let (sys, _store) = new_sys().await;

    let mut cred = Credentials::new("TMPKEY4", "temp-secret-key", AccountStatus::Enabled);
    cred.expiration = Some(Utc::now() + chrono::Duration::hours(1));
    assert!(matches!(
        sys.set_temp_user("TMPKEY4", cred, "no-such-policy").await,
        Err(IamError::NoSuchPolicy)
    ));
}

#[tokio::test]
async fn test_owner_bypasses_policy() {
    let (sys, _store) = new_sys().await;
    let mut args = request("whoever", "admin:ServerInfo", "*");
    args.is_owner = true;
    assert!(sys.is_allowed(&args).await);
}

#[tokio::test]
async fn test_ready_latch_and_listings() {
    let store = IamObjectStore::new(MemObjectStore::new());
    let sys = IamSys::new();
    assert!(!sys.is_ready());

    let locks = Arc::new(LocalNsLock::new());
    let server_cred = Credentials::new("O7ADMIN", SERVER_SECRET, AccountStatus::Enabled);
    let _watcher = sys.init(store, locks, server_cred, false).await.unwrap().unwrap();
    assert!(sys.is_ready());

    // Later loads leave the latch set.
    sys.load_all().await.unwrap();
    assert!(sys.is_ready());

    let policies = sys.list_policies().await.unwrap();
    for name in ["readonly", "writeonly", "readwrite", "consoleAdmin"] {
        assert!(policies.contains_key(name), "default canned policy {name} missing");
    }
    assert!(sys.list_users().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_watcher_converges_peer_projection() {
    // Two IAM systems over the same durable store: a mutation through
    // one becomes visible to the other via change events.
    let objects = MemObjectStore::new();
    let store_a = IamObjectStore::new(objects.clone());
    let store_b = IamObjectStore::new(objects);

    let locks = Arc::new(LocalNsLock::new());
    let server_cred = Credentials::new("O7ADMIN", SERVER_SECRET, AccountStatus::Enabled);

    let sys_a = IamSys::new();
    let _watcher_a = sys_a
        .init(store_a, Arc::clone(&locks) as Arc<dyn o7_core::NsLockService>, server_cred.clone(), false)
        .await
        .unwrap()
        .unwrap();
    let sys_b = IamSys::new();
    let _watcher_b = sys_b.init(store_b, locks, server_cred, false).await.unwrap().unwrap();

    create_user(&sys_a, "alice").await;
    sys_a.policy_db_set("alice", "readonly", false).await.unwrap();

    // Give the peer's watcher a moment to drain the event stream.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(sys_b.get_user("alice").await.is_some());
    assert!(sys_b.is_allowed(&request("alice", "s3:GetObject", "bkt/obj")).await);

    sys_a.delete_user("alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!sys_b.is_allowed(&request("alice", "s3:GetObject", "bkt/obj")).await);
}

#[tokio::test]
async fn test_directory_mode_semantics() {
    let store = IamObjectStore::new(MemObjectStore::new());
    let sys = IamSys::new();
    let locks = Arc::new(LocalNsLock::new());
    let server_cred = Credentials::new("O7ADMIN", SERVER_SECRET, AccountStatus::Enabled);
    let _watcher = sys.init(store.clone(), locks, server_cred, true).await.unwrap().unwrap();

    // Local user management is disabled.
    assert!(matches!(
        sys.create_user("alice", UserInfo::default()).await,
        Err(IamError::ActionNotAllowed)
    ));
    assert!(matches!(
        sys.add_users_to_group("g1", &["alice".to_string()]).await,
        Err(IamError::ActionNotAllowed)
    ));
    assert!(matches!(sys.list_users().await, Err(IamError::ActionNotAllowed)));

    // Directory principals map under the STS kind.
    sys.policy_db_set("uid=alice,ou=people", "readonly", false).await.unwrap();
    assert!(store
        .get_mapped_policy("uid=alice,ou=people", UserType::Sts, false)
        .await
        .is_ok());

    // Clearing the mapping also sweeps the legacy regular-kind record.
    let legacy = o7_iam::MappedPolicy::new("readonly");
    store
        .save_mapped_policy(
            "uid=alice,ou=people",
            UserType::Regular,
            false,
            &legacy,
            o7_iam::SaveOptions::default(),
        )
        .await
        .unwrap();
    sys.policy_db_set("uid=alice,ou=people", "", false).await.unwrap();
    assert!(matches!(
        store.get_mapped_policy("uid=alice,ou=people", UserType::Sts, false).await,
        Err(IamError::NoSuchPolicy)
    ));
    assert!(matches!(
        store
            .get_mapped_policy("uid=alice,ou=people", UserType::Regular, false)
            .await,
        Err(IamError::NoSuchPolicy)
    ));
}
