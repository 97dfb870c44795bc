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

//! In-memory projection of the IAM state.
//!
//! All fields are guarded by one mutex owned by `IamSys`. The guard must
//! never be held across a store call; snapshot what the store needs,
//! release, then go to the store.

use std::collections::{BTreeSet, HashMap};

use crate::error::IamError;
use crate::models::{Credentials, GroupInfo, MappedPolicy, UsersSysType};
use crate::policy::{self, Policy};

/// The five authoritative maps plus the derived user→groups index.
#[derive(Default)]
pub struct IamCache {
    /// Policy name → policy document.
    pub policy_docs: HashMap<String, Policy>,
    /// Access key → credentials, all principal kinds merged.
    pub users: HashMap<String, Credentials>,
    /// Group name → group info.
    pub groups: HashMap<String, GroupInfo>,
    /// User name → mapped policy.
    pub user_policies: HashMap<String, MappedPolicy>,
    /// Group name → mapped policy.
    pub group_policies: HashMap<String, MappedPolicy>,
    /// User name → groups the user is a member of. Derived; rebuilt from
    /// `groups` whenever membership changes.
    pub user_group_memberships: HashMap<String, BTreeSet<String>>,
}

impl IamCache {
    /// Rebuilds the whole reverse index from group membership.
    pub fn build_user_group_memberships(&mut self) {
        self.user_group_memberships.clear();
        let groups: Vec<(String, GroupInfo)> =
            self.groups.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (group, gi) in groups {
            self.update_group_memberships(&group, &gi);
        }
    }

    /// Adds `group` to every member's membership set.
    pub fn update_group_memberships(&mut self, group: &str, gi: &GroupInfo) {
        for member in &gi.members {
            self.user_group_memberships
                .entry(member.clone())
                .or_default()
                .insert(group.to_string());
        }
    }

    /// Removes `group` from every member's membership set.
    ///
    /// Reflecting a membership delta is always this removal followed by
    /// `update_group_memberships` with the new group info, in that order.
    pub fn remove_group_from_memberships(&mut self, group: &str) {
        for groups in self.user_group_memberships.values_mut() {
            groups.remove(group);
        }
        self.user_group_memberships.retain(|_, groups| !groups.is_empty());
    }

    /// Drops a group and its mapping from every map.
    pub fn remove_group(&mut self, group: &str) {
        self.remove_group_from_memberships(group);
        self.groups.remove(group);
        self.group_policies.remove(group);
    }

    /// Policy names effective for a user or group.
    ///
    /// For a group: the group must exist in internal mode; a disabled
    /// group contributes nothing (deny-by-no-policy). For a user: the
    /// user must exist and be valid in internal mode; the mapping is
    /// resolved by name, falling back to the credential's parent user,
    /// and the mappings of every enabled group the user belongs to are
    /// appended.
    pub fn policy_db_get(
        &self,
        name: &str,
        is_group: bool,
        sys_type: UsersSysType,
    ) -> Result<Vec<String>, IamError> {
        if is_group {
            if sys_type == UsersSysType::Internal {
                let gi = self.groups.get(name).ok_or(IamError::NoSuchGroup)?;
                if gi.status == crate::models::AccountStatus::Disabled {
                    return Ok(Vec::new());
                }
            }
            return Ok(self
                .group_policies
                .get(name)
                .map(MappedPolicy::to_vec)
                .unwrap_or_default());
        }

        let mut parent_user = None;
        if sys_type == UsersSysType::Internal {
            let cred = self.users.get(name).ok_or(IamError::NoSuchUser)?;
            if !cred.is_valid() {
                return Ok(Vec::new());
            }
            parent_user = cred.parent_user.clone();
        }

        let mapping = self.user_policies.get(name).or_else(|| {
            parent_user.as_deref().and_then(|parent| self.user_policies.get(parent))
        });

        let mut policies: Vec<String> =
            mapping.map(MappedPolicy::to_vec).unwrap_or_default();

        if let Some(groups) = self.user_group_memberships.get(name) {
            for group in groups {
                let enabled = self
                    .groups
                    .get(group)
                    .map(|gi| gi.status == crate::models::AccountStatus::Enabled)
                    .unwrap_or(false);
                if !enabled {
                    continue;
                }
                if let Some(mp) = self.group_policies.get(group) {
                    policies.extend(mp.to_vec());
                }
            }
        }

        Ok(policies)
    }

    /// Combines the named policy documents into one synthetic document.
    /// Missing names contribute nothing.
    pub fn combined_policy<I, S>(&self, names: I) -> Policy
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let docs: Vec<Policy> = names
            .into_iter()
            .filter_map(|name| self.policy_docs.get(name.as_ref()).cloned())
            .collect();
        policy::combine(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountStatus;

    fn cache_with_group(group: &str, members: &[&str]) -> IamCache {
        let mut cache = IamCache::default();
        let gi = GroupInfo::new(members.iter().map(|m| m.to_string()).collect());
        cache.groups.insert(group.to_string(), gi.clone());
        cache.update_group_memberships(group, &gi);
        cache
    }

    #[test]
    fn test_reverse_index_is_transpose() {
        let mut cache = cache_with_group("g1", &["alice", "bob"]);
        let gi2 = GroupInfo::new(vec!["bob".to_string()]);
        cache.groups.insert("g2".to_string(), gi2.clone());
        cache.update_group_memberships("g2", &gi2);

        assert_eq!(
            cache.user_group_memberships["bob"],
            BTreeSet::from(["g1".to_string(), "g2".to_string()])
        );
        assert_eq!(
            cache.user_group_memberships["alice"],
            BTreeSet::from(["g1".to_string()])
        );
    }

    #[test]
    fn test_membership_delta_two_step() {
        let mut cache = cache_with_group("g1", &["alice", "bob"]);

        // bob leaves g1: remove then re-add with the new membership.
        let gi = GroupInfo::new(vec!["alice".to_string()]);
        cache.remove_group_from_memberships("g1");
        cache.update_group_memberships("g1", &gi);
        cache.groups.insert("g1".to_string(), gi);

        assert!(cache.user_group_memberships.get("bob").is_none());
        assert!(cache.user_group_memberships["alice"].contains("g1"));
    }

    #[test]
    fn test_policy_db_get_disabled_group_is_empty() {
        let mut cache = cache_with_group("g1", &["bob"]);
        cache
            .group_policies
            .insert("g1".to_string(), MappedPolicy::new("readwrite"));

        let names = cache.policy_db_get("g1", true, UsersSysType::Internal).unwrap();
        assert_eq!(names, vec!["readwrite".to_string()]);

        cache.groups.get_mut("g1").unwrap().status = AccountStatus::Disabled;
        let names = cache.policy_db_get("g1", true, UsersSysType::Internal).unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn test_policy_db_get_falls_back_to_parent_mapping() {
        let mut cache = IamCache::default();
        let mut svc = Credentials::new("SVC", "secret123", AccountStatus::Enabled);
        svc.parent_user = Some("alice".to_string());
        cache.users.insert("SVC".to_string(), svc);
        cache
            .users
            .insert("alice".to_string(), Credentials::new("alice", "secret123", AccountStatus::Enabled));
        cache
            .user_policies
            .insert("alice".to_string(), MappedPolicy::new("readonly"));

        let names = cache.policy_db_get("SVC", false, UsersSysType::Internal).unwrap();
        assert_eq!(names, vec!["readonly".to_string()]);
    }

    #[test]
    fn test_policy_db_get_unknown_user() {
        let cache = IamCache::default();
        assert!(matches!(
            cache.policy_db_get("ghost", false, UsersSysType::Internal),
            Err(IamError::NoSuchUser)
        ));
        // Directory mode skips the existence check.
        assert!(cache
            .policy_db_get("ghost", false, UsersSysType::Directory)
            .unwrap()
            .is_empty());
    }
}
