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

//! Durable layout of the IAM configuration.
//!
//! The layout is fixed so stored state stays compatible with external
//! tooling; new record kinds get new directories, existing ones never
//! move.

use crate::models::UserType;

/// IAM configuration directory.
pub const IAM_CONFIG_PREFIX: &str = "config/iam";

/// IAM users directory.
pub const USERS_PREFIX: &str = "config/iam/users/";

/// IAM STS users directory.
pub const STS_PREFIX: &str = "config/iam/sts/";

/// IAM service accounts directory.
pub const SERVICE_ACCOUNTS_PREFIX: &str = "config/iam/service-accounts/";

/// IAM groups directory.
pub const GROUPS_PREFIX: &str = "config/iam/groups/";

/// IAM policies directory.
pub const POLICIES_PREFIX: &str = "config/iam/policies/";

/// IAM policy database directories.
pub const POLICY_DB_USERS_PREFIX: &str = "config/iam/policydb/users/";
pub const POLICY_DB_STS_USERS_PREFIX: &str = "config/iam/policydb/sts-users/";
pub const POLICY_DB_SERVICE_ACCOUNTS_PREFIX: &str = "config/iam/policydb/service-accounts/";
pub const POLICY_DB_GROUPS_PREFIX: &str = "config/iam/policydb/groups/";

const IDENTITY_FILE: &str = "identity.json";
const POLICY_FILE: &str = "policy.json";
const GROUP_MEMBERS_FILE: &str = "members.json";
const FORMAT_FILE: &str = "format.json";

/// Path of the format marker record.
pub fn format_path() -> String {
    format!("{}/{}", IAM_CONFIG_PREFIX, FORMAT_FILE)
}

/// Path of a user identity record.
pub fn user_identity_path(user: &str, user_type: UserType) -> String {
    let base = match user_type {
        UserType::Regular => USERS_PREFIX,
        UserType::Sts => STS_PREFIX,
        UserType::ServiceAccount => SERVICE_ACCOUNTS_PREFIX,
    };
    format!("{}{}/{}", base, user, IDENTITY_FILE)
}

/// Path of a group membership record.
pub fn group_info_path(group: &str) -> String {
    format!("{}{}/{}", GROUPS_PREFIX, group, GROUP_MEMBERS_FILE)
}

/// Path of a canned policy document.
pub fn policy_doc_path(name: &str) -> String {
    format!("{}{}/{}", POLICIES_PREFIX, name, POLICY_FILE)
}

/// Path of a policy mapping record.
pub fn mapped_policy_path(name: &str, user_type: UserType, is_group: bool) -> String {
    if is_group {
        return format!("{}{}.json", POLICY_DB_GROUPS_PREFIX, name);
    }
    let base = match user_type {
        UserType::Regular => POLICY_DB_USERS_PREFIX,
        UserType::Sts => POLICY_DB_STS_USERS_PREFIX,
        UserType::ServiceAccount => POLICY_DB_SERVICE_ACCOUNTS_PREFIX,
    };
    format!("{}{}.json", base, name)
}
