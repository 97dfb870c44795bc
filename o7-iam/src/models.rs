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

//! IAM data models.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record format version written into every envelope.
pub const FORMAT_VERSION: i32 = 1;

/// Kind of identity system active on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsersSysType {
    /// Users and groups are managed in the local IAM store.
    Internal,
    /// An external directory service is the source of identity.
    Directory,
}

/// Kind of principal a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserType {
    /// Long-lived user managed through the admin API.
    Regular,
    /// Temporary user created through STS; carries an expiration.
    Sts,
    /// Service account bound to a parent user.
    ServiceAccount,
}

impl Default for UserType {
    fn default() -> Self {
        UserType::Regular
    }
}

/// Account status used by the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Enabled,
    Disabled,
}

/// Credential key status as stored on identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    On,
    Off,
}

impl KeyStatus {
    fn from_account_status(status: AccountStatus) -> Self {
        match status {
            AccountStatus::Enabled => KeyStatus::On,
            AccountStatus::Disabled => KeyStatus::Off,
        }
    }
}

/// Access credentials of a principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessKey")]
    pub access_key: String,

    #[serde(rename = "secretKey", default, skip_serializing_if = "String::is_empty")]
    pub secret_key: String,

    pub status: KeyStatus,

    #[serde(rename = "sessionToken", default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    #[serde(rename = "parentUser", default, skip_serializing_if = "Option::is_none")]
    pub parent_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,

    #[serde(default)]
    pub kind: UserType,
}

impl Credentials {
    /// Long-lived credentials with the given status.
    pub fn new(access_key: &str, secret_key: &str, status: AccountStatus) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            status: KeyStatus::from_account_status(status),
            session_token: None,
            expiration: None,
            parent_user: None,
            groups: None,
            kind: UserType::Regular,
        }
    }

    /// True when the credential has an expiration in the past.
    pub fn is_expired(&self) -> bool {
        match self.expiration {
            Some(at) => at <= Utc::now(),
            None => false,
        }
    }

    /// True for temporary (STS) credentials.
    pub fn is_temp(&self) -> bool {
        self.kind == UserType::Sts
    }

    /// True for service-account credentials.
    pub fn is_service_account(&self) -> bool {
        self.kind == UserType::ServiceAccount
    }

    /// True when the credential is enabled and not expired.
    pub fn is_valid(&self) -> bool {
        self.status == KeyStatus::On && !self.is_expired()
    }

    /// Admin-facing status derived from validity.
    pub fn account_status(&self) -> AccountStatus {
        if self.is_valid() {
            AccountStatus::Enabled
        } else {
            AccountStatus::Disabled
        }
    }

    /// Copy with secret material scrubbed, for listings.
    pub fn scrubbed(&self) -> Self {
        let mut cred = self.clone();
        cred.secret_key = String::new();
        cred.session_token = None;
        cred
    }
}

/// Validates secret key material supplied by callers.
pub fn is_secret_key_valid(secret_key: &str) -> bool {
    (8..=40).contains(&secret_key.len())
}

const ACCESS_KEY_LEN: usize = 20;
const SECRET_KEY_LEN: usize = 40;

const ACCESS_KEY_ALPHABET: [char; 36] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Generates a fresh access/secret key pair.
pub fn generate_credentials() -> (String, String) {
    let access_key = nanoid::nanoid!(ACCESS_KEY_LEN, &ACCESS_KEY_ALPHABET);
    let secret_key = nanoid::nanoid!(SECRET_KEY_LEN);
    (access_key, secret_key)
}

/// Versioned envelope around a credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub version: i32,
    pub credentials: Credentials,
}

impl UserIdentity {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            version: FORMAT_VERSION,
            credentials,
        }
    }
}

/// Group membership record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub version: i32,
    pub status: AccountStatus,
    pub members: Vec<String>,
}

impl GroupInfo {
    /// New group, enabled by default.
    pub fn new(members: Vec<String>) -> Self {
        Self {
            version: FORMAT_VERSION,
            status: AccountStatus::Enabled,
            members,
        }
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

/// A comma-separated list of policy names mapped to a principal or group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappedPolicy {
    #[serde(default = "default_version")]
    pub version: i32,
    #[serde(rename = "policy")]
    pub policies: String,
}

fn default_version() -> i32 {
    FORMAT_VERSION
}

impl MappedPolicy {
    pub fn new(policies: &str) -> Self {
        Self {
            version: FORMAT_VERSION,
            policies: policies.to_string(),
        }
    }

    /// Distinct policy names, order preserved, whitespace trimmed, empties
    /// dropped.
    pub fn to_vec(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.policies
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter(|p| seen.insert(p.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Policy names as a set.
    pub fn policy_set(&self) -> BTreeSet<String> {
        self.to_vec().into_iter().collect()
    }
}

/// Joins policy names back into canonical comma-separated form.
pub fn join_policies<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    names
        .into_iter()
        .filter(|n| !n.as_ref().is_empty())
        .filter(|n| seen.insert(n.as_ref().to_string()))
        .map(|n| n.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Format marker stored at `config/iam/format.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamFormat {
    pub version: i32,
}

impl IamFormat {
    pub fn current() -> Self {
        Self {
            version: FORMAT_VERSION,
        }
    }
}
