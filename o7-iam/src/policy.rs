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

//! Policy documents and request evaluation.
//!
//! Documents follow the AWS policy JSON shape (`Version`, `Statement`,
//! `Effect`, `Action`, `Resource`). Evaluation is deny-overrides: an
//! explicit Deny beats any Allow, and no matching statement means deny.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IamError;

/// Default policy language version.
pub const DEFAULT_POLICY_VERSION: &str = "2012-10-17";

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// A single policy statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Effect")]
    pub effect: Effect,

    #[serde(rename = "Action", with = "one_or_many")]
    pub actions: Vec<String>,

    #[serde(rename = "Resource", with = "one_or_many")]
    pub resources: Vec<String>,
}

impl Statement {
    /// New allow statement.
    pub fn allow(actions: &[&str], resources: &[&str]) -> Self {
        Self {
            effect: Effect::Allow,
            actions: actions.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn matches(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|p| wildcard_match(p, action))
            && self.resources.iter().any(|p| wildcard_match(p, resource))
    }
}

/// A named policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "Version", default)]
    pub version: String,

    #[serde(rename = "Statement", default)]
    pub statements: Vec<Statement>,
}

impl Policy {
    /// New document with the default version string.
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            version: DEFAULT_POLICY_VERSION.to_string(),
            statements,
        }
    }

    /// True when the document carries no statements.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Checks structural validity: a version string and non-degenerate
    /// statements.
    pub fn validate(&self) -> Result<(), IamError> {
        if self.version.is_empty() {
            return Err(IamError::InvalidArgument);
        }
        for statement in &self.statements {
            if statement.actions.is_empty() || statement.resources.is_empty() {
                return Err(IamError::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Parses a document from JSON and validates it.
    pub fn parse(data: &[u8]) -> Result<Self, IamError> {
        let policy: Policy = serde_json::from_slice(data)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Evaluates the request against this document.
    pub fn is_allowed(&self, args: &Args) -> bool {
        for statement in &self.statements {
            if statement.effect == Effect::Deny && statement.matches(&args.action, &args.resource) {
                return false;
            }
        }
        self.statements
            .iter()
            .any(|s| s.effect == Effect::Allow && s.matches(&args.action, &args.resource))
    }

    /// Merges another document's statements into this one.
    ///
    /// Statement order is irrelevant to evaluation, so merging is
    /// commutative.
    pub fn merge(mut self, other: Policy) -> Policy {
        if self.version.is_empty() {
            self.version = other.version.clone();
        }
        self.statements.extend(other.statements);
        self
    }
}

/// Combines policy documents into one synthetic document.
pub fn combine(policies: Vec<Policy>) -> Policy {
    policies.into_iter().fold(Policy::default(), Policy::merge)
}

/// An access request under evaluation.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Access key of the requesting account.
    pub account_name: String,
    /// Action requested, e.g. `s3:GetObject`.
    pub action: String,
    /// Resource the action targets, e.g. `bkt/obj`.
    pub resource: String,
    /// Groups presented with the request.
    pub groups: Vec<String>,
    /// Session token claims, when authenticated via a token.
    pub claims: HashMap<String, Value>,
    /// True when the account is the server owner; owners bypass policy.
    pub is_owner: bool,
}

impl Args {
    /// Reads a comma-separated policy-name claim as a set of names.
    ///
    /// Returns `None` when the claim is absent or not a string.
    pub fn get_policies(&self, claim: &str) -> Option<std::collections::BTreeSet<String>> {
        let raw = self.claims.get(claim)?.as_str()?;
        Some(crate::models::MappedPolicy::new(raw).policy_set())
    }
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    // Classic two-pointer glob with backtracking over the last `*`.
    let (mut pi, mut ni) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Installs the default canned policies for any of the well-known names
/// that are not already present.
pub fn set_default_canned_policies(policies: &mut HashMap<String, Policy>) {
    let defaults = [
        (
            "readonly",
            Policy::new(vec![Statement::allow(
                &["s3:GetBucketLocation", "s3:GetObject"],
                &["*"],
            )]),
        ),
        (
            "writeonly",
            Policy::new(vec![Statement::allow(&["s3:PutObject"], &["*"])]),
        ),
        (
            "readwrite",
            Policy::new(vec![Statement::allow(&["s3:*"], &["*"])]),
        ),
        (
            "consoleAdmin",
            Policy::new(vec![Statement::allow(&["admin:*", "s3:*", "sts:*"], &["*"])]),
        ),
    ];
    for (name, policy) in defaults {
        policies.entry(name.to_string()).or_insert(policy);
    }
}

mod one_or_many {
    //! Accepts a single string or an array of strings on deserialize;
    //! always serializes as an array.

    use serde::de::{Deserialize, Deserializer};
    use serde::ser::Serializer;

    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        })
    }

    pub fn serialize<S>(values: &[String], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(action: &str, resource: &str) -> Args {
        Args {
            account_name: "alice".to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("s3:*", "s3:GetObject"));
        assert!(!wildcard_match("s3:*", "admin:ServerInfo"));
        assert!(wildcard_match("bkt/*", "bkt/a/b/c"));
        assert!(!wildcard_match("bkt/*", "other/a"));
        assert!(wildcard_match("s3:Get?bject", "s3:GetObject"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
    }

    #[test]
    fn test_allow_and_default_deny() {
        let policy = Policy::new(vec![Statement::allow(&["s3:GetObject"], &["bkt/*"])]);
        assert!(policy.is_allowed(&args("s3:GetObject", "bkt/obj")));
        assert!(!policy.is_allowed(&args("s3:PutObject", "bkt/obj")));
        assert!(!policy.is_allowed(&args("s3:GetObject", "other/obj")));
    }

    #[test]
    fn test_deny_overrides_allow() {
        let policy = Policy::new(vec![
            Statement::allow(&["s3:*"], &["*"]),
            Statement {
                effect: Effect::Deny,
                actions: vec!["s3:DeleteObject".to_string()],
                resources: vec!["*".to_string()],
            },
        ]);
        assert!(policy.is_allowed(&args("s3:GetObject", "bkt/obj")));
        assert!(!policy.is_allowed(&args("s3:DeleteObject", "bkt/obj")));
    }

    #[test]
    fn test_combine_is_order_insensitive() {
        let read = Policy::new(vec![Statement::allow(&["s3:GetObject"], &["*"])]);
        let write = Policy::new(vec![Statement::allow(&["s3:PutObject"], &["*"])]);

        let ab = combine(vec![read.clone(), write.clone()]);
        let ba = combine(vec![write, read]);
        for request in [args("s3:GetObject", "bkt/x"), args("s3:PutObject", "bkt/x")] {
            assert_eq!(ab.is_allowed(&request), ba.is_allowed(&request));
            assert!(ab.is_allowed(&request));
        }
    }

    #[test]
    fn test_parse_single_string_action() {
        let raw = br#"{
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Allow", "Action": "s3:GetObject", "Resource": "bkt/*"}
            ]
        }"#;
        let policy = Policy::parse(raw).unwrap();
        assert_eq!(policy.statements[0].actions, vec!["s3:GetObject"]);
        assert!(policy.is_allowed(&args("s3:GetObject", "bkt/obj")));
    }

    #[test]
    fn test_parse_rejects_missing_version() {
        let raw = br#"{"Statement": [{"Effect": "Allow", "Action": ["*"], "Resource": ["*"]}]}"#;
        assert!(matches!(Policy::parse(raw), Err(IamError::InvalidArgument)));
    }

    #[test]
    fn test_default_canned_policies() {
        let mut policies = HashMap::new();
        set_default_canned_policies(&mut policies);
        for name in ["readonly", "writeonly", "readwrite", "consoleAdmin"] {
            assert!(policies.contains_key(name), "missing {name}");
        }

        assert!(policies["readonly"].is_allowed(&args("s3:GetObject", "bkt/obj")));
        assert!(!policies["readonly"].is_allowed(&args("s3:PutObject", "bkt/obj")));
        assert!(policies["writeonly"].is_allowed(&args("s3:PutObject", "bkt/obj")));
        assert!(policies["readwrite"].is_allowed(&args("s3:DeleteObject", "bkt/obj")));

        // Existing entries are not overwritten.
        let custom = Policy::new(vec![Statement::allow(&["s3:ListBucket"], &["*"])]);
        let mut policies = HashMap::from([("readonly".to_string(), custom)]);
        set_default_canned_policies(&mut policies);
        assert!(!policies["readonly"].is_allowed(&args("s3:GetObject", "bkt/obj")));
    }
}
