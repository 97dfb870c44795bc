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

//! IAM change watcher.
//!
//! Peers converge by watching the durable store: every IAM record write
//! or delete produces a change event, which maps to one targeted reload
//! of the in-memory projection. The watcher never terminates the
//! process; failures are logged and the stream continues.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use o7_core::StoreEvent;

use crate::models::UserType;
use crate::paths;
use crate::sys::IamSys;

/// An IAM record change, decoded from a store event path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamEvent {
    Policy(String),
    User(String, UserType),
    Group(String),
    PolicyMapping(String, UserType, bool),
}

/// Decodes a store path into the IAM record it denotes. Paths outside
/// the IAM prefix yield `None`.
pub fn parse_event(path: &str) -> Option<IamEvent> {
    fn dir_name(rest: &str) -> Option<&str> {
        rest.split_once('/').map(|(name, _)| name)
    }
    fn db_name(rest: &str) -> Option<&str> {
        rest.strip_suffix(".json")
    }

    if let Some(rest) = path.strip_prefix(paths::POLICIES_PREFIX) {
        return dir_name(rest).map(|name| IamEvent::Policy(name.to_string()));
    }
    if let Some(rest) = path.strip_prefix(paths::USERS_PREFIX) {
        return dir_name(rest).map(|name| IamEvent::User(name.to_string(), UserType::Regular));
    }
    if let Some(rest) = path.strip_prefix(paths::STS_PREFIX) {
        return dir_name(rest).map(|name| IamEvent::User(name.to_string(), UserType::Sts));
    }
    if let Some(rest) = path.strip_prefix(paths::SERVICE_ACCOUNTS_PREFIX) {
        return dir_name(rest)
            .map(|name| IamEvent::User(name.to_string(), UserType::ServiceAccount));
    }
    if let Some(rest) = path.strip_prefix(paths::GROUPS_PREFIX) {
        return dir_name(rest).map(|name| IamEvent::Group(name.to_string()));
    }
    if let Some(rest) = path.strip_prefix(paths::POLICY_DB_USERS_PREFIX) {
        return db_name(rest)
            .map(|name| IamEvent::PolicyMapping(name.to_string(), UserType::Regular, false));
    }
    if let Some(rest) = path.strip_prefix(paths::POLICY_DB_STS_USERS_PREFIX) {
        return db_name(rest)
            .map(|name| IamEvent::PolicyMapping(name.to_string(), UserType::Sts, false));
    }
    if let Some(rest) = path.strip_prefix(paths::POLICY_DB_SERVICE_ACCOUNTS_PREFIX) {
        return db_name(rest).map(|name| {
            IamEvent::PolicyMapping(name.to_string(), UserType::ServiceAccount, false)
        });
    }
    if let Some(rest) = path.strip_prefix(paths::POLICY_DB_GROUPS_PREFIX) {
        return db_name(rest)
            .map(|name| IamEvent::PolicyMapping(name.to_string(), UserType::Regular, true));
    }
    None
}

/// Spawns the watcher task. It runs until the event stream closes.
pub fn spawn_watcher(
    sys: Arc<IamSys>,
    mut events: broadcast::Receiver<StoreEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped events; the affected records converge on
                    // the next full load.
                    warn!(missed, "IAM watcher lagged behind store events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(iam_event) = parse_event(&event.path) else {
                continue;
            };
            debug!(path = %event.path, removed = event.removed, "IAM change event");
            if let Err(err) = apply_event(&sys, iam_event, event.removed).await {
                warn!(%err, path = %event.path, "failed to apply IAM change event");
            }
        }
    })
}

async fn apply_event(
    sys: &Arc<IamSys>,
    event: IamEvent,
    removed: bool,
) -> Result<(), crate::error::IamError> {
    match event {
        IamEvent::Policy(name) => {
            // `load_policy` drops the entry when the record is gone, so
            // removal and reload take the same path.
            sys.load_policy(&name).await
        }
        IamEvent::User(name, user_type) => {
            if removed {
                sys.forget_user(&name);
                Ok(())
            } else {
                sys.load_user(&name, user_type).await
            }
        }
        IamEvent::Group(name) => sys.load_group(&name).await,
        IamEvent::PolicyMapping(name, user_type, is_group) => {
            sys.load_policy_mapping(&name, user_type, is_group).await
        }
    }
}
