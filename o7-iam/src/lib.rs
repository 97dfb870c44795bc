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

//! IAM (Identity and Access Management) core.
//!
//! Maintains the authoritative in-memory projection of users, groups,
//! policies and policy mappings persisted in the object store, evaluates
//! access requests against it, and coordinates mutations so the
//! projection and the durable state agree.

pub mod cache;
pub mod error;
pub mod models;
pub mod paths;
pub mod policy;
pub mod store;
pub mod sys;
pub mod token;
pub mod watch;

pub use error::IamError;
pub use models::{
    AccountStatus, Credentials, GroupInfo, MappedPolicy, UserIdentity, UserType, UsersSysType,
};
pub use policy::{Args, Effect, Policy, Statement};
pub use store::{IamObjectStore, IamStorage, SaveOptions};
pub use sys::{
    ExternalEvaluator, IamSys, NewServiceAccountOpts, UpdateServiceAccountOpts, UserInfo,
};
