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

//! Core interfaces of the O7 storage server.
//!
//! This crate defines the seams that the IAM subsystem (and other
//! subsystems) talk through: the keyed object store that persists
//! configuration records, and the named lock service used for
//! cluster-wide coordination.

pub mod error;
pub mod nslock;
pub mod store;

pub use error::StoreError;
pub use nslock::{DynamicTimeout, LocalNsLock, NsLockService};
pub use store::{MemObjectStore, ObjectStore, StoreEvent};
