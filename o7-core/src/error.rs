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

//! Error types for the object layer.

use thiserror::Error;

/// Errors that can occur in the object layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object not found under the given key.
    #[error("Object not found: {key}")]
    NotFound {
        /// Key that was not found.
        key: String,
    },

    /// The backing container (bucket) for the requested prefix does not
    /// exist yet. Bulk loaders treat this as an empty result set.
    #[error("Backing container not found")]
    ContainerNotFound,

    /// Named lock could not be acquired within its timeout.
    #[error("Timed out acquiring lock: {name}")]
    LockTimeout {
        /// Fully qualified lock name.
        name: String,
    },

    /// IO error from the backing store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient errors that init-time callers retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::LockTimeout { .. })
    }
}
