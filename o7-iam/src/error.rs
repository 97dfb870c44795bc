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

//! IAM error types.

use thiserror::Error;

use o7_core::StoreError;

/// IAM-related errors.
#[derive(Error, Debug)]
pub enum IamError {
    /// IAM subsystem has not finished initializing.
    #[error("Server not initialized, please try again later")]
    ServerNotInitialized,

    /// Invalid or missing argument.
    #[error("Invalid argument")]
    InvalidArgument,

    /// User does not exist.
    #[error("Specified user does not exist")]
    NoSuchUser,

    /// Group does not exist.
    #[error("Specified group does not exist")]
    NoSuchGroup,

    /// Policy does not exist.
    #[error("Specified canned policy does not exist")]
    NoSuchPolicy,

    /// Service account does not exist.
    #[error("Specified service account does not exist")]
    NoSuchServiceAccount,

    /// Group still has members and cannot be deleted.
    #[error("Specified group is not empty - cannot remove it")]
    GroupNotEmpty,

    /// Operation is not allowed for this principal kind or server mode.
    #[error("Specified IAM action is not allowed")]
    ActionNotAllowed,

    /// Embedded session policy exceeds the size cap.
    #[error("Session policy should not exceed 16 KiB characters")]
    PolicyTooLarge,

    /// Secret key fails length validation.
    #[error("Secret key length should be between 8 and 40 characters")]
    InvalidSecretKey,

    /// Stored IAM configuration cannot be decoded; treated as tampering.
    #[error("Unable to decode IAM configuration at {path}")]
    MaliciousData {
        /// Path of the unreadable record.
        path: String,
    },

    /// Session token could not be signed or decoded.
    #[error("Invalid session token")]
    InvalidToken,

    /// Underlying object-layer error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IamError {
    /// Transient errors that the init loops retry with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            IamError::Store(err) => err.is_retriable(),
            _ => false,
        }
    }
}
