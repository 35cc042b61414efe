// Copyright 2023 Bitwise IO, Inc.
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

//! Contains TransactionError and ConfigError.

pub use errling::InvalidStateError;

use crate::ids::{CallerId, Dtid};
use crate::storage::StorageError;
use crate::target::ServingRole;
use crate::two_phase_commit::TransactionState;

/// An error which can occur while serving a transaction request.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// A uniqueness constraint was violated, such as creating a dtid which already exists.
    #[error("duplicate entry: {0}")]
    ConstraintViolation(String),

    /// The requested decision conflicts with the decision already recorded for the dtid.
    #[error("could not transition to {to}: {dtid} (CallerID: {caller})")]
    IllegalStateTransition {
        dtid: Dtid,
        caller: CallerId,
        from: TransactionState,
        to: TransactionState,
    },

    /// The referenced transaction does not exist or has already ended.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying storage failed; the request may be retried.
    #[error("storage failure: {0}")]
    TransientStorage(#[source] StorageError),

    /// A transaction timeout or a role-transition watchdog ended the transaction.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The node's serving role does not allow the operation.
    #[error("{operation} not allowed while serving as {role}")]
    NotServing {
        role: ServingRole,
        operation: &'static str,
    },

    /// A row the transaction writes is claimed by a prepared transaction until that one is
    /// resolved.
    #[error("row locked: {0}")]
    RowLocked(String),

    /// A row the transaction writes was changed by another transaction after it was read.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// The request can not be run against the current state of the node.
    #[error("invalid state: {0}")]
    InvalidState(#[from] InvalidStateError),

    /// An unexpected internal failure, such as an undecodable durable record.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransactionError {
    /// Returns true if the caller may retry the request which produced this error.
    ///
    /// Constraint violations, write conflicts and illegal transitions reflect genuine conflicts
    /// and are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransactionError::TransientStorage(_)
                | TransactionError::DeadlineExceeded(_)
                | TransactionError::NotServing { .. }
                | TransactionError::RowLocked(_)
        )
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        TransactionError::InvalidState(InvalidStateError::with_message(message.into()))
    }
}

impl From<StorageError> for TransactionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(_) => TransactionError::TransientStorage(err),
            StorageError::PreconditionFailed { .. } => {
                TransactionError::invalid_state(err.to_string())
            }
            StorageError::Corruption(_) | StorageError::Encoding(_) => {
                TransactionError::Internal(err.to_string())
            }
        }
    }
}

/// An error returned when a [`Config`](crate::Config) fails validation.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub(crate) String);

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn illegal_transition_names_dtid_and_caller() {
        let err = TransactionError::IllegalStateTransition {
            dtid: "aa".into(),
            caller: "dev".into(),
            from: TransactionState::Commit,
            to: TransactionState::Rollback,
        };

        assert_eq!(
            err.to_string(),
            "could not transition to ROLLBACK: aa (CallerID: dev)"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_errors_map_by_kind() {
        let io_err: TransactionError =
            StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk gone")).into();
        assert!(matches!(io_err, TransactionError::TransientStorage(_)));
        assert!(io_err.is_retryable());

        let corrupt: TransactionError = StorageError::Corruption("bad frame".into()).into();
        assert!(matches!(corrupt, TransactionError::Internal(_)));
        assert!(!corrupt.is_retryable());

        assert!(!TransactionError::ConstraintViolation("aa".into()).is_retryable());
        assert!(TransactionError::DeadlineExceeded("tx 1".into()).is_retryable());
        assert!(TransactionError::RowLocked("t/1".into()).is_retryable());
        assert!(!TransactionError::WriteConflict("t/1".into()).is_retryable());
    }

    #[test]
    fn invalid_state_wraps_errling_error() {
        let err: TransactionError =
            InvalidStateError::with_message("transaction 1 is prepared".into()).into();

        assert_eq!(err.to_string(), "invalid state: transaction 1 is prepared");
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_retryable());
    }
}
