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

use std::fmt;

use serde::{Deserialize, Serialize};

/// The decision state of a distributed transaction.
///
/// ```text
/// PREPARE --> COMMIT   --> (concluded)
///        \--> ROLLBACK --> (concluded)
/// ```
///
/// Conclusion removes the record and is not a state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Prepare,
    Commit,
    Rollback,
}

/// The outcome of a legal transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    /// The state moved to the contained decision.
    Changed(TransactionState),
    /// The contained decision had already been taken.
    Unchanged(TransactionState),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("illegal transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TransactionState,
    pub to: TransactionState,
}

impl TransactionState {
    /// Returns true once a commit or rollback decision has been recorded.
    pub fn is_decided(&self) -> bool {
        !matches!(self, TransactionState::Prepare)
    }

    /// Applies the decision `to` to this state.
    ///
    /// Decisions are final: COMMIT can never become ROLLBACK or the reverse, and nothing returns
    /// to PREPARE. Repeating the decision already taken is legal and reported as
    /// [`Transition::Unchanged`].
    pub fn transition(self, to: TransactionState) -> Result<Transition, InvalidTransition> {
        match (self, to) {
            (from, to) if from == to => Ok(Transition::Unchanged(to)),
            (TransactionState::Prepare, TransactionState::Commit)
            | (TransactionState::Prepare, TransactionState::Rollback) => {
                Ok(Transition::Changed(to))
            }
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionState::Prepare => f.write_str("PREPARE"),
            TransactionState::Commit => f.write_str("COMMIT"),
            TransactionState::Rollback => f.write_str("ROLLBACK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_leave_prepare() {
        assert_eq!(
            TransactionState::Prepare.transition(TransactionState::Commit),
            Ok(Transition::Changed(TransactionState::Commit))
        );
        assert_eq!(
            TransactionState::Prepare.transition(TransactionState::Rollback),
            Ok(Transition::Changed(TransactionState::Rollback))
        );
    }

    #[test]
    fn decisions_are_final() {
        assert_eq!(
            TransactionState::Commit.transition(TransactionState::Rollback),
            Err(InvalidTransition {
                from: TransactionState::Commit,
                to: TransactionState::Rollback,
            })
        );
        assert!(TransactionState::Rollback
            .transition(TransactionState::Commit)
            .is_err());
        assert!(TransactionState::Commit
            .transition(TransactionState::Prepare)
            .is_err());
        assert!(TransactionState::Rollback
            .transition(TransactionState::Prepare)
            .is_err());
    }

    #[test]
    fn repeated_decision_is_unchanged() {
        assert_eq!(
            TransactionState::Commit.transition(TransactionState::Commit),
            Ok(Transition::Unchanged(TransactionState::Commit))
        );
        assert_eq!(
            TransactionState::Rollback.transition(TransactionState::Rollback),
            Ok(Transition::Unchanged(TransactionState::Rollback))
        );
    }
}
