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

//! Durable bookkeeping for the 2PC (Two-Phase Commit) atomic commitment protocol.
//!
//! Two stores are kept on every node:
//!
//! - The [`MetadataStore`] holds, for each distributed transaction this node coordinates, the
//!   decision state and the immutable list of participants.
//! - The [`RedoLog`] holds, for each local transaction this node prepared as a participant, the
//!   statements needed to finish it once the decision is known.
//!
//! Neither store drives participants; the routing layer reads the decision and calls
//! `CommitPrepared` or `RollbackPrepared` on every participant.

mod metadata;
mod metadata_store;
mod redo;
mod redo_log;
mod state;

pub use metadata::TransactionMetadata;
pub use metadata_store::MetadataStore;
pub use redo::{PreparedTransaction, RedoState};
pub use redo_log::{RedoLog, ResurrectReport};
pub use state::{InvalidTransition, TransactionState, Transition};
