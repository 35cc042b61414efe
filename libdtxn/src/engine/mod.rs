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

//! The local transaction engine.
//!
//! A local transaction buffers its writes until commit, when they are applied to the data
//! table in one atomic batch. Alternatively the buffered writes can be handed to the redo log
//! by a prepare, after which the transaction no longer exists in the engine.
//!
//! Concurrency control is optimistic. Each written row carries the committed image it was
//! first read with, and the commit batch only applies while every such row is unchanged and not
//! claimed by a prepared transaction. A prepare claims its rows in the row lock table until the
//! transaction is committed or rolled back.

mod options;
pub(crate) mod statement;
pub(crate) mod transaction;
mod tx_engine;

pub use options::{IsolationLevel, TransactionInfo, TxOptions, Workload};
pub use statement::{QueryResult, Row, RowImage, Statement, WriteSet};
pub use tx_engine::{TransitionReport, TxEngine};
