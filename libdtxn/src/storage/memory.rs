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

use parking_lot::RwLock;

use super::{StorageBackend, StorageError, Table, TableSet, WriteBatch};

/// A backend which keeps every table in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<TableSet>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tables.read().get(table, key).cloned())
    }

    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self.tables.read().scan(table, prefix))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        tables.check(batch.preconditions())?;
        tables.apply(batch.mutations().iter().cloned());
        Ok(())
    }
}
