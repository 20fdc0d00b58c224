//! In-memory switch for exercising the forwarding manager without
//! hardware.
//!
//! Enforces the same row rules the switch does: duplicate inserts and
//! writes to missing rows fail, a selector group may only reference
//! existing action members, a member still referenced by a group cannot
//! be deleted, and a VIP binding must point at an existing group.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use steer_bfrt::{Code, FieldValue, KeyTuple, MatchValue, RowError, TableError, TableResult, TableRow, UpdateKind};

use crate::tables::{ACTION_PROFILE, ACTION_SELECTOR, NODE_SELECTOR, SwitchTables, TableFuture};

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Vec<TableRow>>,
    writes: usize,
    failing: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemorySwitch {
    state: Arc<Mutex<State>>,
}

fn reject(table: &str, code: Code, message: String) -> TableError {
    TableError::Batch {
        table: table.to_string(),
        errors: vec![RowError {
            index: 0,
            code,
            message,
        }],
    }
}

fn exact_of(key: &[KeyTuple], name: &str) -> Option<u64> {
    key.iter().find(|k| k.name == name).and_then(|k| match k.value {
        MatchValue::Exact(v) => Some(v),
        _ => None,
    })
}

impl MemorySwitch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of writes attempted so far (inserts, modifies, deletes and
    /// table clears).
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn rows(&self, table: &str) -> Vec<TableRow> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: &[KeyTuple]) -> Option<TableRow> {
        self.lock()
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| r.key == key).cloned())
    }

    /// Make every subsequent write to `table` fail.
    pub fn fail_writes_to(&self, table: &str) {
        self.lock().failing = Some(table.to_string());
    }

    pub fn stop_failing(&self) {
        self.lock().failing = None;
    }

    fn has_row(state: &State, table: &str, key: &[KeyTuple]) -> bool {
        state
            .tables
            .get(table)
            .is_some_and(|rows| rows.iter().any(|r| r.key == key))
    }

    fn check_references(state: &State, row: &TableRow) -> TableResult<()> {
        if row.table == ACTION_SELECTOR {
            let members = match row.data_value("$ACTION_MEMBER_ID") {
                Some(FieldValue::IntArray(ids)) => ids.clone(),
                _ => Vec::new(),
            };
            let status_len = match row.data_value("$ACTION_MEMBER_STATUS") {
                Some(FieldValue::BoolArray(bits)) => bits.len(),
                _ => 0,
            };
            if members.len() != status_len {
                return Err(reject(
                    &row.table,
                    Code::InvalidArgument,
                    format!("{} member ids but {status_len} status bits", members.len()),
                ));
            }
            let max = match row.data_value("$MAX_GROUP_SIZE") {
                Some(FieldValue::Int(max)) => *max as usize,
                _ => usize::MAX,
            };
            if members.len() > max {
                return Err(reject(
                    &row.table,
                    Code::InvalidArgument,
                    format!("{} members exceed group size {max}", members.len()),
                ));
            }
            for id in members {
                let key = vec![KeyTuple::exact("$ACTION_MEMBER_ID", id)];
                if !Self::has_row(state, ACTION_PROFILE, &key) {
                    return Err(reject(
                        &row.table,
                        Code::InvalidArgument,
                        format!("action member {id} does not exist"),
                    ));
                }
            }
        }
        if row.table == NODE_SELECTOR {
            if let Some(FieldValue::Int(group)) = row.data_value("$SELECTOR_GROUP_ID") {
                let key = vec![KeyTuple::exact("$SELECTOR_GROUP_ID", *group)];
                if !Self::has_row(state, ACTION_SELECTOR, &key) {
                    return Err(reject(
                        &row.table,
                        Code::InvalidArgument,
                        format!("selector group {group} does not exist"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn member_in_use(state: &State, key: &[KeyTuple]) -> bool {
        let Some(id) = exact_of(key, "$ACTION_MEMBER_ID") else {
            return false;
        };
        state.tables.get(ACTION_SELECTOR).is_some_and(|groups| {
            groups.iter().any(|g| {
                matches!(g.data_value("$ACTION_MEMBER_ID"),
                    Some(FieldValue::IntArray(ids)) if ids.iter().any(|m| u64::from(*m) == id))
            })
        })
    }

    fn write(&self, kind: UpdateKind, row: &TableRow) -> TableResult<()> {
        let mut state = self.lock();
        state.writes += 1;
        if state.failing.as_deref() == Some(row.table.as_str()) {
            return Err(reject(&row.table, Code::Internal, "injected failure".to_string()));
        }
        let exists = Self::has_row(&state, &row.table, &row.key);
        match kind {
            UpdateKind::Insert if exists => Err(TableError::DuplicateKey {
                table: row.table.clone(),
                key: row.key_display(),
            }),
            UpdateKind::Modify | UpdateKind::Delete if !exists => Err(TableError::NotFound {
                table: row.table.clone(),
                key: row.key_display(),
            }),
            UpdateKind::Insert => {
                Self::check_references(&state, row)?;
                state.tables.entry(row.table.clone()).or_default().push(row.clone());
                Ok(())
            }
            UpdateKind::Modify => {
                Self::check_references(&state, row)?;
                let rows = state.tables.entry(row.table.clone()).or_default();
                if let Some(slot) = rows.iter_mut().find(|r| r.key == row.key) {
                    *slot = row.clone();
                }
                Ok(())
            }
            UpdateKind::Delete => {
                if row.table == ACTION_PROFILE && Self::member_in_use(&state, &row.key) {
                    return Err(reject(
                        &row.table,
                        Code::FailedPrecondition,
                        format!("{} is still referenced by a selector group", row.key_display()),
                    ));
                }
                if let Some(rows) = state.tables.get_mut(&row.table) {
                    rows.retain(|r| r.key != row.key);
                }
                Ok(())
            }
        }
    }

    fn clear_table(&self, table: &str) -> TableResult<()> {
        let mut state = self.lock();
        state.writes += 1;
        if state.failing.as_deref() == Some(table) {
            return Err(reject(table, Code::Internal, "injected failure".to_string()));
        }
        state.tables.remove(table);
        Ok(())
    }
}

impl SwitchTables for MemorySwitch {
    fn apply<'a>(&'a self, kind: UpdateKind, row: &'a TableRow) -> TableFuture<'a, ()> {
        Box::pin(async move { self.write(kind, row) })
    }

    fn clear<'a>(&'a self, table: &'a str) -> TableFuture<'a, ()> {
        Box::pin(async move { self.clear_table(table) })
    }

    fn read<'a>(&'a self, table: &'a str) -> TableFuture<'a, Vec<TableRow>> {
        Box::pin(async move { Ok(self.rows(table)) })
    }
}
