//! In-memory consolidated store.
//!
//! Tables grow columns as rows mention new names; a column is identified by
//! name only, never by position.

use std::sync::RwLock;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::ipc::{Column, Table, Value};

use super::{DataStore, SIMULATION_NAME_COLUMN, check_arity, lock_error};

#[derive(Default)]
struct StoredTable {
    columns: Vec<Column>,
    index: FxHashMap<String, usize>,
    /// (simulation, values by column index); short rows predate later columns.
    rows: Vec<(String, Vec<Value>)>,
}

impl StoredTable {
    fn column_index(&mut self, name: &str, unit: &Option<String>) -> usize {
        if let Some(&idx) = self.index.get(name) {
            if self.columns[idx].unit.is_none() && unit.is_some() {
                self.columns[idx].unit = unit.clone();
            }
            return idx;
        }
        let idx = self.columns.len();
        self.columns.push(Column::new(name, unit.clone()));
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn value(&self, row: &(String, Vec<Value>), idx: usize) -> Value {
        row.1.get(idx).cloned().unwrap_or(Value::Null)
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<FxHashMap<String, StoredTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.tables.read() {
            Ok(tables) => tables.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Number of rows in a table, zero if absent.
    pub fn row_count(&self, table_name: &str) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(table_name).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }

    /// Project `table_name` onto `field_names`, in that order.
    ///
    /// An empty field list selects `SimulationName` followed by every
    /// column. `SimulationName` may also be requested explicitly.
    pub fn read_table(&self, table_name: &str, field_names: &[String]) -> Result<Table> {
        let tables = self.tables.read().map_err(lock_error)?;
        let stored = tables
            .get(table_name)
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;

        let fields: Vec<String> = if field_names.is_empty() {
            std::iter::once(SIMULATION_NAME_COLUMN.to_string())
                .chain(stored.columns.iter().map(|c| c.name.clone()))
                .collect()
        } else {
            field_names.to_vec()
        };

        // None selects the simulation pseudo-column.
        let mut selected: Vec<(Column, Option<usize>)> = Vec::with_capacity(fields.len());
        for field in &fields {
            match stored.index.get(field) {
                Some(&idx) => selected.push((stored.columns[idx].clone(), Some(idx))),
                None if field == SIMULATION_NAME_COLUMN => {
                    selected.push((Column::new(SIMULATION_NAME_COLUMN, None), None))
                }
                None => {
                    return Err(Error::ColumnNotFound {
                        table: table_name.to_string(),
                        column: field.clone(),
                    });
                }
            }
        }

        let mut table = Table::new(table_name, selected.iter().map(|(c, _)| c.clone()).collect());
        for row in &stored.rows {
            table.rows.push(
                selected
                    .iter()
                    .map(|(_, idx)| match idx {
                        Some(idx) => stored.value(row, *idx),
                        None => Value::Text(row.0.clone()),
                    })
                    .collect(),
            );
        }
        Ok(table)
    }

    /// Every table with all its columns, sorted by name.
    pub fn snapshot(&self) -> Result<Vec<Table>> {
        self.table_names()
            .iter()
            .map(|name| self.read_table(name, &[]))
            .collect()
    }

    /// Drop all rows written by `simulation_name`.
    pub fn remove_simulation(&self, simulation_name: &str) -> Result<()> {
        let mut tables = self.tables.write().map_err(lock_error)?;
        for table in tables.values_mut() {
            table.rows.retain(|(sim, _)| sim != simulation_name);
        }
        Ok(())
    }
}

impl DataStore for MemoryStore {
    fn write_row(
        &self,
        simulation_name: &str,
        table_name: &str,
        column_names: &[String],
        column_units: &[Option<String>],
        values: &[Value],
    ) -> Result<()> {
        check_arity(table_name, column_names, column_units, values)?;

        let mut tables = self.tables.write().map_err(lock_error)?;
        let table = tables.entry(table_name.to_string()).or_default();

        let mut row = vec![Value::Null; table.columns.len()];
        for ((name, unit), value) in column_names.iter().zip(column_units).zip(values) {
            let idx = table.column_index(name, unit);
            if idx >= row.len() {
                row.resize(idx + 1, Value::Null);
            }
            row[idx] = value.clone();
        }
        table.rows.push((simulation_name.to_string(), row));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_columns_matched_by_name() {
        let store = MemoryStore::new();
        store
            .write_row("A", "Report", &names(&["Date", "Yield"]), &[None, None], &[
                Value::Date(20200101),
                Value::Double(1.0),
            ])
            .unwrap();
        store
            .write_row("B", "Report", &names(&["Yield", "Date"]), &[None, None], &[
                Value::Double(2.0),
                Value::Date(20200102),
            ])
            .unwrap();

        let table = store.read_table("Report", &names(&["Date", "Yield"])).unwrap();
        assert_eq!(table.column_names(), vec!["Date", "Yield"]);
        assert_eq!(table.rows[1], vec![Value::Date(20200102), Value::Double(2.0)]);
    }

    #[test]
    fn test_new_columns_backfill_null() {
        let store = MemoryStore::new();
        store
            .write_row("A", "T", &names(&["x"]), &[None], &[Value::Int(1)])
            .unwrap();
        store
            .write_row("A", "T", &names(&["y"]), &[Some("mm".into())], &[Value::Int(2)])
            .unwrap();

        let table = store.read_table("T", &[]).unwrap();
        assert_eq!(table.column_names(), vec!["SimulationName", "x", "y"]);
        assert_eq!(table.columns[2].unit.as_deref(), Some("mm"));
        assert_eq!(table.rows[0], vec![Value::Text("A".into()), Value::Int(1), Value::Null]);
        assert_eq!(table.rows[1], vec![Value::Text("A".into()), Value::Null, Value::Int(2)]);
    }

    #[test]
    fn test_missing_table_and_column() {
        let store = MemoryStore::new();
        assert!(matches!(store.read_table("Nope", &[]), Err(Error::TableNotFound(_))));

        store
            .write_row("A", "T", &names(&["x"]), &[None], &[Value::Int(1)])
            .unwrap();
        assert!(matches!(
            store.read_table("T", &names(&["z"])),
            Err(Error::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_remove_simulation() {
        let store = MemoryStore::new();
        for sim in ["A", "B", "A"] {
            store
                .write_row(sim, "T", &names(&["x"]), &[None], &[Value::Int(1)])
                .unwrap();
        }
        store.remove_simulation("A").unwrap();
        assert_eq!(store.row_count("T"), 1);
    }

    #[test]
    fn test_arity_rejected() {
        let store = MemoryStore::new();
        let err = store
            .write_row("A", "T", &names(&["x", "y"]), &[None], &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Arity { .. }));
        assert_eq!(store.row_count("T"), 0);
    }
}
