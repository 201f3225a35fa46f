//! Worker-side store that captures writes instead of persisting them.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::ipc::{Field, Row, Table, Value};

use super::{DataStore, check_arity, lock_error};

#[derive(Default)]
struct Captured {
    /// Rows keyed by (simulation, table).
    rows: FxHashMap<(String, String), Vec<Row>>,
    /// Keys in first-write order, so draining is deterministic.
    order: Vec<(String, String)>,
    tables: Vec<Table>,
}

/// Drop-in [`DataStore`] that buffers a job's output in memory.
///
/// Only the structural shape of each write is checked; reconciling table
/// shapes is left to the real store at merge time.
#[derive(Default)]
pub struct StorageRedirect {
    captured: Mutex<Captured>,
}

impl StorageRedirect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows captured so far, across rows and whole tables.
    pub fn len(&self) -> usize {
        self.captured
            .lock()
            .map(|c| c.rows.values().map(Vec::len).sum::<usize>() + c.tables.iter().map(|t| t.rows.len()).sum::<usize>())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything captured, leaving the buffer empty.
    pub fn drain(&self) -> Result<(Vec<Row>, Vec<Table>)> {
        let mut captured = self.captured.lock().map_err(lock_error)?;
        let Captured { mut rows, order, tables } = std::mem::take(&mut *captured);
        let report_rows = order
            .into_iter()
            .filter_map(|key| rows.remove(&key))
            .flatten()
            .collect();
        Ok((report_rows, tables))
    }
}

impl DataStore for StorageRedirect {
    fn write_row(
        &self,
        simulation_name: &str,
        table_name: &str,
        column_names: &[String],
        column_units: &[Option<String>],
        values: &[Value],
    ) -> Result<()> {
        check_arity(table_name, column_names, column_units, values)?;

        let fields = column_names
            .iter()
            .zip(column_units)
            .zip(values)
            .map(|((name, unit), value)| Field {
                name: name.clone(),
                unit: unit.clone(),
                value: value.clone(),
            })
            .collect();

        let mut captured = self.captured.lock().map_err(lock_error)?;
        let key = (simulation_name.to_string(), table_name.to_string());
        if !captured.rows.contains_key(&key) {
            captured.order.push(key.clone());
        }
        captured.rows.entry(key).or_default().push(Row {
            simulation_name: simulation_name.to_string(),
            table_name: table_name.to_string(),
            fields,
        });
        Ok(())
    }

    fn write_table(&self, table: &Table) -> Result<()> {
        for row in &table.rows {
            if row.len() != table.columns.len() {
                return Err(crate::error::Error::Arity {
                    table: table.table_name.clone(),
                    names: table.columns.len(),
                    units: table.columns.len(),
                    values: row.len(),
                });
            }
        }
        let mut captured = self.captured.lock().map_err(lock_error)?;
        captured.tables.push(table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ipc::Column;

    #[test]
    fn test_rows_grouped_by_simulation_and_table() {
        let redirect = StorageRedirect::new();
        let names = vec!["x".to_string()];
        let units = vec![None];
        redirect.write_row("A", "T1", &names, &units, &[Value::Int(1)]).unwrap();
        redirect.write_row("B", "T1", &names, &units, &[Value::Int(2)]).unwrap();
        redirect.write_row("A", "T1", &names, &units, &[Value::Int(3)]).unwrap();
        assert_eq!(redirect.len(), 3);

        let (rows, tables) = redirect.drain().unwrap();
        assert!(tables.is_empty());
        let order: Vec<(&str, &Value)> = rows
            .iter()
            .map(|r| (r.simulation_name.as_str(), &r.fields[0].value))
            .collect();
        assert_eq!(order, vec![
            ("A", &Value::Int(1)),
            ("A", &Value::Int(3)),
            ("B", &Value::Int(2)),
        ]);
        assert!(redirect.is_empty());
    }

    #[test]
    fn test_whole_tables_captured() {
        let redirect = StorageRedirect::new();
        let mut table = Table::new("Summary", vec![Column::new("n", None)]);
        table.rows.push(vec![Value::Int(1)]);
        redirect.write_table(&table).unwrap();

        table.rows.push(vec![]);
        assert!(matches!(redirect.write_table(&table), Err(Error::Arity { .. })));

        let (_, tables) = redirect.drain().unwrap();
        assert_eq!(tables.len(), 1);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let redirect = StorageRedirect::new();
        let err = redirect
            .write_row("A", "T", &["x".to_string()], &[], &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Arity { units: 0, .. }));
    }
}
