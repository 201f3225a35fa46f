//! Data store contract and its two implementations.
//!
//! - **`MemoryStore`** - the consolidated store jobs are merged into.
//! - **`StorageRedirect`** - the worker-side stand-in that captures a job's
//!   writes so they can travel back inside its `JobOutput`.

mod memory;
mod redirect;

use std::sync::PoisonError;

pub use memory::MemoryStore;
pub use redirect::StorageRedirect;

use crate::error::{Error, Result};
use crate::ipc::{JobOutput, Table, Value};

/// Name of the pseudo-column holding each row's simulation.
pub const SIMULATION_NAME_COLUMN: &str = "SimulationName";

/// Write contract shared by the real store and the redirector.
pub trait DataStore: Send + Sync {
    /// Append one row to `table_name` on behalf of `simulation_name`.
    ///
    /// `column_names`, `column_units` and `values` describe the same columns
    /// in the same order.
    fn write_row(
        &self,
        simulation_name: &str,
        table_name: &str,
        column_names: &[String],
        column_units: &[Option<String>],
        values: &[Value],
    ) -> Result<()>;

    /// Append every row of a whole table.
    fn write_table(&self, table: &Table) -> Result<()> {
        let names: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let units: Vec<Option<String>> = table.columns.iter().map(|c| c.unit.clone()).collect();
        let simulation = table.simulation_name.as_deref().unwrap_or_default();
        for row in &table.rows {
            self.write_row(simulation, &table.table_name, &names, &units, row)?;
        }
        Ok(())
    }
}

/// Reject writes whose names, units and values disagree in length.
pub fn check_arity(
    table_name: &str,
    column_names: &[String],
    column_units: &[Option<String>],
    values: &[Value],
) -> Result<()> {
    if column_names.len() == column_units.len() && column_names.len() == values.len() {
        Ok(())
    } else {
        Err(Error::Arity {
            table: table_name.to_string(),
            names: column_names.len(),
            units: column_units.len(),
            values: values.len(),
        })
    }
}

/// Merge everything a job captured into `store`, returning rows written.
pub fn merge_output(store: &dyn DataStore, output: &JobOutput) -> Result<usize> {
    let mut written = 0;
    for row in &output.report_rows {
        let names: Vec<String> = row.fields.iter().map(|f| f.name.clone()).collect();
        let units: Vec<Option<String>> = row.fields.iter().map(|f| f.unit.clone()).collect();
        let values: Vec<Value> = row.fields.iter().map(|f| f.value.clone()).collect();
        store.write_row(&row.simulation_name, &row.table_name, &names, &units, &values)?;
        written += 1;
    }
    for table in &output.data_tables {
        store.write_table(table)?;
        written += table.rows.len();
    }
    Ok(written)
}

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Io(std::io::Error::other(format!(
        "store lock poisoned (thread panicked): {}",
        e
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Column, Field, Row};

    #[test]
    fn test_arity_check() {
        let names = vec!["a".to_string(), "b".to_string()];
        let units = vec![None, None];
        assert!(check_arity("T", &names, &units, &[Value::Int(1), Value::Int(2)]).is_ok());
        assert!(matches!(
            check_arity("T", &names, &units, &[Value::Int(1)]),
            Err(Error::Arity { values: 1, .. })
        ));
    }

    #[test]
    fn test_merge_output_writes_rows_and_tables() {
        let store = MemoryStore::new();
        let mut table = Table::new("Summary", vec![Column::new("Total", None)]);
        table.simulation_name = Some("Sim".to_string());
        table.rows.push(vec![Value::Double(3.0)]);

        let output = JobOutput {
            job_id: "j".into(),
            error_message: None,
            report_rows: vec![Row {
                simulation_name: "Sim".into(),
                table_name: "Report".into(),
                fields: vec![Field {
                    name: "Yield".into(),
                    unit: Some("kg/ha".into()),
                    value: Value::Double(1.0),
                }],
            }],
            data_tables: vec![table],
        };

        assert_eq!(merge_output(&store, &output).unwrap(), 2);
        assert_eq!(store.row_count("Report"), 1);
        assert_eq!(store.row_count("Summary"), 1);
    }
}
