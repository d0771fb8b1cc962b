//! Plan execution
//!
//! Runs a rendered plan on a connection (with the state filter attached when
//! the plan reads a snapshot) and streams rows into the assembler.

use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::{debug, warn};

use super::plan::{QueryPlan, TempSet};
use super::render::{render, render_count, RenderedQuery};
use crate::assemble::{Assembler, Record};
use crate::error::IndexResult;
use crate::schema::FieldType;
use crate::store::naming::{qualified, quote_ident};
use crate::store::values::from_sql_value;

/// Executes compiled plans on one connection
pub struct QueryExecutor<'c> {
    conn: &'c Connection,
}

impl<'c> QueryExecutor<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Execute and assemble logical records
    pub fn run(&self, plan: &QueryPlan) -> IndexResult<Vec<Record>> {
        let mut assembler = Assembler::new(plan.roles(), plan.deferred);
        let rows = self.stream(plan, |row| {
            assembler.push(row);
            !assembler.is_done()
        })?;
        let records = assembler.finish();
        debug!(
            rectype = %plan.rectype,
            rows,
            records = records.len(),
            "query executed"
        );
        Ok(records)
    }

    /// Execute and return the physical rows, without regrouping
    pub fn physical_rows(&self, plan: &QueryPlan) -> IndexResult<Vec<Vec<Value>>> {
        let mut out = Vec::new();
        self.stream(plan, |row| {
            out.push(row);
            true
        })?;
        Ok(out)
    }

    /// Number of distinct logical records matching the plan
    pub fn count(&self, plan: &QueryPlan) -> IndexResult<u64> {
        let _sets = TempSetGuard::create(self.conn, &plan.temp_sets)?;
        let RenderedQuery { sql, params } = render_count(plan);
        debug!(sql = %sql, "count");

        let tx = self.conn.unchecked_transaction()?;
        let count: i64 = tx.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        tx.commit()?;
        Ok(count.max(0) as u64)
    }

    /// Run the plan, handing every decoded row to `sink` until it returns
    /// false. Returns the number of rows read.
    fn stream<F>(&self, plan: &QueryPlan, mut sink: F) -> IndexResult<usize>
    where
        F: FnMut(Vec<Value>) -> bool,
    {
        let _sets = TempSetGuard::create(self.conn, &plan.temp_sets)?;
        let RenderedQuery { sql, params } = render(plan);
        debug!(sql = %sql, params = params.len(), "query");

        let types: Vec<Option<FieldType>> = plan.field_types();
        let tx = self.conn.unchecked_transaction()?;
        let mut read = 0usize;
        {
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(types.len());
                for (i, ty) in types.iter().enumerate() {
                    values.push(from_sql_value(*ty, row.get_ref(i)?));
                }
                read += 1;
                if !sink(values) {
                    break;
                }
            }
        }
        tx.commit()?;
        Ok(read)
    }
}

/// Temporary membership tables of one execution; dropped with the guard
struct TempSetGuard<'c> {
    conn: &'c Connection,
    names: Vec<String>,
}

impl<'c> TempSetGuard<'c> {
    fn create(conn: &'c Connection, sets: &[TempSet]) -> IndexResult<Self> {
        let mut guard = Self {
            conn,
            names: Vec::with_capacity(sets.len()),
        };
        for set in sets {
            let table = qualified("temp", &set.name);
            conn.execute_batch(&format!(
                "CREATE TEMP TABLE {} (v PRIMARY KEY)",
                quote_ident(&set.name)
            ))?;
            guard.names.push(set.name.clone());

            let mut insert = conn.prepare(&format!("INSERT OR IGNORE INTO {} (v) VALUES (?1)", table))?;
            for value in &set.values {
                insert.execute([value])?;
            }
        }
        Ok(guard)
    }
}

impl Drop for TempSetGuard<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            let sql = format!("DROP TABLE IF EXISTS {}", qualified("temp", name));
            if let Err(e) = self.conn.execute_batch(&sql) {
                warn!(table = %name, error = %e, "failed to drop temp set");
            }
        }
    }
}
