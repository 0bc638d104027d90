//! Persisted scalar counters: the store's resumable state.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Keys in the variables table. Numeric ids are part of the durable format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Variable {
    /// Next logical activation cycle.
    MaxCycle = 1,
    /// Live node count.
    NodeCount = 2,
    /// Live edge count.
    EdgeCount = 3,
    /// Activation edge budget at store creation.
    ActThreshold = 4,
    /// Activation model tag at store creation.
    ActMode = 5,
}

pub(crate) fn get(conn: &Connection, variable: Variable) -> Result<Option<i64>> {
    let value = conn
        .query_row(
            "SELECT variable_value FROM ltm_variables WHERE variable_id=?1",
            params![variable as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn set(conn: &Connection, variable: Variable, value: i64) -> Result<()> {
    conn.execute(
        "UPDATE ltm_variables SET variable_value=?1 WHERE variable_id=?2",
        params![value, variable as i64],
    )?;
    Ok(())
}

pub(crate) fn create(conn: &Connection, variable: Variable, value: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ltm_variables (variable_id, variable_value) VALUES (?1, ?2)",
        params![variable as i64, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    #[test]
    fn create_set_get() {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_structure(&conn).unwrap();

        assert_eq!(get(&conn, Variable::MaxCycle).unwrap(), None);
        create(&conn, Variable::MaxCycle, 1).unwrap();
        assert_eq!(get(&conn, Variable::MaxCycle).unwrap(), Some(1));
        set(&conn, Variable::MaxCycle, 42).unwrap();
        assert_eq!(get(&conn, Variable::MaxCycle).unwrap(), Some(42));
    }
}
