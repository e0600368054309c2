use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

/// Offset added to schema versions before they are stored in `PRAGMA user_version`,
/// so that a database created by some unrelated tool is never mistaken for ours.
pub const BASE_DB_VERSION: usize = 49000;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            #[allow(unused_mut)]
            let mut column = $crate::sqlite_persistence::Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(SqlType::Text),
            "INTEGER" => Some(SqlType::Integer),
            "REAL" => Some(SqlType::Real),
            _ => None,
        }
    }
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// (index name, indexed columns expression)
    pub indices: &'static [(&'static str, &'static str)],
}

impl Table {
    fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let mut def = format!("{} {}", column.name, column.sql_type.as_sql());
                if column.is_primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({});", self.name, columns)
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute(&self.create_sql(), params![])?;
        for (index_name, columns) in self.indices {
            conn.execute(
                &format!("CREATE INDEX {} ON {}({});", index_name, self.name, columns),
                params![],
            )?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        // (name, type, notnull, pk)
        let actual: Vec<(String, String, bool, bool)> = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)? == 1,
                    row.get::<_, i32>(5)? == 1,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual.is_empty() {
            bail!("Table {} does not exist", self.name);
        }
        if actual.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {}. Found: {}",
                self.name,
                actual.len(),
                self.columns.len(),
                actual
                    .iter()
                    .map(|(name, ..)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        for ((name, sql_type, non_null, is_pk), expected) in actual.iter().zip(self.columns) {
            if name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    name
                );
            }
            if SqlType::parse(sql_type).as_ref() != Some(expected.sql_type) {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    sql_type
                );
            }
            if *non_null != expected.non_null || *is_pk != expected.is_primary_key {
                bail!(
                    "Table {} column {} constraint mismatch",
                    self.name,
                    expected.name
                );
            }
        }

        for (index_name, _) in self.indices {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                    params![index_name, self.name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                bail!("Table {} is missing index '{}'", self.name, index_name);
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    /// Migration from the previous version to this one.
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

fn stored_version(conn: &Connection) -> Result<i64> {
    let raw: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(raw - BASE_DB_VERSION as i64)
}

/// Creates the latest schema on an empty connection, or validates and migrates
/// an existing one. `label` is only used for log and error messages.
pub fn prepare_versioned_db(
    conn: &mut Connection,
    schemas: &[VersionedSchema],
    label: &str,
) -> Result<()> {
    let latest = schemas
        .last()
        .with_context(|| format!("No schema defined for {} database", label))?;

    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
        [],
        |row| row.get(0),
    )?;
    if table_count == 0 {
        info!("Creating {} database schema v{}", label, latest.version);
        return latest.create(conn);
    }

    let db_version = stored_version(conn)?;
    let schema = schemas
        .iter()
        .find(|s| s.version as i64 == db_version)
        .with_context(|| format!("Unknown {} database version {}", label, db_version))?;
    schema
        .validate(conn)
        .with_context(|| format!("{} database failed validation at v{}", label, db_version))?;

    if schema.version < latest.version {
        info!(
            "Migrating {} database from v{} to v{}",
            label, schema.version, latest.version
        );
        let tx = conn.transaction()?;
        for next in schemas.iter().filter(|s| s.version > schema.version) {
            if let Some(migration) = next.migration {
                migration(&tx)
                    .with_context(|| format!("Migration to v{} failed", next.version))?;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
            [],
        )?;
        tx.commit()?;
    }
    Ok(())
}

/// Opens (or creates) a SQLite file and brings it to the latest schema version.
pub fn open_versioned_db<P: AsRef<Path>>(
    path: P,
    schemas: &[VersionedSchema],
    label: &str,
) -> Result<Connection> {
    let path = path.as_ref();
    let mut conn = Connection::open(path)
        .with_context(|| format!("Failed to open {} database at {:?}", label, path))?;
    prepare_versioned_db(&mut conn, schemas, label)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEMS_TABLE: Table = Table {
        name: "items",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!("name", &SqlType::Text, non_null = true),
        ],
        indices: &[("idx_items_name", "name")],
    };

    const ITEMS_TABLE_V2: Table = Table {
        name: "items",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!("name", &SqlType::Text, non_null = true),
            sqlite_column!("weight", &SqlType::Real),
        ],
        indices: &[("idx_items_name", "name")],
    };

    fn add_weight(conn: &Connection) -> Result<()> {
        conn.execute("ALTER TABLE items ADD COLUMN weight REAL", [])?;
        Ok(())
    }

    const SCHEMAS_V1: &[VersionedSchema] = &[VersionedSchema {
        version: 1,
        tables: &[ITEMS_TABLE],
        migration: None,
    }];

    const SCHEMAS_V2: &[VersionedSchema] = &[
        VersionedSchema {
            version: 1,
            tables: &[ITEMS_TABLE],
            migration: None,
        },
        VersionedSchema {
            version: 2,
            tables: &[ITEMS_TABLE_V2],
            migration: Some(add_weight),
        },
    ];

    #[test]
    fn test_creates_latest_schema_on_empty_db() {
        let mut conn = Connection::open_in_memory().unwrap();
        prepare_versioned_db(&mut conn, SCHEMAS_V2, "test").unwrap();

        assert_eq!(stored_version(&conn).unwrap(), 2);
        SCHEMAS_V2[1].validate(&conn).unwrap();
    }

    #[test]
    fn test_migrates_older_db() {
        let mut conn = Connection::open_in_memory().unwrap();
        prepare_versioned_db(&mut conn, SCHEMAS_V1, "test").unwrap();
        conn.execute("INSERT INTO items (name) VALUES ('a')", [])
            .unwrap();

        prepare_versioned_db(&mut conn, SCHEMAS_V2, "test").unwrap();

        assert_eq!(stored_version(&conn).unwrap(), 2);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items WHERE weight IS NULL", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_validate_detects_missing_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            [],
        )
        .unwrap();

        let err = SCHEMAS_V1[0].validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing index"));
        assert!(err.contains("idx_items_name"));
    }

    #[test]
    fn test_validate_detects_column_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)", [])
            .unwrap();

        let err = SCHEMAS_V1[0].validate(&conn).unwrap_err().to_string();
        assert!(err.contains("column name mismatch"));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        prepare_versioned_db(&mut conn, SCHEMAS_V2, "test").unwrap();

        let result = prepare_versioned_db(&mut conn, SCHEMAS_V1, "test");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unknown test database version 2"));
    }
}
