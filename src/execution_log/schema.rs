//! SQLite schema for the execution log database.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job runs
// =============================================================================

const JOB_RUNS_TABLE_V1: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_name", &SqlType::Text, non_null = true),
        sqlite_column!("request_id", &SqlType::Text),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
        // JSON object of string params
        sqlite_column!("params", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_runs_job_started", "job_name, started_at DESC"),
        ("idx_job_runs_status", "status"),
    ],
};

pub const EXECUTION_LOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOB_RUNS_TABLE_V1],
    migration: None,
}];
