//! Schema and connection pragmas

use rusqlite::Connection;

use crate::store::StoreOptions;

/// Apply connection pragmas. WAL keeps readers off the writer's back and
/// survives an unclean shutdown of the process.
pub fn configure(conn: &Connection, options: &StoreOptions) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(options.busy_timeout())?;
    Ok(())
}

/// Create every table and index if missing
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(r#"
        -- Subject registry
        CREATE TABLE IF NOT EXISTS subjects (
            subject TEXT PRIMARY KEY,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            latest_version INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            failed_version INTEGER,
            failure_reason TEXT
        );

        -- Current committed prediction, one row per subject
        CREATE TABLE IF NOT EXISTS predictions (
            subject TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            value REAL NOT NULL,
            confidence REAL NOT NULL,
            input_version INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            committed_at TEXT NOT NULL
        );

        -- Committed predictions replaced by a newer commit
        CREATE TABLE IF NOT EXISTS prediction_history (
            attempt_id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            value REAL NOT NULL,
            confidence REAL NOT NULL,
            input_version INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            committed_at TEXT NOT NULL,
            superseded_at TEXT NOT NULL
        );

        -- Computed but not yet committed
        CREATE TABLE IF NOT EXISTS pending_predictions (
            attempt_id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            value REAL NOT NULL,
            confidence REAL NOT NULL,
            input_version INTEGER NOT NULL,
            computed_at TEXT NOT NULL
        );

        -- Attempt ledger; outcome IS NULL while in flight
        CREATE TABLE IF NOT EXISTS ledger (
            attempt_id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            input_version INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            closed_at TEXT,
            outcome TEXT,
            detail TEXT
        );

        -- Realised values for committed predictions
        CREATE TABLE IF NOT EXISTS outcomes (
            subject TEXT NOT NULL,
            input_version INTEGER NOT NULL,
            predicted REAL NOT NULL,
            actual REAL NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (subject, input_version)
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_open ON ledger(outcome, started_at);
        CREATE INDEX IF NOT EXISTS idx_ledger_closed ON ledger(closed_at);
        CREATE INDEX IF NOT EXISTS idx_history_subject ON prediction_history(subject, input_version DESC);
        CREATE INDEX IF NOT EXISTS idx_history_superseded ON prediction_history(superseded_at);
        CREATE INDEX IF NOT EXISTS idx_pending_subject ON pending_predictions(subject);
        CREATE INDEX IF NOT EXISTS idx_subjects_status ON subjects(status);
    "#)?;

    Ok(())
}
