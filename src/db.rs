use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, Error as SqliteError, OpenFlags, Transaction};
use tracing::{debug, info};

use crate::backend::{RemoteError, RemoteResult, TabularBackend};
use crate::errors::AppResult;
use crate::records::{RawRow, TableKind};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    info!(
        target: "local_store",
        path = %db_path.display(),
        "local store ready"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 2000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS table_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_table_rows_table ON table_rows(table_name, id);
        "#,
    )?;
    Ok(())
}

/// Tables kept in a local SQLite file, one JSON payload per row.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl LocalStore {
    pub fn open<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<Self> {
        let DatabaseContext { connection, path } = bootstrap(data_dir, database_file)?;
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self, table: TableKind) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM table_rows WHERE table_name = ?1",
            [table.slug()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

impl TabularBackend for LocalStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn read_all(&self, table: TableKind) -> RemoteResult<Vec<RawRow>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM table_rows WHERE table_name = ?1 ORDER BY id ASC")
            .map_err(remote_error)?;
        let payloads = stmt
            .query_map([table.slug()], |row| row.get::<_, String>(0))
            .map_err(remote_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(remote_error)?;

        payloads
            .iter()
            .map(|payload| {
                serde_json::from_str::<RawRow>(payload).map_err(|err| {
                    RemoteError::permanent(format!("corrupt row payload in {table}: {err}"))
                })
            })
            .collect()
    }

    fn append(&self, table: TableKind, row: &RawRow) -> RemoteResult<()> {
        let payload = encode(row)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO table_rows (table_name, payload) VALUES (?1, ?2)",
            params![table.slug(), payload],
        )
        .map_err(remote_error)?;
        Ok(())
    }

    fn clear(&self, table: TableKind) -> RemoteResult<()> {
        let conn = self.db.lock();
        let removed = conn
            .execute("DELETE FROM table_rows WHERE table_name = ?1", [table.slug()])
            .map_err(remote_error)?;
        debug!(target: "local_store", table = %table, removed, "cleared table");
        Ok(())
    }

    fn bulk_write(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()> {
        let payloads = rows.iter().map(encode).collect::<RemoteResult<Vec<_>>>()?;
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(remote_error)?;
        insert_all(&tx, table, &payloads)?;
        tx.commit().map_err(remote_error)?;
        debug!(target: "local_store", table = %table, rows = rows.len(), "bulk wrote table");
        Ok(())
    }

    /// Delete and inserts share one transaction; a failed write keeps the old rows.
    fn replace(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()> {
        let payloads = rows.iter().map(encode).collect::<RemoteResult<Vec<_>>>()?;
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(remote_error)?;
        let removed = tx
            .execute("DELETE FROM table_rows WHERE table_name = ?1", [table.slug()])
            .map_err(remote_error)?;
        insert_all(&tx, table, &payloads)?;
        tx.commit().map_err(remote_error)?;
        debug!(
            target: "local_store",
            table = %table,
            removed,
            rows = rows.len(),
            "replaced table"
        );
        Ok(())
    }
}

fn insert_all(tx: &Transaction<'_>, table: TableKind, payloads: &[String]) -> RemoteResult<()> {
    let mut stmt = tx
        .prepare("INSERT INTO table_rows (table_name, payload) VALUES (?1, ?2)")
        .map_err(remote_error)?;
    for payload in payloads {
        stmt.execute(params![table.slug(), payload])
            .map_err(remote_error)?;
    }
    Ok(())
}

fn encode(row: &RawRow) -> RemoteResult<String> {
    serde_json::to_string(row)
        .map_err(|err| RemoteError::permanent(format!("failed to encode row: {err}")))
}

/// A locked or busy database is the local analogue of a remote quota error.
fn remote_error(err: SqliteError) -> RemoteError {
    match &err {
        SqliteError::SqliteFailure(code, _)
            if matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            RemoteError::transient(err.to_string())
        }
        _ => RemoteError::permanent(err.to_string()),
    }
}
