use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

pub const SCALARS_FILE: &str = "scalars.sqlite";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("creating metrics directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("metrics store: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Append-only scalar log for one run, keyed by tag and epoch.
#[derive(Debug)]
pub struct SummaryWriter {
    conn: Connection,
    log_dir: PathBuf,
    path: PathBuf,
}

impl SummaryWriter {
    /// Creates `log_dir` if needed and opens `log_dir/scalars.sqlite`.
    pub fn create(log_dir: &Path) -> Result<Self, MetricsError> {
        fs::create_dir_all(log_dir).map_err(|source| MetricsError::Io {
            path: log_dir.to_path_buf(),
            source,
        })?;
        let path = log_dir.join(SCALARS_FILE);
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scalars (
                tag TEXT NOT NULL,
                step INTEGER NOT NULL,
                value REAL NOT NULL,
                wall_time REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS scalars_tag_step ON scalars (tag, step);",
        )?;
        Ok(Self {
            conn,
            log_dir: log_dir.to_path_buf(),
            path,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&self, tag: &str, value: f64, step: usize) -> Result<(), MetricsError> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.conn.execute(
            "INSERT INTO scalars (tag, step, value, wall_time) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![tag, step as i64, value, wall_time],
        )?;
        Ok(())
    }
}

/// Reads back `(step, value)` pairs for one tag, ordered by step.
pub fn read_scalars(path: &Path, tag: &str) -> Result<Vec<(usize, f64)>, MetricsError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt =
        conn.prepare("SELECT step, value FROM scalars WHERE tag = ?1 ORDER BY step, rowid")?;
    let mut rows = stmt.query(rusqlite::params![tag])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let step: i64 = row.get(0)?;
        out.push((step as usize, row.get(1)?));
    }
    Ok(out)
}
