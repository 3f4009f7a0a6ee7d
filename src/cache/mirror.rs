// src/cache/mirror.rs

//! Secondary package mirror
//!
//! After a successful fetch every package is copied into a durable
//! key-value table keyed by `name/version/distro/distro_version/arch`.
//! Writes are best effort; callers log failures and move on.

use crate::error::Result;
use crate::package::Package;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::debug;

/// Durable store fed with every fetched package
pub trait PackageMirror: Send + Sync {
    /// Store every package, replacing entries with the same path
    fn put_packages(&self, packages: &[&Package]) -> Result<()>;

    /// Look up a package by its joined path
    fn get(&self, path: &str) -> Result<Option<Package>>;
}

/// SQLite-backed mirror
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS packages (
                path TEXT PRIMARY KEY,
                record TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of mirrored packages
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl PackageMirror for SqliteMirror {
    fn put_packages(&self, packages: &[&Package]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO packages (path, record) VALUES (?1, ?2)")?;
            for pkg in packages {
                let record = serde_json::to_string(pkg)?;
                stmt.execute(params![pkg.name.path().join("/"), record])?;
            }
        }
        tx.commit()?;

        debug!("Mirrored {} packages", packages.len());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Package>> {
        let conn = self.conn.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM packages WHERE path = ?1",
                [path],
                |row| row.get(0),
            )
            .optional()?;

        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageName;

    #[test]
    fn test_put_and_get() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let pkg = Package::new(PackageName::new("alpine@3.20", "zlib", "1.3.1", "x86_64"));

        mirror.put_packages(&[&pkg]).unwrap();
        mirror.put_packages(&[&pkg]).unwrap();

        assert_eq!(mirror.len().unwrap(), 1);
        let got = mirror.get("zlib/1.3.1/alpine/3.20/x86_64").unwrap();
        assert_eq!(got, Some(pkg));
        assert!(mirror.get("missing").unwrap().is_none());
    }
}
