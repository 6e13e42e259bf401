//! Typed queries implementing [`Backend`] for the SQLite [`Database`].

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::backend::Backend;
use crate::digest::Digest;
use crate::errors::DatabaseError;
use crate::models::{Branch, BranchStatus, DependencyEdge, MergeOperation, ObjectKind};

/// A raw row from the `branches` table.
#[derive(Debug, Clone)]
struct BranchRow {
    name: String,
    head: String,
    parent_branch: Option<String>,
    created_from: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl BranchRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            head: row.get(1)?,
            parent_branch: row.get(2)?,
            created_from: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_branch(self) -> Result<Branch, DatabaseError> {
        let status = BranchStatus::from_str_val(&self.status).ok_or_else(|| {
            invalid_row("branch", &self.name, format!("unknown status '{}'", self.status))
        })?;
        Ok(Branch {
            head: parse_digest("branch", &self.name, &self.head)?,
            created_from: parse_digest("branch", &self.name, &self.created_from)?,
            created_at: parse_datetime("branch", &self.name, &self.created_at)?,
            updated_at: parse_datetime("branch", &self.name, &self.updated_at)?,
            parent_branch: self.parent_branch,
            status,
            name: self.name,
        })
    }
}

const BRANCH_COLUMNS: &str =
    "name, head, parent_branch, created_from, status, created_at, updated_at";

fn object_table(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Blob => "blobs",
        ObjectKind::Tree => "trees",
        ObjectKind::Commit => "commits",
    }
}

impl Backend for Database {
    // -- objects ------------------------------------------------------------

    fn put_object(
        &self,
        kind: ObjectKind,
        digest: &Digest,
        body: &[u8],
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (digest, body, created_at) VALUES (?1, ?2, ?3)",
                object_table(kind)
            ),
            params![digest.to_hex(), body, now],
        )?;
        if changed > 0 {
            debug!(%kind, digest = %digest.short(), bytes = body.len(), "stored object");
        }
        Ok(changed > 0)
    }

    fn get_object(
        &self,
        kind: ObjectKind,
        digest: &Digest,
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        let conn = self.conn();
        let body = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE digest = ?1", object_table(kind)),
                params![digest.to_hex()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(body)
    }

    fn has_object(&self, kind: ObjectKind, digest: &Digest) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE digest = ?1", object_table(kind)),
            params![digest.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn count_objects(&self, kind: ObjectKind) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", object_table(kind)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -- branches -----------------------------------------------------------

    fn insert_branch(&self, branch: &Branch) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT INTO branches (name, head, parent_branch, created_from, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                head = excluded.head,
                parent_branch = excluded.parent_branch,
                created_from = excluded.created_from,
                status = excluded.status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
             WHERE branches.status = 'deleted'",
            params![
                branch.name,
                branch.head.to_hex(),
                branch.parent_branch,
                branch.created_from.to_hex(),
                branch.status.as_str(),
                branch.created_at.to_rfc3339(),
                branch.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(name = %branch.name, inserted = changed > 0, "insert branch");
        Ok(changed > 0)
    }

    fn get_branch(&self, name: &str) -> Result<Option<Branch>, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE name = ?1"),
                params![name],
                BranchRow::from_row,
            )
            .optional()?;
        row.map(BranchRow::into_branch).transpose()
    }

    fn list_branches(&self) -> Result<Vec<Branch>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches ORDER BY name"
        ))?;
        let rows = stmt
            .query_map([], BranchRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(BranchRow::into_branch).collect()
    }

    fn update_branch_head(
        &self,
        name: &str,
        expected: &Digest,
        new_head: &Digest,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE branches SET head = ?1, updated_at = ?2
             WHERE name = ?3 AND head = ?4 AND status != 'deleted'",
            params![new_head.to_hex(), at.to_rfc3339(), name, expected.to_hex()],
        )?;
        Ok(changed == 1)
    }

    fn set_branch_status(
        &self,
        name: &str,
        expected: BranchStatus,
        head: &Digest,
        status: BranchStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE branches SET status = ?1, updated_at = ?2
             WHERE name = ?3 AND status = ?4 AND head = ?5",
            params![
                status.as_str(),
                at.to_rfc3339(),
                name,
                expected.as_str(),
                head.to_hex(),
            ],
        )?;
        Ok(changed == 1)
    }

    // -- merge_operations ---------------------------------------------------

    fn append_merge_operation(&self, op: &MergeOperation) -> Result<(), DatabaseError> {
        let body = serde_json::to_string(op)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO merge_operations (id, source, target, strategy, status, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                op.id,
                op.source,
                op.target,
                op.strategy.as_str(),
                op.status.as_str(),
                body,
                op.created_at.to_rfc3339(),
            ],
        )?;
        debug!(id = %op.id, status = %op.status, "appended merge operation");
        Ok(())
    }

    fn get_merge_operation(&self, id: &str) -> Result<Option<MergeOperation>, DatabaseError> {
        let conn = self.conn();
        let body = conn
            .query_row(
                "SELECT body FROM merge_operations WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match body {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_merge_operations(&self, limit: usize) -> Result<Vec<MergeOperation>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT body FROM merge_operations ORDER BY seq DESC LIMIT ?1")?;
        let bodies = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|json| serde_json::from_str(json).map_err(DatabaseError::from))
            .collect()
    }

    // -- dependencies -------------------------------------------------------

    fn insert_dependency(&self, edge: &DependencyEdge) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO dependencies (object, depends_on, created_at) VALUES (?1, ?2, ?3)",
            params![edge.object.to_hex(), edge.depends_on.to_hex(), now],
        )?;
        Ok(changed > 0)
    }

    fn dependents_of(&self, digest: &Digest) -> Result<Vec<Digest>, DatabaseError> {
        self.edge_lookup(
            "SELECT object FROM dependencies WHERE depends_on = ?1 ORDER BY object",
            digest,
        )
    }

    fn dependencies_of(&self, digest: &Digest) -> Result<Vec<Digest>, DatabaseError> {
        self.edge_lookup(
            "SELECT depends_on FROM dependencies WHERE object = ?1 ORDER BY depends_on",
            digest,
        )
    }
}

impl Database {
    fn edge_lookup(&self, sql: &str, digest: &Digest) -> Result<Vec<Digest>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![digest.to_hex()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|s| parse_digest("dependency", &digest.to_hex(), s))
            .collect()
    }
}

fn invalid_row(entity: &str, id: &str, detail: String) -> DatabaseError {
    DatabaseError::InvalidRow {
        entity: entity.to_string(),
        id: id.to_string(),
        detail,
    }
}

fn parse_digest(entity: &str, id: &str, s: &str) -> Result<Digest, DatabaseError> {
    s.parse::<Digest>()
        .map_err(|e| invalid_row(entity, id, e.to_string()))
}

fn parse_datetime(entity: &str, id: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid_row(entity, id, format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MergeStrategy;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn d(s: &str) -> Digest {
        Digest::of_bytes(s.as_bytes())
    }

    #[test]
    fn test_object_crud() {
        let db = setup_db();
        assert!(db.put_object(ObjectKind::Blob, &d("a"), b"alpha").unwrap());
        assert!(!db.put_object(ObjectKind::Blob, &d("a"), b"alpha").unwrap());
        assert_eq!(
            db.get_object(ObjectKind::Blob, &d("a")).unwrap().as_deref(),
            Some(&b"alpha"[..])
        );
        assert!(db.get_object(ObjectKind::Tree, &d("a")).unwrap().is_none());
        assert_eq!(db.count_objects(ObjectKind::Blob).unwrap(), 1);
    }

    #[test]
    fn test_branch_crud() {
        let db = setup_db();
        let now = Utc::now();
        let branch = Branch::new("feature", d("c1"), Some("main".into()), now);
        assert!(db.insert_branch(&branch).unwrap());
        assert!(!db.insert_branch(&branch).unwrap());

        let loaded = db.get_branch("feature").unwrap().unwrap();
        assert_eq!(loaded.head, d("c1"));
        assert_eq!(loaded.parent_branch.as_deref(), Some("main"));
        assert_eq!(loaded.status, BranchStatus::Active);

        assert!(!db.update_branch_head("feature", &d("zz"), &d("c2"), now).unwrap());
        assert!(db.update_branch_head("feature", &d("c1"), &d("c2"), now).unwrap());
        assert_eq!(db.get_branch("feature").unwrap().unwrap().head, d("c2"));

        // Stale expectations leave the row alone.
        assert!(!db
            .set_branch_status("feature", BranchStatus::Merged, &d("c2"), BranchStatus::Deleted, now)
            .unwrap());
        assert!(!db
            .set_branch_status("feature", BranchStatus::Active, &d("c1"), BranchStatus::Deleted, now)
            .unwrap());
        assert!(db
            .set_branch_status("feature", BranchStatus::Active, &d("c2"), BranchStatus::Deleted, now)
            .unwrap());
        assert!(!db
            .set_branch_status("feature", BranchStatus::Active, &d("c2"), BranchStatus::Merged, now)
            .unwrap());
        assert!(db.insert_branch(&Branch::new("feature", d("c3"), None, now)).unwrap());
        let names: Vec<String> = db.list_branches().unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["feature".to_string()]);
    }

    #[test]
    fn test_merge_log_is_append_only() {
        let db = setup_db();
        let op = MergeOperation::new("feature", "main", MergeStrategy::Union, "m", Utc::now());
        db.append_merge_operation(&op).unwrap();
        assert!(db.append_merge_operation(&op).is_err());

        let loaded = db.get_merge_operation(&op.id).unwrap().unwrap();
        assert_eq!(loaded, op);
        assert_eq!(db.list_merge_operations(10).unwrap().len(), 1);
    }

    #[test]
    fn test_dependencies() {
        let db = setup_db();
        let edge = DependencyEdge {
            object: d("view"),
            depends_on: d("table"),
        };
        assert!(db.insert_dependency(&edge).unwrap());
        assert!(!db.insert_dependency(&edge).unwrap());
        assert_eq!(db.dependents_of(&d("table")).unwrap(), vec![d("view")]);
        assert_eq!(db.dependencies_of(&d("view")).unwrap(), vec![d("table")]);
    }
}
