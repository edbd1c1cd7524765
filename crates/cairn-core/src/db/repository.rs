//! Entity repository over the layered tables

use libsql::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{Attachment, Document, Id, Revision};

const REV_KEY: &str = "rev";

/// Persisted entity kinds
pub trait Entity: Serialize + DeserializeOwned {
    fn id(&self) -> &Id;
    fn rev(&self) -> Revision;
}

impl Entity for Document {
    fn id(&self) -> &Id {
        &self.id
    }

    fn rev(&self) -> Revision {
        self.rev
    }
}

impl Entity for Attachment {
    fn id(&self) -> &Id {
        &self.id
    }

    fn rev(&self) -> Revision {
        self.rev
    }
}

/// Storage tables: the confirmed layer and the local overlay per entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Documents,
    Attachments,
    LocalDocuments,
    LocalAttachments,
}

impl Table {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Attachments => "attachments",
            Self::LocalDocuments => "local_documents",
            Self::LocalAttachments => "local_attachments",
        }
    }

    pub const fn is_local(self) -> bool {
        matches!(self, Self::LocalDocuments | Self::LocalAttachments)
    }
}

/// libSQL access to entities and the store revision
pub struct EntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> EntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Current store revision (0 for an empty store)
    pub async fn revision(&self) -> Result<Revision> {
        let mut rows = self
            .conn
            .query("SELECT value FROM meta WHERE key = ?", [REV_KEY])
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(0);
        };
        let value: String = row.get(0)?;
        value
            .parse()
            .map_err(|_| Error::Database(format!("Corrupted store revision: {value}")))
    }

    pub async fn set_revision(&self, rev: Revision) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
                [REV_KEY, rev.to_string().as_str()],
            )
            .await?;
        Ok(())
    }

    /// Load every entity of a table
    pub async fn load_all<T: Entity>(&self, table: Table) -> Result<Vec<T>> {
        let sql = format!("SELECT body FROM {} ORDER BY id", table.name());
        let mut rows = self.conn.query(&sql, ()).await?;
        Self::collect(&mut rows).await
    }

    /// Load confirmed entities newer than `rev`
    pub async fn load_since<T: Entity>(&self, table: Table, rev: Revision) -> Result<Vec<T>> {
        if table.is_local() {
            return Err(Error::InvalidInput(format!(
                "{} has no revisions",
                table.name()
            )));
        }
        let sql = format!(
            "SELECT body FROM {} WHERE rev > ? ORDER BY rev, id",
            table.name()
        );
        let mut rows = self.conn.query(&sql, [rev]).await?;
        Self::collect(&mut rows).await
    }

    pub async fn get<T: Entity>(&self, table: Table, id: &Id) -> Result<Option<T>> {
        let sql = format!("SELECT body FROM {} WHERE id = ?", table.name());
        let mut rows = self.conn.query(&sql, [id.as_str()]).await?;
        match rows.next().await? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace an entity
    pub async fn put<T: Entity>(&self, table: Table, entity: &T) -> Result<()> {
        let body = serde_json::to_string(entity)?;
        let id = entity.id().as_str();
        if table.is_local() {
            let sql = format!("INSERT OR REPLACE INTO {} (id, body) VALUES (?, ?)", table.name());
            self.conn.execute(&sql, libsql::params![id, body]).await?;
        } else {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (id, rev, body) VALUES (?, ?, ?)",
                table.name()
            );
            self.conn
                .execute(&sql, libsql::params![id, entity.rev(), body])
                .await?;
        }
        Ok(())
    }

    pub async fn remove(&self, table: Table, id: &Id) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", table.name());
        self.conn.execute(&sql, [id.as_str()]).await?;
        Ok(())
    }

    async fn collect<T: Entity>(rows: &mut libsql::Rows) -> Result<Vec<T>> {
        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            let body: String = row.get(0)?;
            entities.push(serde_json::from_str(&body)?);
        }
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn revision_defaults_to_zero() {
        let db = setup().await;
        let repo = EntityRepository::new(db.connection());
        assert_eq!(repo.revision().await.unwrap(), 0);

        repo.set_revision(4).await.unwrap();
        assert_eq!(repo.revision().await.unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_and_remove_documents() {
        let db = setup().await;
        let repo = EntityRepository::new(db.connection());
        let mut doc = Document::new("note", json!({"name": "A"}));
        doc.rev = 2;

        repo.put(Table::Documents, &doc).await.unwrap();
        repo.put(Table::LocalDocuments, &doc).await.unwrap();

        let loaded: Option<Document> = repo.get(Table::Documents, &doc.id).await.unwrap();
        assert_eq!(loaded, Some(doc.clone()));

        repo.remove(Table::LocalDocuments, &doc.id).await.unwrap();
        let local: Vec<Document> = repo.load_all(Table::LocalDocuments).await.unwrap();
        assert!(local.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_since_filters_by_revision() {
        let db = setup().await;
        let repo = EntityRepository::new(db.connection());
        for rev in 1..=3 {
            let mut attachment =
                Attachment::new(Id::parse(format!("a{rev}")).unwrap(), "text/plain", 1);
            attachment.rev = rev;
            repo.put(Table::Attachments, &attachment).await.unwrap();
        }

        let newer: Vec<Attachment> = repo.load_since(Table::Attachments, 1).await.unwrap();
        let ids: Vec<&str> = newer.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a3"]);

        let local = repo
            .load_since::<Attachment>(Table::LocalAttachments, 0)
            .await;
        assert!(local.is_err());
    }
}
