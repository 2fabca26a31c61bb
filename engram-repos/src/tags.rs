//! Tag repository

use crate::DbDeps;
use engram_adapters::{SqlRow, SqlValue, StorageTransaction};
use engram_core::{
    normalize_tag_name, EngramError, EngramResult, EntryId, EntryKind, IdType, Tag, TagId,
};
use std::collections::HashMap;

fn decode(row: &SqlRow) -> EngramResult<Tag> {
    Ok(Tag {
        tag_id: TagId::from_uuid(row.uuid("tag_id")?),
        name: row.text("name")?,
        color: row.opt_text("color")?,
        description: row.opt_text("description")?,
        created_at: row.timestamp("created_at")?,
    })
}

/// Fetch-or-create a tag by normalized name inside a transaction.
pub(crate) async fn get_or_create_in_tx(
    tx: &mut dyn StorageTransaction,
    raw_name: &str,
) -> EngramResult<TagId> {
    let name = normalize_tag_name(raw_name);
    if name.is_empty() {
        return Err(EngramError::missing_field("tag"));
    }
    let rows = tx
        .execute(
            "SELECT tag_id FROM tags WHERE name = $1",
            &[SqlValue::from(name.as_str())],
        )
        .await?;
    if let Some(row) = rows.first() {
        return Ok(TagId::from_uuid(row.uuid("tag_id")?));
    }
    let tag_id = TagId::now_v7();
    tx.execute(
        "INSERT INTO tags (tag_id, name, color, description, created_at)
         VALUES ($1, $2, $3, $4, $5)",
        &[
            SqlValue::from(tag_id.as_uuid()),
            SqlValue::from(name.as_str()),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::from(chrono::Utc::now()),
        ],
    )
    .await?;
    Ok(tag_id)
}

/// Repository over tags and tag attachments.
pub struct TagRepository {
    deps: DbDeps,
}

impl TagRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    pub async fn create(
        &self,
        name: &str,
        color: Option<String>,
        description: Option<String>,
    ) -> EngramResult<Tag> {
        let name = normalize_tag_name(name);
        if name.is_empty() {
            return Err(EngramError::missing_field("name"));
        }
        let tag = Tag {
            tag_id: TagId::now_v7(),
            name: name.clone(),
            color,
            description,
            created_at: chrono::Utc::now(),
        };
        self.deps
            .storage
            .execute(
                "INSERT INTO tags (tag_id, name, color, description, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    SqlValue::from(tag.tag_id.as_uuid()),
                    SqlValue::from(tag.name.as_str()),
                    SqlValue::from(tag.color.clone()),
                    SqlValue::from(tag.description.clone()),
                    SqlValue::from(tag.created_at),
                ],
            )
            .await
            .map_err(|e| {
                if crate::is_unique_violation(&e) {
                    engram_core::ResourceError::AlreadyExists {
                        record: "tag",
                        name,
                        scope: "global".into(),
                    }
                    .into()
                } else {
                    e
                }
            })?;
        Ok(tag)
    }

    pub async fn get_by_name(&self, name: &str) -> EngramResult<Option<Tag>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM tags WHERE name = $1",
                &[SqlValue::from(normalize_tag_name(name))],
            )
            .await?;
        rows.first().map(decode).transpose()
    }

    pub async fn list(&self) -> EngramResult<Vec<Tag>> {
        let rows = self
            .deps
            .storage
            .execute("SELECT * FROM tags ORDER BY name", &[])
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Delete a tag and its attachments.
    pub async fn delete(&self, name: &str) -> EngramResult<bool> {
        let Some(tag) = self.get_by_name(name).await? else {
            return Ok(false);
        };
        self.deps
            .storage
            .execute(
                "DELETE FROM tag_attachments WHERE tag_id = $1",
                &[SqlValue::from(tag.tag_id.as_uuid())],
            )
            .await?;
        self.deps
            .storage
            .execute(
                "DELETE FROM tags WHERE tag_id = $1",
                &[SqlValue::from(tag.tag_id.as_uuid())],
            )
            .await?;
        Ok(true)
    }

    pub async fn attach(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        tag_name: &str,
    ) -> EngramResult<Tag> {
        let tag = match self.get_by_name(tag_name).await? {
            Some(tag) => tag,
            None => self.create(tag_name, None, None).await?,
        };
        // Idempotent: re-attaching is a no-op.
        let result = self
            .deps
            .storage
            .execute(
                "INSERT INTO tag_attachments (entry_kind, entry_id, tag_id)
                 VALUES ($1, $2, $3)",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(tag.tag_id.as_uuid()),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(tag),
            Err(e) if crate::is_unique_violation(&e) => Ok(tag),
            Err(e) => Err(e),
        }
    }

    pub async fn detach(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        tag_name: &str,
    ) -> EngramResult<bool> {
        let Some(tag) = self.get_by_name(tag_name).await? else {
            return Ok(false);
        };
        let existed = !self
            .deps
            .storage
            .execute(
                "SELECT tag_id FROM tag_attachments
                 WHERE entry_kind = $1 AND entry_id = $2 AND tag_id = $3",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(tag.tag_id.as_uuid()),
                ],
            )
            .await?
            .is_empty();
        self.deps
            .storage
            .execute(
                "DELETE FROM tag_attachments
                 WHERE entry_kind = $1 AND entry_id = $2 AND tag_id = $3",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(tag.tag_id.as_uuid()),
                ],
            )
            .await?;
        Ok(existed)
    }

    pub async fn tags_for_entry(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
    ) -> EngramResult<Vec<Tag>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT t.* FROM tags t
                 JOIN tag_attachments a ON a.tag_id = t.tag_id
                 WHERE a.entry_kind = $1 AND a.entry_id = $2
                 ORDER BY t.name",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                ],
            )
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Batch tag load for the pipeline tag stage: one query for any number
    /// of entries, never N+1.
    pub async fn tags_for_entries(
        &self,
        entry_ids: &[EntryId],
    ) -> EngramResult<HashMap<EntryId, Vec<Tag>>> {
        let mut out: HashMap<EntryId, Vec<Tag>> = HashMap::new();
        if entry_ids.is_empty() {
            return Ok(out);
        }
        // Chunk to keep statements bounded.
        for chunk in entry_ids.chunks(100) {
            let placeholders: Vec<String> =
                (1..=chunk.len()).map(|i| format!("${i}")).collect();
            let sql = format!(
                "SELECT a.entry_id AS owner_id, t.tag_id, t.name, t.color, t.description,
                        t.created_at
                 FROM tags t
                 JOIN tag_attachments a ON a.tag_id = t.tag_id
                 WHERE a.entry_id IN ({})
                 ORDER BY t.name",
                placeholders.join(", ")
            );
            let params: Vec<SqlValue> = chunk
                .iter()
                .map(|id| SqlValue::from(id.as_uuid()))
                .collect();
            let rows = self.deps.storage.execute(&sql, &params).await?;
            for row in &rows {
                let owner = EntryId::from_uuid(row.uuid("owner_id")?);
                out.entry(owner).or_default().push(decode(row)?);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::tests::test_deps;

    #[tokio::test]
    async fn test_create_normalizes_and_dedupes() {
        let repo = TagRepository::new(test_deps().await);
        repo.create("  Security ", None, None).await.unwrap();
        assert!(repo.get_by_name("security").await.unwrap().is_some());
        assert!(repo.get_by_name("SECURITY").await.unwrap().is_some());
        assert_eq!(
            repo.create("security", None, None).await.unwrap_err().code(),
            2002
        );
    }

    #[tokio::test]
    async fn test_attach_detach_roundtrip() {
        let repo = TagRepository::new(test_deps().await);
        let entry = EntryId::now_v7();

        repo.attach(EntryKind::Guideline, entry, "security")
            .await
            .unwrap();
        // Re-attach is idempotent.
        repo.attach(EntryKind::Guideline, entry, "security")
            .await
            .unwrap();

        let tags = repo.tags_for_entry(EntryKind::Guideline, entry).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "security");

        assert!(repo.detach(EntryKind::Guideline, entry, "security").await.unwrap());
        assert!(!repo.detach(EntryKind::Guideline, entry, "security").await.unwrap());
        assert!(repo
            .tags_for_entry(EntryKind::Guideline, entry)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_batch_load_groups_by_entry() {
        let repo = TagRepository::new(test_deps().await);
        let a = EntryId::now_v7();
        let b = EntryId::now_v7();

        repo.attach(EntryKind::Knowledge, a, "api").await.unwrap();
        repo.attach(EntryKind::Knowledge, a, "auth").await.unwrap();
        repo.attach(EntryKind::Knowledge, b, "api").await.unwrap();

        let map = repo.tags_for_entries(&[a, b, EntryId::now_v7()]).await.unwrap();
        assert_eq!(map[&a].len(), 2);
        assert_eq!(map[&b].len(), 1);
        assert_eq!(map.len(), 2);
    }
}
