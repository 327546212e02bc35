use rusqlite::params;
use uuid::Uuid;

use murmur_shared::types::{ChatContent, ChatRecord};

use crate::database::Database;
use crate::error::Result;
use crate::models::{parse_timestamp, parse_uuid};

impl Database {
    pub fn insert_message(&self, contact_id: Uuid, record: &ChatRecord) -> Result<()> {
        let (kind, body, file_id) = match &record.content {
            ChatContent::Text { text } => ("text", text.as_str(), None),
            ChatContent::File { file_id, name } => ("file", name.as_str(), Some(file_id.to_string())),
        };
        self.conn().execute(
            "INSERT INTO messages (contact_id, outgoing, kind, body, file_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contact_id.to_string(),
                record.outgoing as i32,
                kind,
                body,
                file_id,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn get_messages_for_contact(
        &self,
        contact_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT outgoing, kind, body, file_id, timestamp
             FROM messages
             WHERE contact_id = ?1
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![contact_id.to_string(), limit, offset],
            row_to_record,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn delete_messages_for_contact(&self, contact_id: Uuid) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE contact_id = ?1",
            params![contact_id.to_string()],
        )?;
        Ok(affected)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    let outgoing: i32 = row.get(0)?;
    let kind: String = row.get(1)?;
    let body: String = row.get(2)?;
    let file_id: Option<String> = row.get(3)?;
    let ts_str: String = row.get(4)?;

    let content = match (kind.as_str(), file_id) {
        ("file", Some(id)) => ChatContent::File {
            file_id: parse_uuid(3, &id)?,
            name: body,
        },
        ("text", _) => ChatContent::Text { text: body },
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown message kind {kind:?}").into(),
            ))
        }
    };

    Ok(ChatRecord {
        outgoing: outgoing != 0,
        timestamp: parse_timestamp(4, &ts_str)?,
        content,
    })
}
