use std::collections::HashMap;

use chrono::Utc;
use rolegate_contracts::{Conversation, ConversationState};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Default)]
pub struct MemoryStore {
    conversations: HashMap<String, Conversation>,
    by_pending_message: HashMap<String, String>,
}

pub struct SqliteStore {
    conn: Connection,
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn memory() -> Self {
        StoreBackend::Memory(MemoryStore::default())
    }

    pub fn sqlite(path: &str) -> Result<Self, String> {
        Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.conversations.get(conversation_id).cloned()),
            StoreBackend::Sqlite(store) => store.get_conversation(conversation_id),
        }
    }

    pub fn save_conversation(&mut self, conversation: &Conversation) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(message_id) = &conversation.pending_message_id {
                    store
                        .by_pending_message
                        .insert(message_id.clone(), conversation.conversation_id.clone());
                }
                store
                    .conversations
                    .insert(conversation.conversation_id.clone(), conversation.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_conversation(conversation),
        }
    }

    pub fn find_by_pending_message(&self, message_id: &str) -> Result<Option<String>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.by_pending_message.get(message_id).cloned()),
            StoreBackend::Sqlite(store) => store.find_by_pending_message(message_id),
        }
    }

    pub fn list_open(&self) -> Result<Vec<Conversation>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut open: Vec<Conversation> = store
                    .conversations
                    .values()
                    .filter(|c| !c.state.is_closed())
                    .cloned()
                    .collect();
                open.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
                Ok(open)
            }
            StoreBackend::Sqlite(store) => store.list_open(),
        }
    }
}

const OPEN_STATES: [ConversationState; 3] = [
    ConversationState::Init,
    ConversationState::Evaluating,
    ConversationState::AwaitingReply,
];

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                pending_message_id TEXT,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS conversations_pending_message
                ON conversations (pending_message_id);
            CREATE INDEX IF NOT EXISTS conversations_state
                ON conversations (state);
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, String> {
        let record_json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match record_json {
            Some(v) => {
                let conversation: Conversation =
                    serde_json::from_str(&v).map_err(|e| e.to_string())?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    fn save_conversation(&mut self, conversation: &Conversation) -> Result<(), String> {
        let json = serde_json::to_string(conversation).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO conversations
                (conversation_id, state, pending_message_id, record_json, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(conversation_id) DO UPDATE SET
                    state=excluded.state,
                    pending_message_id=excluded.pending_message_id,
                    record_json=excluded.record_json,
                    updated_at=excluded.updated_at
                ",
                params![
                    conversation.conversation_id,
                    conversation.state.as_str(),
                    conversation.pending_message_id,
                    json,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn find_by_pending_message(&self, message_id: &str) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT conversation_id FROM conversations WHERE pending_message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list_open(&self) -> Result<Vec<Conversation>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record_json FROM conversations
                 WHERE state IN (?1, ?2, ?3)
                 ORDER BY conversation_id",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(
                params![
                    OPEN_STATES[0].as_str(),
                    OPEN_STATES[1].as_str(),
                    OPEN_STATES[2].as_str()
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| e.to_string())?;

        let mut open = Vec::new();
        for row in rows {
            let json = row.map_err(|e| e.to_string())?;
            open.push(serde_json::from_str(&json).map_err(|e| e.to_string())?);
        }
        Ok(open)
    }
}
