//! Notes workload: CRUD and cached queries over the `Note` entity
//!
//! Query regions:
//! - `query.findNotesByTitle`
//! - `query.findAllNotes`
//! - `query.findAllNotesByArchived`

use crate::cache::query_cache::QueryKey;
use crate::database::Database;
use crate::gateway::Gateway;
use crate::types::{decode, EntityKey, Note, Row};
use crate::Result;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const REGION_BY_TITLE: &str = "query.findNotesByTitle";
pub const REGION_ALL: &str = "query.findAllNotes";
pub const REGION_BY_ARCHIVED: &str = "query.findAllNotesByArchived";

/// Note service backed by the entity cache
pub struct NoteService {
    gateway: Arc<Gateway>,
    next_id: AtomicI64,
}

impl NoteService {
    /// Create the service, continuing ids after the highest stored note
    pub fn new(gateway: Arc<Gateway>) -> Result<Self> {
        let max_id = gateway
            .database()
            .scan(Note::ENTITY)?
            .into_iter()
            .filter_map(|(_, row)| decode::<Note>(&row.data).ok())
            .map(|note| note.id)
            .max()
            .unwrap_or(0);

        Ok(Self {
            gateway,
            next_id: AtomicI64::new(max_id + 1),
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn create(&self, title: &str, content: &str) -> Result<Note> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let note = Note {
            id,
            title: title.to_string(),
            content: content.to_string(),
            archived: false,
        };

        let created = note.clone();
        self.gateway
            .write_expecting(&Note::key(id), 0, move |_| Ok(created))?;
        debug!(id, title, "note created");
        Ok(note)
    }

    pub fn get(&self, id: i64) -> Result<Option<Note>> {
        self.gateway.get(&Note::key(id))
    }

    /// First note with exactly this title
    pub fn find_by_title(&self, title: &str) -> Result<Option<Note>> {
        let query = QueryKey::new(REGION_BY_TITLE, "findByTitle").param(title);
        let notes = self.query(&query, |note| note.title == title)?;
        Ok(notes.into_iter().next())
    }

    pub fn find_all(&self) -> Result<Vec<Note>> {
        let query = QueryKey::new(REGION_ALL, "findAll");
        self.query(&query, |_| true)
    }

    pub fn find_all_by_archived(&self, archived: bool) -> Result<Vec<Note>> {
        let query = QueryKey::new(REGION_BY_ARCHIVED, "findAllByArchived").param(archived);
        self.query(&query, |note| note.archived == archived)
    }

    pub fn list_active(&self) -> Result<Vec<Note>> {
        self.find_all_by_archived(false)
    }

    fn query(&self, query: &QueryKey, filter: impl Fn(&Note) -> bool) -> Result<Vec<Note>> {
        self.gateway.query(query, &[Note::ENTITY], |db: &dyn Database| {
            let mut matched: Vec<(EntityKey, Row)> = Vec::new();
            for (key, row) in db.scan(Note::ENTITY)? {
                if filter(&decode::<Note>(&row.data)?) {
                    matched.push((key, row));
                }
            }
            Ok(matched)
        })
    }

    /// Replace title, content and archived flag; false if the note does not exist
    pub fn update(&self, id: i64, title: &str, content: &str, archived: bool) -> Result<bool> {
        let key = Note::key(id);
        let existing = match self.gateway.get_versioned::<Note>(&key)? {
            Some(existing) => existing,
            None => return Ok(false),
        };

        let updated = Note {
            id,
            title: title.to_string(),
            content: content.to_string(),
            archived,
        };
        self.gateway
            .write_expecting(&key, existing.version, move |_: Option<Note>| Ok(updated))?;
        Ok(true)
    }

    /// Archive a note; false if it does not exist
    pub fn archive(&self, id: i64) -> Result<bool> {
        let key = Note::key(id);
        let existing = match self.gateway.get_versioned::<Note>(&key)? {
            Some(existing) => existing,
            None => return Ok(false),
        };

        self.gateway
            .write_expecting(&key, existing.version, |current: Option<Note>| {
                let mut note = current.unwrap_or(existing.value);
                note.archived = true;
                Ok(note)
            })?;
        Ok(true)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.gateway.delete(&Note::key(id))?;
        Ok(())
    }
}
