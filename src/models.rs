//! Shared record shapes and the entity ID newtypes.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::def_id;

def_id!(BookId, "book");
def_id!(SeriesId, "series");
def_id!(ContributorId, "ctrb");
def_id!(GenreId, "genre");
def_id!(TagId, "tag");
def_id!(LibraryId, "lib");
def_id!(CollectionId, "coll");
def_id!(ShareId, "share");
def_id!(ShelfId, "shelf");
def_id!(ActivityId, "activity");
def_id!(ListeningEventId, "evt");
def_id!(TranscodeJobId, "xcode");
def_id!(SessionId, "sess");
def_id!(ReadingSessionId, "rsess");
def_id!(InviteId, "invite");
def_id!(UserId, "user");
def_id!(ProfileId, "profile");
def_id!(AudioFileId, "afile");

/// Fields every syncable entity carries. Embedded by value and
/// `#[serde(flatten)]`ed into each entity struct — Rust has no struct
/// inheritance, so composition stands in for the implied mixin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syncable {
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl Syncable {
    pub fn new(now: Timestamp) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }

    pub fn soft_delete(&mut self, now: Timestamp) {
        self.deleted_at = Some(now);
        self.updated_at = now;
    }
}

/// Permission levels for a `CollectionShare`. `Write`
/// implies `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharePermission {
    Read,
    Write,
}

impl SharePermission {
    pub fn allows_read(self) -> bool {
        true
    }

    pub fn allows_write(self) -> bool {
        matches!(self, SharePermission::Write)
    }

    pub fn from_str_checked(s: &str) -> crate::error::StoreResult<Self> {
        match s {
            "read" => Ok(SharePermission::Read),
            "write" => Ok(SharePermission::Write),
            other => Err(crate::error::StoreError::invalid_input(format!(
                "invalid share permission `{other}`"
            ))),
        }
    }
}

/// Role a contributor plays on a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributorRole {
    Author,
    Narrator,
    Editor,
    Translator,
}

impl std::fmt::Display for ContributorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContributorRole::Author => "author",
            ContributorRole::Narrator => "narrator",
            ContributorRole::Editor => "editor",
            ContributorRole::Translator => "translator",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl std::fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TranscodeStatus::Pending => "pending",
            TranscodeStatus::Running => "running",
            TranscodeStatus::Complete => "complete",
            TranscodeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Normalizes a name/email for case- and whitespace-insensitive unique
/// indexes.
pub fn normalize_lookup(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Derives a URL-safe slug from a display name (used by Genre and Tag).
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_dash = false;
    for c in s.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Derived key for per-(user,book) singleton records (`PlaybackState`,
/// `BookPreferences`).
pub fn user_book_key(user_id: &str, book_id: &str) -> String {
    format!("{user_id}:{book_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_handles_punctuation_and_case() {
        assert_eq!(slugify("Science Fiction & Fantasy"), "science-fiction-fantasy");
        assert_eq!(slugify("  Noir  "), "noir");
    }

    #[test]
    fn normalize_lookup_trims_and_lowercases() {
        assert_eq!(normalize_lookup("  User@Example.com "), "user@example.com");
    }
}
