//! Per-repository indexing lifecycle.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{IndexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    #[default]
    Pending,
    Cloning,
    Indexing,
    Ready,
    Error,
}

impl IndexStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Indexing => "indexing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "cloning" => Some(Self::Cloning),
            "indexing" => Some(Self::Indexing),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use IndexStatus::{Cloning, Error, Indexing, Pending, Ready};
        matches!(
            (self, next),
            (Pending | Ready | Error, Cloning | Indexing)
                | (Cloning, Indexing | Error)
                | (Indexing, Ready | Error)
        )
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one repository's status, also used as the broadcast event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub repository_id: String,
    pub status: IndexStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Default)]
struct BoardState {
    statuses: HashMap<String, StatusUpdate>,
    in_flight: HashSet<String>,
}

/// Shared status table with a change feed and a one-run-per-repository guard.
pub struct StatusBoard {
    state: Mutex<BoardState>,
    tx: broadcast::Sender<StatusUpdate>,
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBoard").finish_non_exhaustive()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(BoardState::default()),
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status; unknown repositories are `pending`.
    #[must_use]
    pub fn get(&self, repository_id: &str) -> StatusUpdate {
        self.lock()
            .statuses
            .get(repository_id)
            .cloned()
            .unwrap_or_else(|| StatusUpdate {
                repository_id: repository_id.to_owned(),
                status: IndexStatus::Pending,
                detail: None,
            })
    }

    /// All known statuses, sorted by repository id.
    #[must_use]
    pub fn all(&self) -> Vec<StatusUpdate> {
        let mut out: Vec<_> = self.lock().statuses.values().cloned().collect();
        out.sort_by(|a, b| a.repository_id.cmp(&b.repository_id));
        out
    }

    /// Seed statuses loaded from persistent storage without validation.
    ///
    /// A run interrupted mid-flight (`cloning`/`indexing`) is restored as `error`.
    pub fn restore(&self, updates: impl IntoIterator<Item = StatusUpdate>) {
        let mut state = self.lock();
        for mut update in updates {
            if matches!(update.status, IndexStatus::Cloning | IndexStatus::Indexing) {
                update.status = IndexStatus::Error;
                update.detail = Some("interrupted".into());
            }
            state.statuses.insert(update.repository_id.clone(), update);
        }
    }

    /// Move a repository to `next`, publishing the change.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidTransition`] when the lifecycle forbids the move.
    pub fn transition(
        &self,
        repository_id: &str,
        next: IndexStatus,
        detail: Option<String>,
    ) -> Result<StatusUpdate> {
        let update = {
            let mut state = self.lock();
            let current = state
                .statuses
                .get(repository_id)
                .map_or(IndexStatus::Pending, |u| u.status);
            if !current.can_transition_to(next) {
                return Err(IndexError::InvalidTransition {
                    repository: repository_id.to_owned(),
                    from: current,
                    to: next,
                });
            }
            let update = StatusUpdate {
                repository_id: repository_id.to_owned(),
                status: next,
                detail,
            };
            state
                .statuses
                .insert(repository_id.to_owned(), update.clone());
            update
        };
        tracing::info!(
            repository = repository_id,
            status = %update.status,
            detail = update.detail.as_deref().unwrap_or(""),
            "index status changed"
        );
        // no subscribers is fine
        let _ = self.tx.send(update.clone());
        Ok(update)
    }

    /// Drop a repository's entry; it reads as `pending` afterwards.
    pub fn forget(&self, repository_id: &str) {
        self.lock().statuses.remove(repository_id);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn is_busy(&self, repository_id: &str) -> bool {
        self.lock().in_flight.contains(repository_id)
    }

    /// Claim the single indexing slot for a repository.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Busy`] if a run already holds the slot.
    pub fn try_begin(self: &Arc<Self>, repository_id: &str) -> Result<IndexLease> {
        let mut state = self.lock();
        if !state.in_flight.insert(repository_id.to_owned()) {
            return Err(IndexError::Busy(repository_id.to_owned()));
        }
        Ok(IndexLease {
            board: Arc::clone(self),
            repository_id: repository_id.to_owned(),
        })
    }
}

/// Held for the duration of an indexing run; releases the slot on drop.
#[derive(Debug)]
pub struct IndexLease {
    board: Arc<StatusBoard>,
    repository_id: String,
}

impl IndexLease {
    #[must_use]
    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }
}

impl Drop for IndexLease {
    fn drop(&mut self) {
        self.board.lock().in_flight.remove(&self.repository_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_repository_is_pending() {
        let board = StatusBoard::new();
        assert_eq!(board.get("x").status, IndexStatus::Pending);
        assert!(board.all().is_empty());
    }

    #[test]
    fn lifecycle_transitions() {
        let board = StatusBoard::new();
        board.transition("r", IndexStatus::Cloning, None).unwrap();
        board.transition("r", IndexStatus::Indexing, None).unwrap();
        board.transition("r", IndexStatus::Ready, None).unwrap();
        board.transition("r", IndexStatus::Indexing, None).unwrap();
        board
            .transition("r", IndexStatus::Error, Some("boom".into()))
            .unwrap();
        let s = board.get("r");
        assert_eq!(s.status, IndexStatus::Error);
        assert_eq!(s.detail.as_deref(), Some("boom"));
    }

    #[test]
    fn rejects_invalid_transitions() {
        let board = StatusBoard::new();
        let err = board.transition("r", IndexStatus::Ready, None).unwrap_err();
        assert!(matches!(
            err,
            IndexError::InvalidTransition {
                from: IndexStatus::Pending,
                to: IndexStatus::Ready,
                ..
            }
        ));
        board.transition("r", IndexStatus::Cloning, None).unwrap();
        assert!(board.transition("r", IndexStatus::Ready, None).is_err());
        assert!(board.transition("r", IndexStatus::Pending, None).is_err());
        assert_eq!(board.get("r").status, IndexStatus::Cloning);
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            IndexStatus::Pending,
            IndexStatus::Cloning,
            IndexStatus::Indexing,
            IndexStatus::Ready,
            IndexStatus::Error,
        ] {
            assert_eq!(IndexStatus::parse(&s.to_string()), Some(s));
        }
        assert_eq!(
            serde_json::to_string(&IndexStatus::Ready).unwrap(),
            "\"ready\""
        );
    }

    #[test]
    fn restore_marks_interrupted_runs_as_error() {
        let board = StatusBoard::new();
        board.restore([
            StatusUpdate {
                repository_id: "a".into(),
                status: IndexStatus::Ready,
                detail: None,
            },
            StatusUpdate {
                repository_id: "b".into(),
                status: IndexStatus::Indexing,
                detail: None,
            },
        ]);
        assert_eq!(board.get("a").status, IndexStatus::Ready);
        assert_eq!(board.get("b").status, IndexStatus::Error);
        board.transition("b", IndexStatus::Indexing, None).unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.transition("r", IndexStatus::Indexing, None).unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.repository_id, "r");
        assert_eq!(update.status, IndexStatus::Indexing);
    }

    #[test]
    fn lease_is_exclusive_and_released_on_drop() {
        let board = Arc::new(StatusBoard::new());
        let lease = board.try_begin("r").unwrap();
        assert!(board.is_busy("r"));
        assert!(matches!(board.try_begin("r"), Err(IndexError::Busy(_))));
        assert!(board.try_begin("other").is_ok());
        drop(lease);
        assert!(!board.is_busy("r"));
        assert!(board.try_begin("r").is_ok());
    }
}
