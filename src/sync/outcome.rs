use serde::Serialize;

/// What one sync attempt changed in the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Messages newly stored.
    pub messages_added: usize,
    /// Messages actually removed from the store.
    pub messages_removed: usize,
    /// Label add/remove events applied.
    pub labels_changed: usize,
    /// The attempt rebuilt from a full listing rather than the change feed.
    pub full_resync: bool,
    /// Stopped early on shutdown, after the last committed page.
    pub cancelled: bool,
    /// Messages skipped because they could not be normalized.
    pub errors: Vec<String>,
}

impl SyncOutcome {
    pub fn full() -> Self {
        Self {
            full_resync: true,
            ..Self::default()
        }
    }

    /// Whether a view over the store should refresh.
    pub fn has_changes(&self) -> bool {
        self.full_resync
            || self.messages_added > 0
            || self.messages_removed > 0
            || self.labels_changed > 0
    }

    /// Folds in what an earlier, abandoned attempt already committed.
    pub(crate) fn merge(&mut self, earlier: SyncOutcome) {
        self.messages_added += earlier.messages_added;
        self.messages_removed += earlier.messages_removed;
        self.labels_changed += earlier.labels_changed;
        self.full_resync |= earlier.full_resync;
        self.cancelled |= earlier.cancelled;
        let mut errors = earlier.errors;
        errors.append(&mut self.errors);
        self.errors = errors;
    }

    pub(crate) fn absorb(&mut self, page: PageCounts) {
        self.messages_added += page.added;
        self.messages_removed += page.removed;
        self.labels_changed += page.labels_changed;
    }
}

/// Counts from one committed page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PageCounts {
    pub added: usize,
    pub removed: usize,
    pub labels_changed: usize,
}
