//! Filterable payload of one committed write.

use std::sync::OnceLock;

/// A key/value pair reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The key.
    pub key: Vec<u8>,
    /// The value after the commit; the last value for deleted entries.
    pub value: Vec<u8>,
}

/// Raw change of one key as recorded by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    /// The key.
    pub key: Vec<u8>,
    /// Value before the commit, `None` if the key did not exist.
    pub old: Option<Vec<u8>>,
    /// Value after the commit, `None` if the key was deleted.
    pub new: Option<Vec<u8>>,
}

impl KeyChange {
    /// A key that did not exist before.
    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            old: None,
            new: Some(value.into()),
        }
    }

    /// A key whose value was replaced.
    pub fn update(
        key: impl Into<Vec<u8>>,
        old: impl Into<Vec<u8>>,
        new: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            old: Some(old.into()),
            new: Some(new.into()),
        }
    }

    /// A key that was removed.
    pub fn delete(key: impl Into<Vec<u8>>, old: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            old: Some(old.into()),
            new: None,
        }
    }
}

/// A conflict detected while applying synced data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The conflicting key.
    pub key: Vec<u8>,
    /// Local value, `None` if deleted locally.
    pub local: Option<Vec<u8>>,
    /// Incoming value, `None` if deleted remotely.
    pub remote: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
struct Classified {
    inserted: Vec<Entry>,
    updated: Vec<Entry>,
    deleted: Vec<Entry>,
}

/// Everything observers learn about one commit.
///
/// The inserted/updated/deleted split is computed from the raw
/// [`KeyChange`] records the first time any of it is read, then cached.
#[derive(Debug, Clone, Default)]
pub struct CommitNotifyData {
    notify_id: u64,
    changes: Vec<KeyChange>,
    conflicts: Vec<Conflict>,
    is_cleared: bool,
    classified: OnceLock<Classified>,
}

impl CommitNotifyData {
    /// Creates a payload from raw change records.
    pub fn new(changes: Vec<KeyChange>) -> Self {
        Self {
            changes,
            ..Self::default()
        }
    }

    /// A payload reporting that the whole store was cleared.
    pub fn cleared() -> Self {
        Self {
            is_cleared: true,
            ..Self::default()
        }
    }

    /// Attaches conflicts.
    #[must_use]
    pub fn with_conflicts(mut self, conflicts: Vec<Conflict>) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// Id stamped by the notifier; zero until the payload is committed.
    pub fn notify_id(&self) -> u64 {
        self.notify_id
    }

    pub(crate) fn stamp(&mut self, notify_id: u64) {
        self.notify_id = notify_id;
    }

    /// Keys that did not exist before the commit.
    pub fn inserted_entries(&self) -> &[Entry] {
        &self.classify().inserted
    }

    /// Keys whose value was replaced.
    pub fn updated_entries(&self) -> &[Entry] {
        &self.classify().updated
    }

    /// Keys removed by the commit, with their last value.
    pub fn deleted_entries(&self) -> &[Entry] {
        &self.classify().deleted
    }

    /// Conflicts detected while applying the commit.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// True if the commit cleared the store.
    pub fn is_cleared(&self) -> bool {
        self.is_cleared
    }

    /// True if there is no data change worth reporting.
    pub fn is_changed_data_empty(&self) -> bool {
        let classified = self.classify();
        !self.is_cleared
            && classified.inserted.is_empty()
            && classified.updated.is_empty()
            && classified.deleted.is_empty()
    }

    /// True if there are no conflicts.
    pub fn is_conflicted_data_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Returns the part of this payload whose keys start with `prefix`,
    /// or `None` if nothing matches. A cleared payload always matches.
    pub fn filter_by_prefix(&self, prefix: &[u8]) -> Option<Self> {
        if self.is_cleared {
            return Some(self.clone());
        }
        let changes: Vec<_> = self
            .changes
            .iter()
            .filter(|c| c.key.starts_with(prefix))
            .cloned()
            .collect();
        let conflicts: Vec<_> = self
            .conflicts
            .iter()
            .filter(|c| c.key.starts_with(prefix))
            .cloned()
            .collect();
        if changes.is_empty() && conflicts.is_empty() {
            return None;
        }
        Some(Self {
            notify_id: self.notify_id,
            changes,
            conflicts,
            is_cleared: false,
            classified: OnceLock::new(),
        })
    }

    fn classify(&self) -> &Classified {
        self.classified.get_or_init(|| {
            let mut classified = Classified::default();
            for change in &self.changes {
                match (&change.old, &change.new) {
                    (None, Some(new)) => classified.inserted.push(Entry {
                        key: change.key.clone(),
                        value: new.clone(),
                    }),
                    (Some(_), Some(new)) => classified.updated.push(Entry {
                        key: change.key.clone(),
                        value: new.clone(),
                    }),
                    (Some(old), None) => classified.deleted.push(Entry {
                        key: change.key.clone(),
                        value: old.clone(),
                    }),
                    (None, None) => {}
                }
            }
            classified
        })
    }
}
