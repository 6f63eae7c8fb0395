/// Kind of a journal entry, one per command the SDK can record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Input,
    Output,
    Run,
    Call,
    OneWayCall,
    Sleep,
    GetState,
    SetState,
    ClearState,
    ClearAllState,
    GetStateKeys,
    GetPromise,
    PeekPromise,
    CompletePromise,
    CompleteAwakeable,
    SendSignal,
    AttachInvocation,
    GetInvocationOutput,
}

/// Whether the entry's result is already known.
///
/// Pending entries have exactly one rendezvous registered in the
/// completion manager; the journal itself never stores result payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Completed,
}

/// One row of the invocation journal: the shape of an operation, not its
/// result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub ty: EntryType,
    pub name: Option<String>,
    pub state: EntryState,
}

impl JournalEntry {
    pub fn pending(ty: EntryType, name: Option<String>) -> Self {
        Self {
            ty,
            name,
            state: EntryState::Pending,
        }
    }

    pub fn completed(ty: EntryType, name: Option<String>) -> Self {
        Self {
            ty,
            name,
            state: EntryState::Completed,
        }
    }
}

/// Append-only, densely indexed log of the invocation's operations.
///
/// The index an entry receives at append time equals the `completion_id`
/// carried in the corresponding command's wire encoding.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    known_entries: u32,
}

impl Journal {
    /// Set the replay budget declared by the runtime in `Start`.
    pub fn initialize(&mut self, known_entries: u32) {
        self.known_entries = known_entries;
    }

    pub fn append(&mut self, entry: JournalEntry) -> u32 {
        let index = self.entries.len() as u32;
        self.entries.push(entry);
        index
    }

    pub fn get(&self, index: u32) -> Option<&JournalEntry> {
        self.entries.get(index as usize)
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn known_entries(&self) -> u32 {
        self.known_entries
    }

    pub fn is_replaying(&self) -> bool {
        self.len() < self.known_entries
    }

    /// Mark a pending entry as resolved. The transition happens at most
    /// once; resolving a completed entry is a no-op.
    pub fn resolve(&mut self, index: u32) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            entry.state = EntryState::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_in_append_order() {
        let mut journal = Journal::default();
        assert_eq!(
            journal.append(JournalEntry::completed(EntryType::Input, None)),
            0
        );
        assert_eq!(
            journal.append(JournalEntry::pending(EntryType::Sleep, None)),
            1
        );
        assert_eq!(
            journal.append(JournalEntry::pending(EntryType::Call, None)),
            2
        );
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.get(1).unwrap().ty, EntryType::Sleep);
    }

    #[test]
    fn replay_budget_controls_is_replaying() {
        let mut journal = Journal::default();
        journal.initialize(2);
        assert!(journal.is_replaying());
        journal.append(JournalEntry::completed(EntryType::Input, None));
        assert!(journal.is_replaying());
        journal.append(JournalEntry::pending(EntryType::Run, Some("x".into())));
        assert!(!journal.is_replaying());
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut journal = Journal::default();
        journal.append(JournalEntry::pending(EntryType::Sleep, None));
        journal.resolve(0);
        journal.resolve(0);
        assert_eq!(journal.get(0).unwrap().state, EntryState::Completed);
    }
}
