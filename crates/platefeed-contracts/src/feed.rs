use serde::{Deserialize, Serialize};

pub const CAR_IDENTIFIER_MAX_CHARS: usize = 8;

/// Who authored a feed entry: this device's confirmed actions (`self` on
/// the wire) or the service push channel (other devices included).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EntryOrigin {
    #[serde(rename = "self")]
    Own,
    #[serde(rename = "remote")]
    Remote,
}

impl EntryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOrigin::Own => "self",
            EntryOrigin::Remote => "remote",
        }
    }
}

/// One immutable item of the conversation view. Never mutated or removed
/// once appended; `sequence_key` is the sole display ordering key.
///
/// The embedded `timestamp` comes from whichever clock authored the entry
/// (server or device) and may repeat or run backwards across origins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub origin: EntryOrigin,
    pub text: Option<String>,
    pub image_ref: Option<String>,
    pub car_identifier: Option<String>,
    pub timestamp: String,
    pub sequence_key: u64,
}

/// A feed entry before the store has assigned its sequence key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedEntryDraft {
    pub origin: EntryOrigin,
    pub text: Option<String>,
    pub image_ref: Option<String>,
    pub car_identifier: Option<String>,
    pub timestamp: String,
}

pub fn truncate_car_identifier(raw: &str) -> String {
    raw.trim().chars().take(CAR_IDENTIFIER_MAX_CHARS).collect()
}

/// Append-only backing sequence of the conversation view.
///
/// Entries render strictly in append (arrival) order regardless of their
/// embedded timestamps, which sidesteps clock skew between device and
/// server. No deduplication: a server echo of a locally-confirmed action
/// appears as a second, distinct entry.
#[derive(Default)]
pub struct FeedStore {
    entries: Vec<FeedEntry>,
    next_key: u64,
    observers: Vec<Box<dyn FnMut(&FeedEntry)>>,
}

impl FeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next sequence key, stores the entry, and notifies
    /// subscribers. The only mutation path into the backing sequence.
    pub fn append(&mut self, draft: FeedEntryDraft) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        let entry = FeedEntry {
            origin: draft.origin,
            text: draft.text,
            image_ref: draft.image_ref,
            car_identifier: draft
                .car_identifier
                .as_deref()
                .map(truncate_car_identifier)
                .filter(|value| !value.is_empty()),
            timestamp: draft.timestamp,
            sequence_key: key,
        };
        self.entries.push(entry);
        if let Some(appended) = self.entries.last() {
            for observer in &mut self.observers {
                observer(appended);
            }
        }
        key
    }

    pub fn snapshot(&self) -> Vec<FeedEntry> {
        self.entries.clone()
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&FeedEntry) + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&FeedEntry> {
        self.entries.last()
    }
}
