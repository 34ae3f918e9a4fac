//! Forwarding policy
//!
//! Every source session owns a subscriber table. Routing a packet takes one
//! immutable snapshot of that table, so a concurrent subscribe/unsubscribe
//! either applies to the whole packet or not at all. Mutations copy the
//! table only while an in-flight packet still holds the previous snapshot.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::handle::PeerHandle;
use crate::packet::MediaKind;
use crate::session::Session;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

bitflags! {
    /// Kinds of content a subscription covers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContentKind: u8 {
        const AUDIO = 0b0000_0001;
        const VIDEO = 0b0000_0010;
        const DATA = 0b0000_0100;
    }
}

impl From<MediaKind> for ContentKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => ContentKind::AUDIO,
            MediaKind::Video => ContentKind::VIDEO,
        }
    }
}

/// Selector used in signaling requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSelector {
    Audio,
    Video,
    Data,
}

impl ContentKind {
    /// Union of the selected kinds; everything when no selection is given
    pub fn from_selectors(selectors: Option<&[MediaSelector]>) -> Self {
        match selectors {
            None => ContentKind::all(),
            Some(selectors) => selectors.iter().fold(ContentKind::empty(), |acc, s| {
                acc | match s {
                    MediaSelector::Audio => ContentKind::AUDIO,
                    MediaSelector::Video => ContentKind::VIDEO,
                    MediaSelector::Data => ContentKind::DATA,
                }
            }),
        }
    }

    pub fn selectors(self) -> Vec<MediaSelector> {
        let mut selectors = Vec::new();
        if self.contains(ContentKind::AUDIO) {
            selectors.push(MediaSelector::Audio);
        }
        if self.contains(ContentKind::VIDEO) {
            selectors.push(MediaSelector::Video);
        }
        if self.contains(ContentKind::DATA) {
            selectors.push(MediaSelector::Data);
        }
        selectors
    }
}

/// One entry of a source's subscriber table
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session: Weak<Session>,
    pub kinds: ContentKind,
}

pub type SubscriberSnapshot = Arc<BTreeMap<PeerHandle, Subscriber>>;

/// Subscribers of one source session
#[derive(Debug)]
pub(crate) struct SubscriberTable {
    /// Cleared when the session is destroyed, so late subscriptions cannot
    /// attach to a session nobody will route for again
    open: bool,
    entries: SubscriberSnapshot,
}

impl SubscriberTable {
    pub(crate) fn new() -> Self {
        SubscriberTable {
            open: true,
            entries: Arc::new(BTreeMap::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> SubscriberSnapshot {
        Arc::clone(&self.entries)
    }

    /// Add or widen a subscription. Returns the resulting kinds, or `None`
    /// when the table is closed.
    pub(crate) fn insert(
        &mut self,
        handle: PeerHandle,
        session: Weak<Session>,
        kinds: ContentKind,
    ) -> Option<ContentKind> {
        if !self.open {
            return None;
        }
        let entries = Arc::make_mut(&mut self.entries);
        let entry = entries
            .entry(handle)
            .and_modify(|existing| {
                existing.session = session.clone();
                existing.kinds |= kinds;
            })
            .or_insert(Subscriber { session, kinds });
        Some(entry.kinds)
    }

    pub(crate) fn remove(&mut self, handle: PeerHandle) -> bool {
        if !self.entries.contains_key(&handle) {
            return false;
        }
        Arc::make_mut(&mut self.entries).remove(&handle).is_some()
    }

    /// Drop every subscriber, returning the released entries
    pub(crate) fn clear(&mut self) -> SubscriberSnapshot {
        std::mem::replace(&mut self.entries, Arc::new(BTreeMap::new()))
    }

    /// Drop every subscriber and refuse new ones for good
    pub(crate) fn close(&mut self) -> SubscriberSnapshot {
        self.open = false;
        self.clear()
    }

    pub(crate) fn contains(&self, handle: PeerHandle) -> bool {
        self.entries.contains_key(&handle)
    }
}

/// Sessions that should receive content of `kind` from `source`
///
/// Only live, active sessions other than the source qualify. Order follows
/// the handle order of the snapshot, so relays are deterministic.
pub(crate) fn resolve_destinations(
    snapshot: &SubscriberSnapshot,
    source: PeerHandle,
    kind: ContentKind,
) -> Vec<Arc<Session>> {
    snapshot
        .iter()
        .filter(|(handle, subscriber)| **handle != source && subscriber.kinds.contains(kind))
        .filter_map(|(_, subscriber)| subscriber.session.upgrade())
        .filter(|session| session.is_active())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_round_trip() {
        assert_eq!(ContentKind::from_selectors(None), ContentKind::all());

        let kinds = ContentKind::from_selectors(Some(&[MediaSelector::Video, MediaSelector::Data]));
        assert_eq!(kinds, ContentKind::VIDEO | ContentKind::DATA);
        assert_eq!(kinds.selectors(), vec![MediaSelector::Video, MediaSelector::Data]);
    }

    #[test]
    fn test_media_kind_mapping() {
        assert_eq!(ContentKind::from(MediaKind::Audio), ContentKind::AUDIO);
        assert_eq!(ContentKind::from(MediaKind::Video), ContentKind::VIDEO);
    }

    #[test]
    fn test_insert_widens_kinds() {
        let mut table = SubscriberTable::new();
        let handle = PeerHandle::new(2);

        assert_eq!(table.insert(handle, Weak::new(), ContentKind::AUDIO), Some(ContentKind::AUDIO));
        assert_eq!(
            table.insert(handle, Weak::new(), ContentKind::VIDEO),
            Some(ContentKind::AUDIO | ContentKind::VIDEO)
        );
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let mut table = SubscriberTable::new();
        table.insert(PeerHandle::new(2), Weak::new(), ContentKind::all());

        let before = table.snapshot();
        table.insert(PeerHandle::new(3), Weak::new(), ContentKind::all());
        table.remove(PeerHandle::new(2));

        assert_eq!(before.keys().copied().collect::<Vec<_>>(), vec![PeerHandle::new(2)]);
        assert_eq!(table.snapshot().keys().copied().collect::<Vec<_>>(), vec![PeerHandle::new(3)]);
    }

    #[test]
    fn test_clear_keeps_table_open_close_does_not() {
        let mut table = SubscriberTable::new();
        table.insert(PeerHandle::new(2), Weak::new(), ContentKind::all());

        let released = table.clear();
        assert_eq!(released.keys().copied().collect::<Vec<_>>(), vec![PeerHandle::new(2)]);
        assert!(table.insert(PeerHandle::new(3), Weak::new(), ContentKind::all()).is_some());

        assert!(table.close().contains_key(&PeerHandle::new(3)));
        assert!(table.snapshot().is_empty());
        assert_eq!(table.insert(PeerHandle::new(4), Weak::new(), ContentKind::all()), None);
    }

    #[test]
    fn test_dead_subscribers_not_resolved() {
        let mut table = SubscriberTable::new();
        table.insert(PeerHandle::new(2), Weak::new(), ContentKind::all());
        let destinations = resolve_destinations(&table.snapshot(), PeerHandle::new(1), ContentKind::AUDIO);
        assert!(destinations.is_empty());
    }
}
