// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2025 Danmu Console Developers. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Destination-to-handler subscription registry.
//!
//! The registry is the client's durable view of what the application wants
//! to receive. It survives transport drops so the client can replay every
//! destination after a reconnect, and it is independent of the per-session
//! protocol subscription ids the client negotiates with the broker.

use std::{
    fmt::{Debug, Formatter},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use dashmap::DashMap;
use ustr::Ustr;

use crate::message::{ChatHandler, ChatMessage};

/// A registered handler together with the slot id used to remove it.
#[derive(Clone)]
struct HandlerSlot {
    id: u64,
    handler: ChatHandler,
}

/// Outcome of removing a handler from a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// No handler with the given id was registered for the destination.
    NotFound,
    /// The handler was removed and others remain for the destination.
    Removed,
    /// The handler was removed and it was the last one for the destination.
    RemovedLast,
}

/// Maps destinations to the ordered set of handlers subscribed to them.
///
/// Cheap to clone; clones share the underlying map.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<DashMap<Ustr, Vec<HandlerSlot>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `destination` with the given slot id.
    ///
    /// Returns `true` if this is the first handler for the destination, in
    /// which case the caller owes the broker a protocol subscription.
    pub fn insert(&self, destination: Ustr, id: u64, handler: ChatHandler) -> bool {
        let mut entry = self.entries.entry(destination).or_default();
        entry.push(HandlerSlot { id, handler });
        entry.len() == 1
    }

    /// Removes the handler with slot id `id` from `destination`.
    pub fn remove(&self, destination: Ustr, id: u64) -> RemoveOutcome {
        self.remove_with(destination, id, || ())
    }

    /// Removes the handler with slot id `id` from `destination`, running
    /// `on_last` when it was the last one.
    ///
    /// `on_last` executes while the destination's entry is still held, so a
    /// concurrent insert for the same destination is ordered strictly after
    /// the teardown it performs. `on_last` must not touch this registry.
    pub fn remove_with(
        &self,
        destination: Ustr,
        id: u64,
        on_last: impl FnOnce(),
    ) -> RemoveOutcome {
        let outcome = match self.entries.get_mut(&destination) {
            Some(mut slots) => {
                let before = slots.len();
                slots.retain(|slot| slot.id != id);
                if slots.len() == before {
                    RemoveOutcome::NotFound
                } else if slots.is_empty() {
                    on_last();
                    RemoveOutcome::RemovedLast
                } else {
                    RemoveOutcome::Removed
                }
            }
            None => RemoveOutcome::NotFound,
        };

        if outcome == RemoveOutcome::RemovedLast {
            self.entries.remove_if(&destination, |_, slots| slots.is_empty());
        }
        outcome
    }

    /// Invokes every handler registered for `destination` with a clone of
    /// `message`, in registration order. Returns the number of handlers
    /// that completed without panicking.
    ///
    /// A panicking handler is caught and logged; the remaining handlers for
    /// the same message still run.
    pub fn dispatch(&self, destination: Ustr, message: &ChatMessage) -> usize {
        // Snapshot outside the shard lock so handlers can re-enter the registry
        let handlers: Vec<ChatHandler> = match self.entries.get(&destination) {
            Some(slots) => slots.iter().map(|slot| slot.handler.clone()).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for handler in handlers {
            let msg = message.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                tracing::error!(%destination, "Message handler panicked");
            } else {
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns all destinations with at least one handler.
    #[must_use]
    pub fn destinations(&self) -> Vec<Ustr> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Returns the number of handlers registered for `destination`.
    #[must_use]
    pub fn handler_count(&self, destination: Ustr) -> usize {
        self.entries
            .get(&destination)
            .map_or(0, |slots| slots.len())
    }

    /// Returns the number of destinations with at least one handler.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every registered handler.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for entry in self.entries.iter() {
            map.entry(entry.key(), &entry.value().len());
        }
        map.finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use rstest::rstest;

    use super::*;

    fn counting_handler(counter: Arc<AtomicUsize>) -> ChatHandler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[rstest]
    fn test_insert_reports_first_handler() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(registry.insert(dest, 1, counting_handler(counter.clone())));
        assert!(!registry.insert(dest, 2, counting_handler(counter)));
        assert_eq!(registry.handler_count(dest), 2);
    }

    #[rstest]
    fn test_dispatch_runs_handlers_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, tag) in ["first", "second", "third"].into_iter().enumerate() {
            let order = order.clone();
            registry.insert(
                dest,
                id as u64,
                Arc::new(move |_| order.lock().unwrap().push(tag)),
            );
        }

        let delivered = registry.dispatch(dest, &ChatMessage::new("alice", "hi"));
        assert_eq!(delivered, 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[rstest]
    fn test_dispatch_to_unknown_destination_is_noop() {
        let registry = SubscriptionRegistry::new();
        let delivered =
            registry.dispatch(Ustr::from("/topic/nowhere"), &ChatMessage::new("a", "b"));
        assert_eq!(delivered, 0);
    }

    #[rstest]
    fn test_panicking_handler_does_not_starve_others() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let counter = Arc::new(AtomicUsize::new(0));

        registry.insert(dest, 1, Arc::new(|_| panic!("handler bug")));
        registry.insert(dest, 2, counting_handler(counter.clone()));
        registry.insert(dest, 3, counting_handler(counter.clone()));

        // The panicking handler does not count as delivered
        let delivered = registry.dispatch(dest, &ChatMessage::new("alice", "hi"));
        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    fn test_remove_outcomes() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let counter = Arc::new(AtomicUsize::new(0));

        registry.insert(dest, 1, counting_handler(counter.clone()));
        registry.insert(dest, 2, counting_handler(counter));

        assert_eq!(registry.remove(dest, 99), RemoveOutcome::NotFound);
        assert_eq!(registry.remove(dest, 1), RemoveOutcome::Removed);
        assert_eq!(registry.remove(dest, 1), RemoveOutcome::NotFound);
        assert_eq!(registry.remove(dest, 2), RemoveOutcome::RemovedLast);
        assert_eq!(registry.remove(dest, 2), RemoveOutcome::NotFound);
    }

    #[rstest]
    fn test_remove_with_runs_teardown_only_on_last() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let counter = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        registry.insert(dest, 1, counting_handler(counter.clone()));
        registry.insert(dest, 2, counting_handler(counter));

        let t = teardowns.clone();
        let outcome = registry.remove_with(dest, 1, || {
            t.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(outcome, RemoveOutcome::Removed);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        let t = teardowns.clone();
        let outcome = registry.remove_with(dest, 2, || {
            t.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(outcome, RemoveOutcome::RemovedLast);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        let t = teardowns.clone();
        let outcome = registry.remove_with(dest, 2, || {
            t.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(outcome, RemoveOutcome::NotFound);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_insert_during_teardown_lands_after_it() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let counter = Arc::new(AtomicUsize::new(0));

        registry.insert(dest, 1, counting_handler(counter.clone()));

        // The insert issued from inside the teardown observes the emptied
        // entry, so it reports itself as the first handler again
        let registry_in = registry.clone();
        let handler = counting_handler(counter);
        let mut first = false;
        std::thread::scope(|scope| {
            let outcome = registry.remove_with(dest, 1, || {
                let registry_in = &registry_in;
                let handler = handler.clone();
                let first = &mut first;
                scope.spawn(move || {
                    *first = registry_in.insert(dest, 2, handler);
                });
            });
            assert_eq!(outcome, RemoveOutcome::RemovedLast);
        });

        assert!(first);
        assert_eq!(registry.handler_count(dest), 1);
    }

    #[rstest]
    fn test_last_removal_drops_destination_entry() {
        let registry = SubscriptionRegistry::new();
        let dest = Ustr::from("/topic/room/1");
        let counter = Arc::new(AtomicUsize::new(0));

        registry.insert(dest, 1, counting_handler(counter));
        assert_eq!(registry.len(), 1);

        registry.remove(dest, 1);
        assert!(registry.is_empty());
        assert!(registry.destinations().is_empty());
    }

    #[rstest]
    fn test_clear_empties_all_destinations() {
        let registry = SubscriptionRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.insert(Ustr::from("/topic/a"), 1, counting_handler(counter.clone()));
        registry.insert(Ustr::from("/topic/b"), 2, counting_handler(counter));
        registry.clear();

        assert!(registry.is_empty());
        assert_eq!(
            registry.dispatch(Ustr::from("/topic/a"), &ChatMessage::new("x", "y")),
            0
        );
    }
}
