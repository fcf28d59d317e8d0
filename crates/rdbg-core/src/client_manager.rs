//! Authoritative registry of connected clients.
//!
//! The manager keeps an arena of slots keyed by [`ClientId`]. Each slot
//! carries a borrow counter and a "marked for removal" flag, and a client
//! is deleted **iff** it is marked and its counter is zero:
//!
//! - [`ClientManager::get_client`] hands out a [`ClientLease`] and bumps
//!   the counter; dropping the lease (or passing it to
//!   [`ClientManager::return_client`]) decrements it.
//! - [`ClientManager::remove_client`] deletes an idle client right away,
//!   otherwise it only marks the slot.
//! - [`ClientManager::periodic_cleanup`] sweeps marked slots whose counter
//!   has since dropped to zero. The network loop calls it on every
//!   iteration; nothing sweeps spontaneously.
//!
//! Lifecycle events are delivered to registered [`ClientEventHandler`]s
//! after the manager lock has been released, so handlers may re-enter the
//! manager freely.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::client::Client;
use crate::command::Command;
use crate::error::ManagerError;
use crate::types::ClientId;

/// Default upper bound on simultaneously registered clients.
pub const DEFAULT_MAX_CLIENTS: usize = 1024;

/// Client lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Added(ClientId),
    Removed(ClientId),
    MarkedToRemove(ClientId),
}

impl ClientEvent {
    /// Numeric event code used in logs.
    pub fn code(self) -> u8 {
        match self {
            ClientEvent::Added(_) => 1,
            ClientEvent::Removed(_) => 2,
            ClientEvent::MarkedToRemove(_) => 3,
        }
    }

    pub fn client_id(self) -> ClientId {
        match self {
            ClientEvent::Added(id) | ClientEvent::Removed(id) | ClientEvent::MarkedToRemove(id) => id,
        }
    }
}

/// Receiver of [`ClientEvent`]s.
pub trait ClientEventHandler: Send + Sync {
    fn handle(&self, manager: &ClientManager, event: ClientEvent);
}

/// Result of [`ClientManager::remove_client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Deleted immediately.
    Removed,
    /// Still borrowed; will be deleted by a later cleanup pass.
    MarkedForRemoval,
    NotFound,
}

struct ClientSlot {
    client: Arc<Client>,
    borrows: usize,
    marked: bool,
}

pub struct ClientManager {
    slots: Mutex<IndexMap<ClientId, ClientSlot>>,
    handlers: RwLock<Vec<Weak<dyn ClientEventHandler>>>,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            slots: Mutex::new(IndexMap::new()),
            handlers: RwLock::new(Vec::new()),
            max_clients,
        }
    }

    /// Subscribe to lifecycle events. Handlers are held weakly.
    pub fn add_event_handler(&self, handler: Weak<dyn ClientEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a client under its id and emit [`ClientEvent::Added`].
    pub fn add_client(&self, client: Client) -> Result<ClientId, ManagerError> {
        let id = client.id();
        {
            let mut slots = self.lock();
            if slots.contains_key(&id) {
                return Err(ManagerError::IllegalArgument(format!(
                    "client {id} is already registered"
                )));
            }
            if slots.len() >= self.max_clients {
                return Err(ManagerError::TooManyClients(self.max_clients));
            }
            slots.insert(
                id,
                ClientSlot {
                    client: Arc::new(client),
                    borrows: 0,
                    marked: false,
                },
            );
        }

        debug!(client_id = %id, "client added");
        self.fire(ClientEvent::Added(id));
        Ok(id)
    }

    /// Borrow a client. Clients already marked for removal are not handed out.
    pub fn get_client(&self, id: ClientId) -> Option<ClientLease<'_>> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&id)?;
        if slot.marked {
            return None;
        }
        slot.borrows += 1;
        Some(ClientLease {
            manager: self,
            client: Arc::clone(&slot.client),
        })
    }

    /// Give a borrowed client back. Equivalent to dropping the lease.
    pub fn return_client(&self, lease: ClientLease<'_>) {
        drop(lease);
    }

    /// Remove now if idle, otherwise mark for the next cleanup pass.
    pub fn remove_client(&self, id: ClientId) -> RemoveOutcome {
        let (outcome, client) = {
            let mut slots = self.lock();
            match slots.get(&id).map(|slot| (slot.borrows, slot.marked)) {
                None => return RemoveOutcome::NotFound,
                Some((_, true)) => return RemoveOutcome::MarkedForRemoval,
                Some((0, false)) => match slots.shift_remove(&id) {
                    Some(slot) => (RemoveOutcome::Removed, slot.client),
                    None => return RemoveOutcome::NotFound,
                },
                Some((_, false)) => match slots.get_mut(&id) {
                    Some(slot) => {
                        slot.marked = true;
                        (RemoveOutcome::MarkedForRemoval, Arc::clone(&slot.client))
                    }
                    None => return RemoveOutcome::NotFound,
                },
            }
        };

        // Wakes any borrower blocked on the client's queues so it can
        // hand its lease back.
        client.close();

        match outcome {
            RemoveOutcome::Removed => {
                debug!(client_id = %id, "client removed");
                self.fire(ClientEvent::Removed(id));
            }
            _ => {
                debug!(client_id = %id, "client in use, marked for removal");
                self.fire(ClientEvent::MarkedToRemove(id));
            }
        }
        outcome
    }

    /// Delete every marked client whose borrow count has reached zero.
    ///
    /// Returns the number of clients deleted.
    pub fn periodic_cleanup(&self) -> usize {
        let swept: Vec<ClientSlot> = {
            let mut slots = self.lock();
            let ready: Vec<ClientId> = slots
                .iter()
                .filter(|(_, slot)| slot.marked && slot.borrows == 0)
                .map(|(id, _)| *id)
                .collect();
            ready
                .into_iter()
                .filter_map(|id| slots.shift_remove(&id))
                .collect()
        };

        for slot in &swept {
            let id = slot.client.id();
            debug!(client_id = %id, "marked client swept");
            self.fire(ClientEvent::Removed(id));
        }
        swept.len()
    }

    /// Try to remove every client.
    ///
    /// Fails with [`ManagerError::CannotRemoveConnections`] while some are
    /// still borrowed; the caller is expected to retry.
    pub fn stop(&self) -> Result<(), ManagerError> {
        for id in self.all_ids() {
            self.remove_client(id);
        }
        self.periodic_cleanup();

        let remaining = self.lock().len();
        if remaining > 0 {
            return Err(ManagerError::CannotRemoveConnections { remaining });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Best-effort, non-blocking delivery to every current client.
    ///
    /// Clients whose output queue is full, or that vanished since the id
    /// snapshot, are skipped. Returns the number of clients reached.
    pub fn broadcast(&self, command: &Command) -> usize {
        let mut delivered = 0;
        for id in self.client_ids() {
            let Some(client) = self.get_client(id) else {
                continue;
            };
            let mut copy = command.clone();
            copy.client_id = id;
            match client.out_queue().add(copy) {
                Ok(()) => delivered += 1,
                Err(_) => debug!(client_id = %id, "output queue full, broadcast skipped"),
            }
        }
        delivered
    }

    /// Blocking send to one client, or broadcast for [`ClientId::BROADCAST`].
    ///
    /// Returns `false` when the target no longer exists or was closed
    /// while the send was waiting for queue space.
    pub fn send_command(&self, command: Command) -> bool {
        if command.is_broadcast() {
            self.broadcast(&command);
            return true;
        }
        let Some(client) = self.get_client(command.client_id) else {
            return false;
        };
        client.out_queue().push(command).is_ok()
    }

    /// Non-blocking variant of [`send_command`](Self::send_command).
    ///
    /// Used from the I/O thread, which must never wait on a client queue.
    pub fn post_command(&self, command: Command) -> bool {
        if command.is_broadcast() {
            self.broadcast(&command);
            return true;
        }
        let id = command.client_id;
        let Some(client) = self.get_client(id) else {
            return false;
        };
        match client.out_queue().add(command) {
            Ok(()) => true,
            Err(_) => {
                warn!(client_id = %id, "output queue full, reply dropped");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Ids of clients not marked for removal, in connect order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.lock()
            .iter()
            .filter(|(_, slot)| !slot.marked)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of clients not marked for removal.
    pub fn client_count(&self) -> usize {
        self.lock().values().filter(|slot| !slot.marked).count()
    }

    /// Whether the arena still holds `id` (marked or not).
    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    fn all_ids(&self) -> Vec<ClientId> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<ClientId, ClientSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: ClientId) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&id) {
            slot.borrows = slot.borrows.saturating_sub(1);
        }
    }

    fn fire(&self, event: ClientEvent) {
        let handlers: Vec<Arc<dyn ClientEventHandler>> = {
            let mut handlers = self
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.retain(|h| h.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };
        for handler in handlers {
            handler.handle(self, event);
        }
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientManager")
            .field("clients", &self.lock().len())
            .field("max_clients", &self.max_clients)
            .finish()
    }
}

/// A borrowed client. The borrow is returned when the lease is dropped.
pub struct ClientLease<'a> {
    manager: &'a ClientManager,
    client: Arc<Client>,
}

impl Deref for ClientLease<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Drop for ClientLease<'_> {
    fn drop(&mut self) {
        self.manager.release(self.client.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextId;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ClientEvent>>);

    impl ClientEventHandler for Recorder {
        fn handle(&self, _manager: &ClientManager, event: ClientEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn manager_with_recorder() -> (ClientManager, Arc<Recorder>) {
        let manager = ClientManager::new(8);
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ClientEventHandler> = Arc::downgrade(&recorder) as Weak<dyn ClientEventHandler>;
        manager.add_event_handler(weak);
        (manager, recorder)
    }

    #[test]
    fn idle_client_is_removed_immediately() {
        let (manager, recorder) = manager_with_recorder();
        manager.add_client(Client::new(ClientId(1), 4)).unwrap();

        assert_eq!(manager.remove_client(ClientId(1)), RemoveOutcome::Removed);
        assert!(!manager.contains(ClientId(1)));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![ClientEvent::Added(ClientId(1)), ClientEvent::Removed(ClientId(1))]
        );
    }

    #[test]
    fn borrowed_client_is_marked_then_swept() {
        let (manager, recorder) = manager_with_recorder();
        manager.add_client(Client::new(ClientId(7), 4)).unwrap();

        let lease = manager.get_client(ClientId(7)).unwrap();
        assert_eq!(manager.remove_client(ClientId(7)), RemoveOutcome::MarkedForRemoval);
        assert!(manager.contains(ClientId(7)));
        assert!(manager.get_client(ClientId(7)).is_none());
        assert_eq!(manager.client_count(), 0);

        // Still borrowed: sweeping must not delete it.
        assert_eq!(manager.periodic_cleanup(), 0);
        assert!(manager.contains(ClientId(7)));

        manager.return_client(lease);
        assert!(manager.contains(ClientId(7)));
        assert_eq!(manager.periodic_cleanup(), 1);
        assert!(!manager.contains(ClientId(7)));

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ClientEvent::Added(ClientId(7)),
                ClientEvent::MarkedToRemove(ClientId(7)),
                ClientEvent::Removed(ClientId(7)),
            ]
        );
    }

    #[test]
    fn nested_borrows_must_all_return() {
        let manager = ClientManager::new(8);
        manager.add_client(Client::new(ClientId(2), 4)).unwrap();

        let first = manager.get_client(ClientId(2)).unwrap();
        let second = manager.get_client(ClientId(2)).unwrap();
        manager.remove_client(ClientId(2));

        drop(first);
        assert_eq!(manager.periodic_cleanup(), 0);
        drop(second);
        assert_eq!(manager.periodic_cleanup(), 1);
        assert_eq!(manager.periodic_cleanup(), 0);
    }

    #[test]
    fn duplicate_and_overflow_registrations_are_rejected() {
        let manager = ClientManager::new(1);
        manager.add_client(Client::new(ClientId(1), 4)).unwrap();

        assert!(matches!(
            manager.add_client(Client::new(ClientId(1), 4)),
            Err(ManagerError::IllegalArgument(_))
        ));
        assert_eq!(
            manager.add_client(Client::new(ClientId(2), 4)),
            Err(ManagerError::TooManyClients(1))
        );
    }

    #[test]
    fn broadcast_skips_full_client() {
        let manager = ClientManager::new(8);
        manager.add_client(Client::new(ClientId(1), 1)).unwrap();
        manager.add_client(Client::new(ClientId(2), 1)).unwrap();
        manager.add_client(Client::new(ClientId(3), 1)).unwrap();

        // Fill client 2.
        assert!(manager.post_command(Command::control(ClientId(2), "filler")));

        let delivered = manager.broadcast(&Command::broadcast(ContextId(4), "hello"));
        assert_eq!(delivered, 2);

        for id in [1, 3] {
            let client = manager.get_client(ClientId(id)).unwrap();
            let cmd = client.out_queue().get().unwrap();
            assert_eq!(cmd.client_id, ClientId(id));
            assert_eq!(cmd.context_id, ContextId(4));
            assert_eq!(cmd.payload, "hello");
        }
        let client = manager.get_client(ClientId(2)).unwrap();
        assert_eq!(client.out_queue().get().unwrap().payload, "filler");
        assert!(client.out_queue().is_empty());
    }

    #[test]
    fn send_command_to_missing_client_fails() {
        let manager = ClientManager::new(8);
        assert!(!manager.send_command(Command::control(ClientId(9), "x")));
        assert!(manager.send_command(Command::broadcast(ContextId::NONE, "x")));
    }

    #[test]
    fn blocked_sender_unwinds_when_client_is_swept() {
        let manager = Arc::new(ClientManager::new(8));
        manager.add_client(Client::new(ClientId(1), 1)).unwrap();
        assert!(manager.send_command(Command::control(ClientId(1), "fills the queue")));

        let sender = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.send_command(Command::control(ClientId(1), "blocked")))
        };
        thread::sleep(Duration::from_millis(50));

        // The sender holds a borrow, so this only marks the client.
        assert_eq!(manager.remove_client(ClientId(1)), RemoveOutcome::MarkedForRemoval);
        assert!(!sender.join().unwrap());
        assert_eq!(manager.periodic_cleanup(), 1);
    }

    #[test]
    fn stop_reports_borrowed_clients() {
        let manager = ClientManager::new(8);
        manager.add_client(Client::new(ClientId(1), 4)).unwrap();
        manager.add_client(Client::new(ClientId(2), 4)).unwrap();

        let lease = manager.get_client(ClientId(2)).unwrap();
        assert_eq!(
            manager.stop(),
            Err(ManagerError::CannotRemoveConnections { remaining: 1 })
        );
        drop(lease);
        assert_eq!(manager.stop(), Ok(()));
    }
}
