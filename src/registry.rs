//! Arena of live connections addressed by generation-checked handles.
//!
//! Nothing outside a connection's own task holds the connection itself.
//! Handler completions, timer expirations and WebSocket sends only carry a
//! [`ConnectionHandle`]; once the connection is released the handle's
//! generation no longer matches and [`ConnectionRegistry::dispatch`] fails
//! with [`Stale`] instead of reaching a recycled slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::http::handler::StreamPart;
use crate::http::response::Response;
use crate::timer::Expired;
use crate::ws::message::{CloseCode, Message, WsHandler};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide connection identity, starting at 1.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Everything that reaches a connection from outside its own task.
pub enum ConnectionEvent {
    /// A handler completed the slot `seq`.
    Response {
        seq: u64,
        response: Response,
        upgrade: Option<Box<dyn WsHandler>>,
    },
    /// A response of `seq` produced in parts progressed.
    Stream { seq: u64, part: StreamPart },
    /// The responder or response stream for `seq` was dropped unfinished.
    Abandoned { seq: u64 },
    Timeout(Expired),
    WsSend(Message),
    WsClose { code: CloseCode, reason: String },
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Response { seq, response, upgrade } => f
                .debug_struct("Response")
                .field("seq", seq)
                .field("status", &response.status)
                .field("upgrade", &upgrade.is_some())
                .finish(),
            ConnectionEvent::Stream { seq, part } => {
                f.debug_struct("Stream").field("seq", seq).field("part", part).finish()
            }
            ConnectionEvent::Abandoned { seq } => f.debug_struct("Abandoned").field("seq", seq).finish(),
            ConnectionEvent::Timeout(expired) => f.debug_tuple("Timeout").field(expired).finish(),
            ConnectionEvent::WsSend(message) => f.debug_tuple("WsSend").field(message).finish(),
            ConnectionEvent::WsClose { code, reason } => f
                .debug_struct("WsClose")
                .field("code", code)
                .field("reason", reason)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// The addressed connection has been released.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection handle {index}/{generation} is stale")]
pub struct Stale {
    pub index: u32,
    pub generation: u32,
}

impl From<ConnectionHandle> for Stale {
    fn from(handle: ConnectionHandle) -> Self {
        Stale {
            index: handle.index,
            generation: handle.generation,
        }
    }
}

struct Entry {
    generation: u32,
    sender: Option<UnboundedSender<ConnectionEvent>>,
}

#[derive(Default)]
struct Arena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    arena: Mutex<Arena>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a slot and the event channel of a new connection.
    pub fn register(self: &Arc<Self>) -> (Registration, UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut arena = self.lock();

        let handle = match arena.free.pop() {
            Some(index) => {
                let entry = &mut arena.entries[index as usize];
                entry.sender = Some(tx);
                ConnectionHandle {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = arena.entries.len() as u32;
                arena.entries.push(Entry {
                    generation: 0,
                    sender: Some(tx),
                });
                ConnectionHandle { index, generation: 0 }
            }
        };
        arena.live += 1;

        let registration = Registration {
            registry: Arc::clone(self),
            handle,
        };
        (registration, rx)
    }

    /// Delivers `event` to the connection, unless it has been released.
    pub fn dispatch(&self, handle: ConnectionHandle, event: ConnectionEvent) -> Result<(), Stale> {
        let sender = {
            let arena = self.lock();
            match arena.entries.get(handle.index as usize) {
                Some(entry) if entry.generation == handle.generation => entry.sender.clone(),
                _ => None,
            }
        };

        match sender {
            Some(tx) => tx.send(event).map_err(|_| Stale::from(handle)),
            None => Err(Stale::from(handle)),
        }
    }

    /// Invalidates every outstanding handle to the slot and recycles it.
    pub fn release(&self, handle: ConnectionHandle) {
        let mut arena = self.lock();
        let Some(entry) = arena.entries.get_mut(handle.index as usize) else {
            return;
        };
        if entry.generation != handle.generation {
            return;
        }

        entry.generation = entry.generation.wrapping_add(1);
        entry.sender = None;
        arena.free.push(handle.index);
        arena.live -= 1;
    }

    pub fn is_live(&self, handle: ConnectionHandle) -> bool {
        let arena = self.lock();
        arena
            .entries
            .get(handle.index as usize)
            .is_some_and(|entry| entry.generation == handle.generation && entry.sender.is_some())
    }

    /// Number of registered connections.
    pub fn live(&self) -> usize {
        self.lock().live
    }
}

/// A connection's membership in the registry; released on drop.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    handle: ConnectionHandle,
}

impl Registration {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Callback for the timeout guard: routes the expiry back through the
    /// registry so a released connection never sees it.
    pub fn timeout_notifier(&self) -> impl FnOnce(Expired) + Send + 'static {
        let registry = Arc::clone(&self.registry);
        let handle = self.handle;
        move |expired| {
            let _ = registry.dispatch(handle, ConnectionEvent::Timeout(expired));
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.handle);
    }
}
