//! Remote identity records and the process-wide registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use stagelink_core::{NetworkAddress, RemoteId};

/// The abstract identity of a peer, independent of any connection instance.
///
/// Immutable after construction. Within one process a given id maps to
/// exactly one live `Remote` instance, shared by `Rc`.
#[derive(Debug, PartialEq, Eq)]
pub struct Remote {
    /// Stable 128-bit identity of the peer process.
    pub id: RemoteId,
    /// The peer's stream endpoint.
    pub stream_addr: NetworkAddress,
    /// The peer's datagram endpoint.
    pub datagram_addr: NetworkAddress,
}

/// Process-wide table mapping remote ids to their [`Remote`] instances.
///
/// Created lazily on first use and never torn down for the process lifetime.
/// State is thread-local, matching the single-threaded cooperative scheduler
/// everything else runs on.
pub struct RemoteRegistry;

thread_local! {
    static REMOTES: RefCell<HashMap<RemoteId, Rc<Remote>>> = RefCell::new(HashMap::new());
}

impl RemoteRegistry {
    /// Look up an existing remote by id.
    pub fn get(id: RemoteId) -> Option<Rc<Remote>> {
        REMOTES.with(|remotes| remotes.borrow().get(&id).cloned())
    }

    /// Get the remote for `id`, creating it if absent.
    ///
    /// Idempotent: a repeated request with matching addresses returns the
    /// existing instance. A peer that comes back on different ports (fresh
    /// ephemeral binds after a restart) replaces the record - the table
    /// still holds exactly one `Remote` per id.
    pub fn get_or_insert(
        id: RemoteId,
        stream_addr: NetworkAddress,
        datagram_addr: NetworkAddress,
    ) -> Rc<Remote> {
        debug_assert!(!id.is_broadcast(), "broadcast id is never registered");
        REMOTES.with(|remotes| {
            let mut remotes = remotes.borrow_mut();
            if let Some(existing) = remotes.get(&id) {
                if existing.stream_addr == stream_addr && existing.datagram_addr == datagram_addr {
                    return existing.clone();
                }
                tracing::warn!(
                    remote = %id,
                    old_stream = %existing.stream_addr,
                    new_stream = %stream_addr,
                    "remote re-registered with different endpoints, replacing"
                );
            }
            let remote = Rc::new(Remote {
                id,
                stream_addr,
                datagram_addr,
            });
            remotes.insert(id, remote.clone());
            remote
        })
    }

    /// Number of registered remotes.
    pub fn len() -> usize {
        REMOTES.with(|remotes| remotes.borrow().len())
    }

    /// Whether no remote has been registered yet.
    pub fn is_empty() -> bool {
        Self::len() == 0
    }
}
