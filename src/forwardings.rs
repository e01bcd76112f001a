use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

// One active endpoint registration. Fields are constant after creation; the
// accept loop owns the listener itself, and cancelling `shutdown` is the one
// and only way to close it.
pub(crate) struct ForwardingEntry {
    // Identity of this registration, guarding removals against stale loops.
    id: usize,
    // ID of the SSH connection that registered this endpoint.
    session_id: usize,
    // Cancelled to make the endpoint's accept loop close its listener.
    shutdown: CancellationToken,
}

// Map of rendezvous socket path to its active registration. Keys are unique;
// a second registration under a live key is refused rather than replaced.
pub(crate) struct ForwardingMap {
    map: DashMap<PathBuf, ForwardingEntry>,
    next_registration: AtomicUsize,
}

impl ForwardingMap {
    pub(crate) fn new() -> Self {
        ForwardingMap {
            map: DashMap::new(),
            next_registration: AtomicUsize::new(0),
        }
    }

    // Insert a registration, handing back its identity and shutdown token.
    pub(crate) fn register(
        &self,
        socket: PathBuf,
        session_id: usize,
    ) -> anyhow::Result<(usize, CancellationToken)> {
        match self.map.entry(socket) {
            Entry::Occupied(_) => Err(ServerError::AlreadyRegistered.into()),
            Entry::Vacant(vacant) => {
                let id = self.next_registration.fetch_add(1, Ordering::AcqRel);
                let shutdown = CancellationToken::new();
                vacant.insert(ForwardingEntry {
                    id,
                    session_id,
                    shutdown: shutdown.clone(),
                });
                Ok((id, shutdown))
            }
        }
    }

    // Close the endpoint registered under `socket`, if any. The accept loop
    // removes the entry once its listener is gone, so calling this twice (or
    // for an absent key) is harmless. Returns whether a registration was hit.
    pub(crate) fn cancel(&self, socket: &Path) -> bool {
        match self.map.get(socket) {
            Some(entry) => {
                entry.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    // Close the endpoint registered under `socket`, but only if it is still
    // the given registration. Lets per-connection supervisors tear down their
    // own endpoint without destroying a newer one under the same key.
    pub(crate) fn shutdown_if_current(&self, socket: &Path, id: usize) {
        if let Some(entry) = self.map.get(socket) {
            if entry.id == id {
                entry.shutdown.cancel();
            }
        }
    }

    // Remove the entry for `socket` if it still belongs to the given
    // registration. Called by the accept loop as its final step.
    pub(crate) fn remove_if_current(&self, socket: &Path, id: usize) {
        self.map.remove_if(socket, |_, entry| entry.id == id);
    }

    pub(crate) fn exists(&self, socket: &Path) -> bool {
        self.map.contains_key(socket)
    }

    // Snapshot of the socket paths registered by one SSH connection.
    pub(crate) fn owned_by(&self, session_id: usize) -> Vec<PathBuf> {
        self.map
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect()
    }
}
