use std::{collections::HashMap, fmt, sync::Arc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::server::{client::Client, health::HealthMetrics};

/// The role a connection currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Admin,
    #[default]
    Viewer,
}

impl Role {
    /// Interprets the `role` field of a hello. Anything other than a
    /// case-insensitive `"admin"` is a viewer.
    pub fn from_hello(role: Option<&str>) -> Self {
        match role {
            Some(role) if role.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::Viewer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

struct Entry {
    client: Client,
    role: Role,
    /// Join order, used to keep snapshots stable.
    joined: u64,
}

#[derive(Default)]
struct Connections {
    entries: HashMap<Uuid, Entry>,
    joins: u64,
}

/// The set of live connections and the role each one holds.
///
/// One lock guards the whole map, so every operation is linearizable: a
/// snapshot is exactly the set registered at some instant between its call
/// and its return. The map is never handed out; iteration always goes
/// through [`snapshot`].
///
/// [`snapshot`]: ClientRegistry::snapshot
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<Connections>>,
    pub(crate) metrics: HealthMetrics,
}

impl ClientRegistry {
    /// Creates an empty registry reporting its size to `metrics`.
    pub fn new(metrics: HealthMetrics) -> Self {
        Self {
            clients: Arc::new(RwLock::new(Connections::default())),
            metrics,
        }
    }

    /// Registers a connection as a viewer. Re-adding an existing connection
    /// resets it to a viewer.
    pub fn add(&self, client: Client) {
        let id = client.id;
        let mut clients = self.clients.write();
        let joined = clients.joins;
        clients.joins += 1;
        clients.entries.insert(id, Entry { client, role: Role::Viewer, joined });
        self.metrics.connections.set(clients.entries.len() as i64);
        drop(clients);
        debug!(%id, "client registered");
    }

    /// Updates the role of a registered connection. Does nothing if the
    /// connection has already been removed.
    pub fn set_role(&self, id: &Uuid, role: Role) {
        if let Some(entry) = self.clients.write().entries.get_mut(id) {
            entry.role = role;
        }
    }

    /// Removes a connection. Returns whether it was registered.
    pub fn remove(&self, id: &Uuid) -> bool {
        let mut clients = self.clients.write();
        let removed = clients.entries.remove(id).is_some();
        if removed {
            self.metrics.connections.set(clients.entries.len() as i64);
        }
        drop(clients);
        if removed {
            debug!(%id, "client unregistered");
        }
        removed
    }

    /// The role of a connection, or `None` if it is not registered.
    pub fn role_of(&self, id: &Uuid) -> Option<Role> {
        self.clients.read().entries.get(id).map(|entry| entry.role)
    }

    /// Copies out the registered connections in join order, leaving out
    /// `exclude` if given.
    ///
    /// The returned handles are independent of the registry, so callers can
    /// send to them while other tasks add and remove connections.
    pub fn snapshot(&self, exclude: Option<&Uuid>) -> Vec<Client> {
        let mut entries: Vec<(u64, Client)> = self
            .clients
            .read()
            .entries
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .map(|(_, entry)| (entry.joined, entry.client.clone()))
            .collect();
        entries.sort_unstable_by_key(|(joined, _)| *joined);
        entries.into_iter().map(|(_, client)| client).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().entries.is_empty()
    }

    /// Closes and forgets every connection.
    pub fn clear(&self) {
        for client in self.snapshot(None) {
            self.remove(&client.id);
            client.close(None);
        }
    }
}
