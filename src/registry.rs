//! Connected clients and the tunnels bound to agents.
//!
//! The registry is the only owner of [`ClientRecord`] and [`Tunnel`] values.
//! Both tables sit behind one lock so an agent's record and its tunnel always
//! appear and disappear together.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::messages::ClientType;

/// Which side of the tunnel a client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    /// Runs next to the private local app and answers forwarded requests.
    Agent,
    /// Issues requests that must reach the agent's local app.
    Browser,
}

impl ClientRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Browser => "browser",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            Self::Agent => "laptop",
            Self::Browser => "browser",
        }
    }
}

impl From<ClientType> for ClientRole {
    fn from(t: ClientType) -> Self {
        match t {
            ClientType::Laptop => Self::Agent,
            ClientType::Browser | ClientType::Unspecified => Self::Browser,
        }
    }
}

/// Whether a registered client has been heard from recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Active,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRecord {
    pub id: String,
    pub role: ClientRole,
    pub registered_at_ms: u64,
    pub last_seen_ms: u64,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_app_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub id: String,
    pub agent_client_id: String,
    pub created_at_ms: u64,
}

/// Result of [`ClientRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub record: ClientRecord,
    /// Present for agents only.
    pub tunnel: Option<Tunnel>,
    /// The declared id was already known; this is a reconnect.
    pub reconnected: bool,
}

/// What [`ClientRegistry::unregister`] took out.
#[derive(Debug, Clone)]
pub struct Removed {
    pub record: ClientRecord,
    pub tunnel: Option<Tunnel>,
}

/// Optional details a client declares at registration.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub declared_id: Option<String>,
    pub capabilities: Vec<String>,
    pub local_app_url: Option<String>,
}

#[derive(Default)]
struct Tables {
    clients: HashMap<String, ClientRecord>,
    tunnels: HashMap<String, Tunnel>,
    /// agent client id -> tunnel id
    tunnel_by_agent: HashMap<String, String>,
}

impl Tables {
    fn drop_tunnel_of(&mut self, agent_id: &str) -> Option<Tunnel> {
        let tunnel_id = self.tunnel_by_agent.remove(agent_id)?;
        self.tunnels.remove(&tunnel_id)
    }
}

pub struct ClientRegistry {
    tables: RwLock<Tables>,
    clock: SharedClock,
    /// A client not seen for this long is reported idle.
    active_window_ms: u64,
    /// A client not seen for this long is evicted by [`sweep_idle`](Self::sweep_idle).
    idle_timeout_ms: u64,
}

impl ClientRegistry {
    pub fn new(clock: SharedClock, active_window_ms: u64, idle_timeout_ms: u64) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            active_window_ms,
            idle_timeout_ms,
        }
    }

    /// Register a client. A declared id that is already known is treated as
    /// the same client reconnecting: its record is refreshed and, for agents,
    /// its existing tunnel is kept.
    pub async fn register(&self, role: ClientRole, info: ClientInfo) -> Registration {
        let now = self.clock.now_ms();
        let id = info
            .declared_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_id(role.id_prefix()));

        let mut tables = self.tables.write().await;
        let reconnected = tables.clients.contains_key(&id);
        let registered_at_ms = tables
            .clients
            .get(&id)
            .map_or(now, |existing| existing.registered_at_ms);

        let record = ClientRecord {
            id: id.clone(),
            role,
            registered_at_ms,
            last_seen_ms: now,
            capabilities: info.capabilities,
            local_app_url: info.local_app_url,
        };
        tables.clients.insert(id.clone(), record.clone());

        let tunnel = match role {
            ClientRole::Agent => {
                let existing = tables
                    .tunnel_by_agent
                    .get(&id)
                    .and_then(|tid| tables.tunnels.get(tid))
                    .cloned();
                Some(existing.unwrap_or_else(|| {
                    let tunnel = Tunnel {
                        id: generate_id("tunnel"),
                        agent_client_id: id.clone(),
                        created_at_ms: now,
                    };
                    tables
                        .tunnel_by_agent
                        .insert(id.clone(), tunnel.id.clone());
                    tables.tunnels.insert(tunnel.id.clone(), tunnel.clone());
                    tunnel
                }))
            }
            ClientRole::Browser => {
                if tables.drop_tunnel_of(&id).is_some() {
                    warn!(client_id = %id, "Agent re-registered as browser, tunnel dropped");
                }
                None
            }
        };

        info!(
            client_id = %id,
            role = role.as_str(),
            reconnected,
            "Client registered"
        );
        Registration {
            record,
            tunnel,
            reconnected,
        }
    }

    /// Refresh `last_seen`. Returns `false` for unknown clients.
    pub async fn touch(&self, client_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        match tables.clients.get_mut(client_id) {
            Some(record) => {
                record.last_seen_ms = now;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientRecord> {
        self.tables.read().await.clients.get(client_id).cloned()
    }

    /// Remove a client and, for an agent, its tunnel in the same critical section.
    pub async fn unregister(&self, client_id: &str) -> Option<Removed> {
        let mut tables = self.tables.write().await;
        let record = tables.clients.remove(client_id)?;
        let tunnel = tables.drop_tunnel_of(client_id);
        info!(client_id, role = record.role.as_str(), "Client unregistered");
        Some(Removed { record, tunnel })
    }

    /// Agent that should serve the next browser request.
    ///
    /// Among agents holding a tunnel, the most recently seen wins; ties go
    /// to the lexically smallest id so the choice never depends on map order.
    pub async fn find_any_agent(&self) -> Option<ClientRecord> {
        let tables = self.tables.read().await;
        tables
            .clients
            .values()
            .filter(|c| c.role == ClientRole::Agent && tables.tunnel_by_agent.contains_key(&c.id))
            .max_by(|a, b| {
                a.last_seen_ms
                    .cmp(&b.last_seen_ms)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned()
    }

    /// Most recently seen browser, used when a request carries no identity.
    pub async fn find_any_browser(&self) -> Option<ClientRecord> {
        let tables = self.tables.read().await;
        tables
            .clients
            .values()
            .filter(|c| c.role == ClientRole::Browser)
            .max_by(|a, b| {
                a.last_seen_ms
                    .cmp(&b.last_seen_ms)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned()
    }

    /// Does `tunnel_id` belong to the live agent `client_id`?
    pub async fn validate_tunnel(&self, client_id: &str, tunnel_id: &str) -> bool {
        let tables = self.tables.read().await;
        tables
            .tunnels
            .get(tunnel_id)
            .is_some_and(|t| t.agent_client_id == client_id)
            && tables.clients.contains_key(client_id)
    }

    pub async fn tunnel_of(&self, agent_id: &str) -> Option<Tunnel> {
        let tables = self.tables.read().await;
        tables
            .tunnel_by_agent
            .get(agent_id)
            .and_then(|tid| tables.tunnels.get(tid))
            .cloned()
    }

    pub fn liveness(&self, record: &ClientRecord) -> Liveness {
        let age = self.clock.now_ms().saturating_sub(record.last_seen_ms);
        if age <= self.active_window_ms {
            Liveness::Active
        } else {
            Liveness::Idle
        }
    }

    /// Evict every client whose `last_seen` is older than the idle timeout.
    pub async fn sweep_idle(&self) -> Vec<Removed> {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        let stale: Vec<String> = tables
            .clients
            .values()
            .filter(|c| now.saturating_sub(c.last_seen_ms) > self.idle_timeout_ms)
            .map(|c| c.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(record) = tables.clients.remove(&id) {
                let tunnel = tables.drop_tunnel_of(&id);
                warn!(client_id = %id, role = record.role.as_str(), "Evicted idle client");
                removed.push(Removed { record, tunnel });
            }
        }
        removed
    }

    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        let tables = self.tables.read().await;
        let mut list: Vec<ClientRecord> = tables.clients.values().cloned().collect();
        list.sort_by(|a, b| a.registered_at_ms.cmp(&b.registered_at_ms).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn counts(&self) -> (usize, usize) {
        let tables = self.tables.read().await;
        (tables.clients.len(), tables.tunnels.len())
    }
}

fn generate_id(prefix: &str) -> String {
    crate::frame::new_frame_id(prefix)
}
