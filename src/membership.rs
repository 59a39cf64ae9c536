use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Left,
    Reaped,
    Failed,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Left => write!(f, "left"),
            MemberStatus::Reaped => write!(f, "reaped"),
            MemberStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A cluster member as reported by the gossip layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: String,
    pub region: String,
    /// True for servers participating in consensus, false for client
    /// agents.
    pub server: bool,
    pub bootstrap: bool,
    pub status: MemberStatus,
}

impl Member {
    pub fn server(
        name: impl Into<String>,
        addr: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            region: region.into(),
            server: true,
            bootstrap: false,
            status: MemberStatus::Alive,
        }
    }

    pub fn with_bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }
}

/// Source of cluster membership. The gossip layer is out of scope; its
/// member table is consumed through this seam and its events arrive on
/// the channel handed to the server at construction.
pub trait MembershipSource: Send + Sync {
    fn members(&self) -> Vec<Member>;
}

/// In-memory membership used in dev mode and tests. Every update is also
/// published as a member event.
pub struct StaticMembership {
    members: RwLock<HashMap<String, Member>>,
    events_tx: mpsc::Sender<Member>,
}

impl StaticMembership {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Member>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                members: RwLock::new(HashMap::new()),
                events_tx,
            }),
            events_rx,
        )
    }

    pub fn set_member(&self, member: Member) {
        self.members
            .write()
            .unwrap()
            .insert(member.name.clone(), member.clone());
        // Best effort: a full reconcile pass will pick up anything a
        // saturated channel drops.
        let _ = self.events_tx.try_send(member);
    }
}

impl MembershipSource for StaticMembership {
    fn members(&self) -> Vec<Member> {
        self.members.read().unwrap().values().cloned().collect()
    }
}
