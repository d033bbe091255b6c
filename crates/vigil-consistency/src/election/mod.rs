//! Leader election on top of a coordination service
//!
//! Participants create ephemeral sequential proposals under
//! `/elections/<name>`. A participant without a predecessor leads; every
//! other participant follows, watching only the proposal right before its own
//! and re-running the check when that proposal disappears.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordination::{
    CoordinationError, Coordinator, CreateMode, ensure_path, sort_by_sequence,
};

pub const ELECTION_ROOT: &str = "/elections";
pub const ELECTION_PREFIX: &str = "n_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Follower,
    Leader,
    /// The proposal is gone, usually because the session expired
    Stopped,
}

pub struct Election {
    coordinator: Arc<dyn Coordinator>,
    name: String,
    participant: String,
}

impl Election {
    pub fn new(coordinator: Arc<dyn Coordinator>, name: &str) -> Self {
        let participant = format!("session-{}", coordinator.session_id());
        Self {
            coordinator,
            name: name.to_string(),
            participant,
        }
    }

    /// Identifier stored in the proposal, reported by [`ElectionHandle::leader`]
    pub fn with_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = participant.into();
        self
    }

    /// Submit a proposal and start following the election
    pub async fn perform(self) -> Result<ElectionHandle, CoordinationError> {
        let dir = format!("{ELECTION_ROOT}/{}", self.name);
        ensure_path(self.coordinator.as_ref(), &dir).await?;
        let node = self
            .coordinator
            .create(
                &format!("{dir}/{ELECTION_PREFIX}"),
                self.participant.into_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        tracing::info!(election = %self.name, node = %node, "Joined election");

        let (tx, rx) = watch::channel(Role::Candidate);
        let task = tokio::spawn(follow_leader(
            self.coordinator.clone(),
            dir.clone(),
            node.clone(),
            tx,
        ));

        Ok(ElectionHandle {
            coordinator: self.coordinator,
            dir,
            node,
            rx,
            task,
        })
    }
}

fn publish(tx: &watch::Sender<Role>, role: Role, node: &str) {
    let changed = tx.send_if_modified(|current| {
        if *current == role {
            false
        } else {
            *current = role;
            true
        }
    });
    if changed {
        tracing::info!(node, role = ?role, "Election role changed");
        metrics::gauge!("vigil_election_leader").set(if role == Role::Leader { 1.0 } else { 0.0 });
    }
}

async fn proposals(
    coordinator: &dyn Coordinator,
    dir: &str,
) -> Result<Vec<String>, CoordinationError> {
    let mut children: Vec<String> = coordinator
        .get_children(dir)
        .await?
        .into_iter()
        .filter(|c| c.starts_with(ELECTION_PREFIX))
        .collect();
    sort_by_sequence(&mut children);
    Ok(children)
}

async fn follow_leader(
    coordinator: Arc<dyn Coordinator>,
    dir: String,
    node: String,
    tx: watch::Sender<Role>,
) {
    let own = node.rsplit('/').next().unwrap_or(&node).to_string();
    loop {
        let children = match proposals(coordinator.as_ref(), &dir).await {
            Ok(children) => children,
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "Election check failed");
                publish(&tx, Role::Stopped, &node);
                return;
            }
        };
        let Some(position) = children.iter().position(|c| *c == own) else {
            publish(&tx, Role::Stopped, &node);
            return;
        };

        // The leader watches its own proposal to notice losing it
        let target = if position == 0 {
            publish(&tx, Role::Leader, &node);
            node.clone()
        } else {
            publish(&tx, Role::Follower, &node);
            format!("{dir}/{}", children[position - 1])
        };

        match coordinator.exists_watch(&target).await {
            Ok(Some(watch)) => {
                watch.fired().await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "Election watch failed");
                publish(&tx, Role::Stopped, &node);
                return;
            }
        }
    }
}

pub struct ElectionHandle {
    coordinator: Arc<dyn Coordinator>,
    dir: String,
    node: String,
    rx: watch::Receiver<Role>,
    task: JoinHandle<()>,
}

impl ElectionHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn role(&self) -> Role {
        *self.rx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.rx.clone()
    }

    /// Wait until this participant leads. Fails if the proposal is lost first.
    pub async fn wait_for_leadership(&mut self) -> Result<(), CoordinationError> {
        let role = self
            .rx
            .wait_for(|r| matches!(r, Role::Leader | Role::Stopped))
            .await
            .map(|r| *r)
            .unwrap_or(Role::Stopped);
        match role {
            Role::Leader => Ok(()),
            _ => Err(CoordinationError::NoNode(self.node.clone())),
        }
    }

    /// Participant id stored in the current leader's proposal
    pub async fn leader(&self) -> Result<Option<String>, CoordinationError> {
        let children = proposals(self.coordinator.as_ref(), &self.dir).await?;
        let Some(first) = children.first() else {
            return Ok(None);
        };
        let data = self
            .coordinator
            .get_data(&format!("{}/{first}", self.dir))
            .await?;
        Ok(Some(String::from_utf8_lossy(&data).into_owned()))
    }

    /// Withdraw from the election
    pub async fn resign(self) -> Result<(), CoordinationError> {
        self.task.abort();
        match self.coordinator.delete(&self.node).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;

    #[tokio::test]
    async fn test_single_participant_leads() {
        let ensemble = MemoryCoordination::new();
        let session: Arc<dyn Coordinator> = Arc::new(ensemble.session());
        let mut handle = Election::new(session, "rectifier")
            .with_participant("worker-1")
            .perform()
            .await
            .unwrap();

        handle.wait_for_leadership().await.unwrap();
        assert!(handle.is_leader());
        assert!(handle.node().starts_with("/elections/rectifier/n_"));
        assert_eq!(handle.leader().await.unwrap().as_deref(), Some("worker-1"));
    }
}
