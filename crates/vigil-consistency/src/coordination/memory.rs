//! In-process coordination ensemble
//!
//! Nodes live in one ordered map keyed by full path. Ephemeral nodes record
//! the owning session and are removed when that session expires; removing a
//! node fires every watch registered on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{CoordinationError, Coordinator, CreateMode, Watch, WatchEvent};

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    live_sessions: HashSet<u64>,
}

impl Tree {
    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        if let Some(watchers) = self.watches.remove(path) {
            for tx in watchers {
                let _ = tx.send(WatchEvent::NodeDeleted(path.to_string()));
            }
        }
    }
}

/// Shared ensemble; each participant gets its own session from it
#[derive(Clone, Default)]
pub struct MemoryCoordination {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.tree.lock().live_sessions.insert(id);
        MemorySession {
            id,
            ensemble: self.clone(),
        }
    }

    /// Expire a session, deleting every ephemeral node it owns
    pub fn expire(&self, session_id: u64) {
        let mut tree = self.tree.lock();
        if !tree.live_sessions.remove(&session_id) {
            return;
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session_id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in &owned {
            tree.remove(path);
        }
        tracing::debug!(session_id, removed = owned.len(), "Session expired");
    }

    pub fn node_count(&self) -> usize {
        self.tree.lock().nodes.len()
    }
}

pub struct MemorySession {
    id: u64,
    ensemble: MemoryCoordination,
}

impl MemorySession {
    pub fn expire(&self) {
        self.ensemble.expire(self.id);
    }

    fn tree(&self) -> Result<parking_lot::MutexGuard<'_, Tree>, CoordinationError> {
        let tree = self.ensemble.tree.lock();
        if tree.live_sessions.contains(&self.id) {
            Ok(tree)
        } else {
            Err(CoordinationError::SessionExpired(self.id))
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.ensemble.expire(self.id);
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        let mut tree = self.tree()?;
        let parent = Tree::parent_of(path).to_string();
        if !tree.exists(&parent) {
            return Err(CoordinationError::NoNode(parent));
        }
        if tree.nodes.get(&parent).is_some_and(|p| p.owner.is_some()) {
            return Err(CoordinationError::Unavailable(format!(
                "ephemeral node '{parent}' cannot have children"
            )));
        }

        let actual = if mode.is_sequential() {
            let seq = tree.sequences.entry(parent).or_insert(0);
            let path = format!("{path}{:010}", *seq);
            *seq += 1;
            path
        } else {
            path.to_string()
        };
        if tree.exists(&actual) {
            return Err(CoordinationError::NodeExists(actual));
        }

        tree.nodes.insert(
            actual.clone(),
            Node {
                data,
                owner: mode.is_ephemeral().then_some(self.id),
            },
        );
        Ok(actual)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let tree = self.tree()?;
        if !tree.exists(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(tree.children(path))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        let tree = self.tree()?;
        tree.nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        Ok(self.tree()?.exists(path))
    }

    async fn exists_watch(&self, path: &str) -> Result<Option<Watch>, CoordinationError> {
        let mut tree = self.tree()?;
        if !tree.exists(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        tree.watches.entry(path.to_string()).or_default().push(tx);
        Ok(Some(Watch::new(rx)))
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let mut tree = self.tree()?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if !tree.children(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        tree.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ensure_path;

    #[tokio::test]
    async fn test_sequential_children() {
        let ensemble = MemoryCoordination::new();
        let session = ensemble.session();
        ensure_path(&session, "/locks/a").await.unwrap();

        let first = session
            .create("/locks/a/-lock", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = session
            .create("/locks/a/-lock", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/locks/a/-lock0000000000");
        assert_eq!(second, "/locks/a/-lock0000000001");

        let children = session.get_children("/locks/a").await.unwrap();
        assert_eq!(children, vec!["-lock0000000000", "-lock0000000001"]);
        assert_eq!(session.get_children("/locks").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryCoordination::new();
        let session = ensemble.session();
        let err = session
            .create("/missing/child", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::NoNode("/missing".to_string()));
    }

    #[tokio::test]
    async fn test_expiry_removes_ephemerals_and_fires_watches() {
        let ensemble = MemoryCoordination::new();
        let owner = ensemble.session();
        let observer = ensemble.session();
        ensure_path(&owner, "/elections").await.unwrap();
        let node = owner
            .create("/elections/n_", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let watch = observer.exists_watch(&node).await.unwrap().unwrap();
        owner.expire();

        assert_eq!(watch.fired().await, WatchEvent::NodeDeleted(node.clone()));
        assert!(!observer.exists(&node).await.unwrap());
        // Persistent parents survive
        assert!(observer.exists("/elections").await.unwrap());
        assert_eq!(
            owner.exists("/elections").await.unwrap_err(),
            CoordinationError::SessionExpired(owner.session_id())
        );
    }

    #[tokio::test]
    async fn test_delete_non_empty_rejected() {
        let ensemble = MemoryCoordination::new();
        let session = ensemble.session();
        ensure_path(&session, "/a/b").await.unwrap();
        assert_eq!(
            session.delete("/a").await.unwrap_err(),
            CoordinationError::NotEmpty("/a".to_string())
        );
        session.delete("/a/b").await.unwrap();
        session.delete("/a").await.unwrap();
        assert_eq!(ensemble.node_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_on_missing_node() {
        let ensemble = MemoryCoordination::new();
        let session = ensemble.session();
        assert!(session.exists_watch("/nope").await.unwrap().is_none());
    }
}
