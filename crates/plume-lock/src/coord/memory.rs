use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{ChildrenWatch, CoordinationSession, Coordinator, CreateMode};
use crate::error::LockError;

#[derive(Default)]
struct Tree {
    /// Node path -> owning session of ephemeral nodes.
    nodes: BTreeMap<String, Option<u64>>,
    sequences: HashMap<String, u64>,
    watchers: HashMap<String, watch::Sender<u64>>,
    sessions: HashSet<u64>,
    next_session: u64,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn check_path(path: &str) -> Result<(), LockError> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(LockError::Coordination(format!("invalid node path '{path}'")));
    }
    Ok(())
}

impl Tree {
    fn live(&self, session: u64) -> Result<(), LockError> {
        if self.sessions.contains(&session) {
            Ok(())
        } else {
            Err(LockError::SessionLost(format!("session {session} expired")))
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn touch(&mut self, parent: &str) {
        if let Some(tx) = self.watchers.get(parent) {
            tx.send_modify(|v| *v += 1);
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let name = &p[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn drop_session(&mut self, session: u64) {
        self.sessions.remove(&session);
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, owner)| **owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.touch(parent_of(&path));
        }
    }
}

/// In-process coordination service.
///
/// Clones share the same tree, so every locker built from one instance competes for the same
/// locks.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire a session as the service would after missed heartbeats.
    pub fn expire(&self, session: u64) {
        debug!(session, "expiring coordination session");
        self.tree.lock().unwrap().drop_session(session);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().unwrap().exists(path)
    }

    pub fn session_count(&self) -> usize {
        self.tree.lock().unwrap().sessions.len()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn connect(&self) -> Result<Box<dyn CoordinationSession>, LockError> {
        let mut tree = self.tree.lock().unwrap();
        tree.next_session += 1;
        let id = tree.next_session;
        tree.sessions.insert(id);
        Ok(Box::new(MemorySession {
            id,
            tree: Arc::clone(&self.tree),
        }))
    }
}

struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

#[async_trait]
impl CoordinationSession for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ensure_path(&self, path: &str) -> Result<(), LockError> {
        check_path(path)?;
        let mut tree = self.tree.lock().unwrap();
        tree.live(self.id)?;

        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if !tree.nodes.contains_key(&current) {
                tree.nodes.insert(current.clone(), None);
                let parent = parent_of(&current).to_string();
                tree.touch(&parent);
            }
        }
        Ok(())
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<String, LockError> {
        check_path(path)?;
        let mut tree = self.tree.lock().unwrap();
        tree.live(self.id)?;

        let parent = parent_of(path).to_string();
        if !tree.exists(&parent) {
            return Err(LockError::Coordination(format!("no parent node for '{path}'")));
        }

        let path = match mode {
            CreateMode::EphemeralSequential => {
                let seq = tree.sequences.entry(parent.clone()).or_default();
                let path = format!("{path}{seq:010}");
                *seq += 1;
                path
            }
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        };
        if tree.nodes.contains_key(&path) {
            return Err(LockError::Coordination(format!("node '{path}' already exists")));
        }

        let owner = (mode != CreateMode::Persistent).then_some(self.id);
        tree.nodes.insert(path.clone(), owner);
        tree.touch(&parent);
        Ok(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, LockError> {
        let tree = self.tree.lock().unwrap();
        tree.live(self.id)?;
        if !tree.exists(path) {
            return Err(LockError::Coordination(format!("no node '{path}'")));
        }
        Ok(tree.children(path))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, ChildrenWatch), LockError> {
        let mut tree = self.tree.lock().unwrap();
        tree.live(self.id)?;
        if !tree.exists(path) {
            return Err(LockError::Coordination(format!("no node '{path}'")));
        }

        let mut rx = tree
            .watchers
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe();
        let watch = ChildrenWatch::new(async move {
            let _ = rx.changed().await;
        });
        Ok((tree.children(path), watch))
    }

    async fn delete(&self, path: &str) -> Result<(), LockError> {
        let mut tree = self.tree.lock().unwrap();
        tree.live(self.id)?;
        if !tree.children(path).is_empty() {
            return Err(LockError::Coordination(format!("node '{path}' has children")));
        }
        if tree.nodes.remove(path).is_none() {
            return Err(LockError::Coordination(format!("no node '{path}'")));
        }
        tree.touch(parent_of(path));
        Ok(())
    }

    async fn close(&self) -> Result<(), LockError> {
        self.tree.lock().unwrap().drop_session(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sequential_nodes_are_numbered_per_parent() {
        let coord = MemoryCoordinator::new();
        let s = coord.connect().await.unwrap();
        s.ensure_path("/plume/locks/a").await.unwrap();

        let first = s.create("/plume/locks/a/lock-", CreateMode::EphemeralSequential).await.unwrap();
        let second = s.create("/plume/locks/a/lock-", CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(first, "/plume/locks/a/lock-0000000000");
        assert_eq!(second, "/plume/locks/a/lock-0000000001");
        assert_eq!(
            s.children("/plume/locks/a").await.unwrap(),
            vec!["lock-0000000000", "lock-0000000001"]
        );
        assert_eq!(s.children("/plume").await.unwrap(), vec!["locks"]);
    }

    #[tokio::test]
    async fn expiry_drops_ephemeral_nodes_and_fires_watches() {
        let coord = MemoryCoordinator::new();
        let owner = coord.connect().await.unwrap();
        let observer = coord.connect().await.unwrap();
        owner.ensure_path("/l").await.unwrap();
        owner.create("/l/keep", CreateMode::Persistent).await.unwrap();
        owner.create("/l/eph", CreateMode::Ephemeral).await.unwrap();

        let (children, watch) = observer.children_watch("/l").await.unwrap();
        assert_eq!(children, vec!["eph", "keep"]);

        coord.expire(owner.id());
        tokio::time::timeout(Duration::from_secs(1), watch.fired())
            .await
            .expect("watch should fire");
        assert_eq!(observer.children("/l").await.unwrap(), vec!["keep"]);
        assert!(matches!(
            owner.create("/l/again", CreateMode::Ephemeral).await,
            Err(LockError::SessionLost(_))
        ));
        assert_eq!(coord.session_count(), 1);
    }

    #[tokio::test]
    async fn create_requires_parent_and_unique_name() {
        let coord = MemoryCoordinator::new();
        let s = coord.connect().await.unwrap();
        assert!(matches!(
            s.create("/missing/node", CreateMode::Ephemeral).await,
            Err(LockError::Coordination(_))
        ));
        s.create("/node", CreateMode::Persistent).await.unwrap();
        assert!(s.create("/node", CreateMode::Persistent).await.is_err());
        assert!(s.delete("/").await.is_err());
    }
}
