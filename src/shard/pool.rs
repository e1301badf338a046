//! Shard client pool
//!
//! One client per pnode, built when the ring is loaded. The pnode set is
//! fixed between topology changes; `replace` swaps the whole set at once.

use crate::common::{Error, Result, METRICS};
use crate::shard::client::ShardClient;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct PoolInner {
    clients: HashMap<String, Arc<dyn ShardClient>>,
    /// pnodes in ring order
    order: Vec<String>,
}

impl PoolInner {
    fn build<F>(pnodes: &[String], mut factory: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<Arc<dyn ShardClient>>,
    {
        let mut inner = PoolInner::default();
        for pnode in pnodes {
            if inner.clients.contains_key(pnode) {
                continue;
            }
            let client = factory(pnode)?;
            tracing::debug!(pnode = %pnode, "shard client created");
            inner.clients.insert(pnode.clone(), client);
            inner.order.push(pnode.clone());
        }
        Ok(inner)
    }
}

pub struct ShardClientPool {
    inner: RwLock<Arc<PoolInner>>,
}

impl ShardClientPool {
    /// Create one client per pnode through `factory`
    pub fn connect<F>(pnodes: &[String], factory: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<Arc<dyn ShardClient>>,
    {
        let inner = PoolInner::build(pnodes, factory)?;
        METRICS.shards_connected.set(inner.order.len() as u64);
        tracing::info!(shards = inner.order.len(), "shard pool connected");
        Ok(Self {
            inner: RwLock::new(Arc::new(inner)),
        })
    }

    /// Pool over already-built clients, keyed by their own pnode
    pub fn from_clients(clients: Vec<Arc<dyn ShardClient>>) -> Self {
        let mut inner = PoolInner::default();
        for client in clients {
            let pnode = client.pnode().to_string();
            if inner.clients.insert(pnode.clone(), client).is_none() {
                inner.order.push(pnode);
            }
        }
        Self {
            inner: RwLock::new(Arc::new(inner)),
        }
    }

    fn current(&self) -> Arc<PoolInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Client for `pnode`. A ring pnode with no client is a bug, not a
    /// caller error.
    pub fn by_pnode(&self, pnode: &str) -> Result<Arc<dyn ShardClient>> {
        match self.current().clients.get(pnode) {
            Some(client) => Ok(client.clone()),
            None => {
                tracing::error!(pnode, "no shard client for pnode on the ring");
                Err(Error::RoutingInvariant(format!(
                    "no client for pnode {}",
                    pnode
                )))
            }
        }
    }

    /// Every client, in ring order
    pub fn all(&self) -> Vec<(String, Arc<dyn ShardClient>)> {
        let inner = self.current();
        inner
            .order
            .iter()
            .filter_map(|p| inner.clients.get(p).map(|c| (p.clone(), c.clone())))
            .collect()
    }

    /// Swap in a new client set; callers holding old clients finish on them.
    pub fn replace<F>(&self, pnodes: &[String], factory: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<Arc<dyn ShardClient>>,
    {
        let inner = PoolInner::build(pnodes, factory)?;
        METRICS.shards_connected.set(inner.order.len() as u64);
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(inner);
        Ok(())
    }

    pub fn pnodes(&self) -> Vec<String> {
        self.current().order.clone()
    }

    pub fn len(&self) -> usize {
        self.current().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ShardClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardClientPool")
            .field("pnodes", &self.pnodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::memory::MemoryShard;

    fn memory(pnode: &str) -> Result<Arc<dyn ShardClient>> {
        Ok(Arc::new(MemoryShard::new(pnode)))
    }

    fn pnodes() -> Vec<String> {
        vec![
            "tcp://1.moray:2020".into(),
            "tcp://2.moray:2020".into(),
            "tcp://3.moray:2020".into(),
        ]
    }

    #[test]
    fn test_one_client_per_pnode_in_order() {
        let mut all = pnodes();
        all.push("tcp://1.moray:2020".into());
        let pool = ShardClientPool::connect(&all, memory).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.pnodes(), pnodes());

        let listed: Vec<String> = pool.all().into_iter().map(|(p, _)| p).collect();
        assert_eq!(listed, pnodes());
    }

    #[test]
    fn test_unknown_pnode_is_routing_invariant() {
        let pool = ShardClientPool::connect(&pnodes(), memory).unwrap();
        assert_eq!(pool.by_pnode("tcp://2.moray:2020").unwrap().pnode(), "tcp://2.moray:2020");
        let err = pool.by_pnode("tcp://9.moray:2020").err().unwrap();
        assert!(matches!(err, Error::RoutingInvariant(_)));
        assert_eq!(err.name(), "InternalError");
    }

    #[test]
    fn test_factory_failure_aborts() {
        let result = ShardClientPool::connect(&pnodes(), |p| {
            if p.starts_with("tcp://2") {
                Err(Error::Http("refused".into()))
            } else {
                memory(p)
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_replace_swaps_clients() {
        let pool = ShardClientPool::connect(&pnodes(), memory).unwrap();
        let held = pool.by_pnode("tcp://1.moray:2020").unwrap();
        pool.replace(&["tcp://7.moray:2020".to_string()], memory).unwrap();

        assert_eq!(pool.pnodes(), vec!["tcp://7.moray:2020".to_string()]);
        assert!(pool.by_pnode("tcp://1.moray:2020").is_err());
        assert_eq!(held.pnode(), "tcp://1.moray:2020");
    }
}
