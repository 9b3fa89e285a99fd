// Server pools and the kind -> pool directory

use indexmap::IndexMap;

use crate::qn_interface::ServerId;
use crate::qn_server::Server;

/// Servers sharing one kind
#[derive(Debug, Clone)]
pub struct ServerPool {
    kind: String,
    servers: Vec<Server>,
}

impl ServerPool {
    pub fn new(pool: usize, kind: &str, size: usize, capacity: usize) -> Self {
        Self::from_servers(
            kind,
            (0..size)
                .map(|index| Server::new(ServerId { pool, index }, kind, capacity))
                .collect(),
        )
    }

    pub fn from_servers(kind: &str, servers: Vec<Server>) -> Self {
        Self {
            kind: kind.to_string(),
            servers,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, index: usize) -> Option<&Server> {
        self.servers.get(index)
    }

    pub fn server_mut(&mut self, index: usize) -> Option<&mut Server> {
        self.servers.get_mut(index)
    }

    /// Least loaded server not in `exclude`.
    ///
    /// Load is queued + active requests; ties go to the first server in pool
    /// order. `None` only when every member is excluded.
    pub fn select(&self, exclude: &[ServerId]) -> Option<ServerId> {
        let mut lowest: Option<&Server> = None;

        for server in &self.servers {
            if exclude.contains(&server.id()) {
                continue;
            }

            match lowest {
                Some(current) if server.load() >= current.load() => {}
                _ => lowest = Some(server),
            }
        }

        lowest.map(|s| s.id())
    }
}

/// Directory of pools by kind.
///
/// Filled once while the simulation is set up. Pool membership does not change
/// during a run; only the servers' own queues do.
#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pools: IndexMap<String, ServerPool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool of `size` servers. Returns false if the kind already exists.
    pub fn add_pool(&mut self, kind: &str, size: usize, capacity: usize) -> bool {
        let pool = ServerPool::new(self.pools.len(), kind, size, capacity);
        self.insert(pool)
    }

    /// Add a prebuilt pool. Its servers must carry this registry's next pool index.
    pub fn insert(&mut self, pool: ServerPool) -> bool {
        if self.pools.contains_key(pool.kind()) {
            return false;
        }
        debug_assert!(pool
            .servers()
            .iter()
            .all(|s| s.id().pool == self.pools.len()));

        self.pools.insert(pool.kind().to_string(), pool);
        true
    }

    pub fn next_pool_index(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_for(&self, kind: &str) -> Option<&ServerPool> {
        self.pools.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn pools(&self) -> impl Iterator<Item = &ServerPool> {
        self.pools.values()
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.pools.get_index(id.pool).and_then(|(_, p)| p.server(id.index))
    }

    pub fn server_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.pools
            .get_index_mut(id.pool)
            .and_then(|(_, p)| p.server_mut(id.index))
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.pools.values().flat_map(|p| p.servers().iter())
    }
}
