use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::clicktime::{ClientInfo, JobInfo, TaskInfo, UserInfo};
use crate::metrics::Metrics;

/// Process-lifetime lookup tables for ClickTime reference data.
///
/// Each table is filled on first use through the supplied fetch closure and
/// never evicted. Renames upstream are only picked up by a new process.
#[derive(Debug)]
pub struct LookupCache {
    jobs: HashMap<u64, JobInfo>,
    clients: HashMap<String, ClientInfo>,
    tasks: HashMap<String, TaskInfo>,
    users: HashMap<String, UserInfo>,
    metrics: Arc<Metrics>,
}

impl LookupCache {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            jobs: HashMap::new(),
            clients: HashMap::new(),
            tasks: HashMap::new(),
            users: HashMap::new(),
            metrics,
        }
    }

    pub fn job<F, E>(&mut self, number: u64, fetch: F) -> Result<JobInfo, E>
    where
        F: FnOnce() -> Result<JobInfo, E>,
    {
        get_or_fetch(&mut self.jobs, &self.metrics, number, fetch)
    }

    pub fn client<F, E>(&mut self, id: &str, fetch: F) -> Result<ClientInfo, E>
    where
        F: FnOnce() -> Result<ClientInfo, E>,
    {
        get_or_fetch(&mut self.clients, &self.metrics, id.to_string(), fetch)
    }

    pub fn task<F, E>(&mut self, id: &str, fetch: F) -> Result<TaskInfo, E>
    where
        F: FnOnce() -> Result<TaskInfo, E>,
    {
        get_or_fetch(&mut self.tasks, &self.metrics, id.to_string(), fetch)
    }

    pub fn user<F, E>(&mut self, id: &str, fetch: F) -> Result<UserInfo, E>
    where
        F: FnOnce() -> Result<UserInfo, E>,
    {
        get_or_fetch(&mut self.users, &self.metrics, id.to_string(), fetch)
    }

    pub fn len(&self) -> usize {
        self.jobs.len() + self.clients.len() + self.tasks.len() + self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn get_or_fetch<K, V, F, E>(
    table: &mut HashMap<K, V>,
    metrics: &Metrics,
    key: K,
    fetch: F,
) -> Result<V, E>
where
    K: Eq + Hash,
    V: Clone,
    F: FnOnce() -> Result<V, E>,
{
    if let Some(value) = table.get(&key) {
        metrics.inc_cache_hit();
        return Ok(value.clone());
    }

    metrics.inc_cache_miss();
    let fresh = fetch()?;
    table.insert(key, fresh.clone());
    Ok(fresh)
}
