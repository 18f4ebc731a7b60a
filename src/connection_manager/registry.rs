use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{CapacityScope, ConnectionError};

use super::stats::RegistryStats;
use super::types::{Connection, ConnectionState};

/// Capacity ceilings enforced by the registry
#[derive(Debug, Clone, Copy)]
pub struct RegistryCapacity {
    pub max_total: usize,
    pub max_per_ip: usize,
    pub max_per_user: usize,
}

#[derive(Default)]
struct RegistryIndex {
    /// connection_id -> Connection
    by_id: HashMap<Uuid, Arc<Connection>>,
    /// origin address -> Set<connection_id>
    by_ip: HashMap<String, HashSet<Uuid>>,
    /// user_id -> Set<connection_id> (supports multiple devices)
    by_user: HashMap<String, HashSet<Uuid>>,
}

impl RegistryIndex {
    /// Admission checks in fixed order: total, per-IP, per-user
    fn check(
        &self,
        capacity: &RegistryCapacity,
        origin: &str,
        user_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let total = self.by_id.len();
        if total >= capacity.max_total {
            return Err(ConnectionError::CapacityExceeded {
                scope: CapacityScope::Total,
                current: total,
                max: capacity.max_total,
            });
        }

        let per_ip = self.by_ip.get(origin).map_or(0, HashSet::len);
        if per_ip >= capacity.max_per_ip {
            return Err(ConnectionError::CapacityExceeded {
                scope: CapacityScope::PerIp,
                current: per_ip,
                max: capacity.max_per_ip,
            });
        }

        if let Some(user_id) = user_id {
            let per_user = self.by_user.get(user_id).map_or(0, HashSet::len);
            if per_user >= capacity.max_per_user {
                return Err(ConnectionError::CapacityExceeded {
                    scope: CapacityScope::PerUser,
                    current: per_user,
                    max: capacity.max_per_user,
                });
            }
        }

        Ok(())
    }

    fn unlink(&mut self, connection: &Connection) {
        if let Some(ids) = self.by_ip.get_mut(&connection.origin_address) {
            ids.remove(&connection.id);
            if ids.is_empty() {
                self.by_ip.remove(&connection.origin_address);
            }
        }

        if let Some(user_id) = &connection.user_id {
            if let Some(ids) = self.by_user.get_mut(user_id) {
                ids.remove(&connection.id);
                if ids.is_empty() {
                    self.by_user.remove(user_id);
                }
            }
        }
    }
}

/// Authoritative set of live connections.
///
/// All three indices sit behind one lock so that capacity checks and
/// insertion are a single atomic step. Readers copy out `Arc`s and release
/// the lock before doing any I/O.
pub struct ConnectionRegistry {
    index: RwLock<RegistryIndex>,
    capacity: RegistryCapacity,
}

impl ConnectionRegistry {
    pub fn new(capacity: RegistryCapacity) -> Self {
        Self {
            index: RwLock::new(RegistryIndex::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> RegistryCapacity {
        self.capacity
    }

    /// Would a connection from `origin` (and `user_id`) be admitted now?
    pub fn check_admission(
        &self,
        origin: &str,
        user_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.index.read().check(&self.capacity, origin, user_id)
    }

    /// Register a connection in all indices.
    ///
    /// Capacity is re-checked under the write lock, so concurrent
    /// admissions can never overshoot a ceiling.
    pub fn add(&self, connection: Arc<Connection>) -> Result<(), ConnectionError> {
        let mut index = self.index.write();
        index.check(
            &self.capacity,
            &connection.origin_address,
            connection.user_id.as_deref(),
        )?;

        let id = connection.id;
        index
            .by_ip
            .entry(connection.origin_address.clone())
            .or_default()
            .insert(id);
        if let Some(user_id) = &connection.user_id {
            index.by_user.entry(user_id.clone()).or_default().insert(id);
        }
        index.by_id.insert(id, connection);

        Ok(())
    }

    /// Remove a connection from every index, pruning empty buckets
    pub fn remove(&self, id: Uuid) -> Option<Arc<Connection>> {
        let mut index = self.index.write();
        let connection = index.by_id.remove(&id)?;
        index.unlink(&connection);
        Some(connection)
    }

    /// Drop everything, returning what was registered
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        let mut index = self.index.write();
        index.by_ip.clear();
        index.by_user.clear();
        index.by_id.drain().map(|(_, conn)| conn).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.index.read().by_id.get(&id).cloned()
    }

    pub fn count_total(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn count_by_ip(&self, origin: &str) -> usize {
        self.index.read().by_ip.get(origin).map_or(0, HashSet::len)
    }

    pub fn count_by_user(&self, user_id: &str) -> usize {
        self.index.read().by_user.get(user_id).map_or(0, HashSet::len)
    }

    /// Snapshot of connections eligible for fan-out (CONNECTED or ACTIVE)
    pub fn all_active(&self) -> Vec<Arc<Connection>> {
        self.index
            .read()
            .by_id
            .values()
            .filter(|conn| conn.state().is_active())
            .cloned()
            .collect()
    }

    /// Snapshot of every registered connection regardless of state
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.index.read().by_id.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.index.read().by_id.keys().copied().collect()
    }

    /// Connections for one user (all devices)
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let index = self.index.read();
        index
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        let index = self.index.read();
        let mut by_state: HashMap<ConnectionState, usize> = HashMap::new();
        for conn in index.by_id.values() {
            *by_state.entry(conn.state()).or_default() += 1;
        }

        RegistryStats {
            total_connections: index.by_id.len(),
            unique_ips: index.by_ip.len(),
            unique_users: index.by_user.len(),
            by_state: by_state
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionLimits;
    use crate::websocket::mock::MockTransport;

    fn capacity(total: usize, per_ip: usize, per_user: usize) -> RegistryCapacity {
        RegistryCapacity {
            max_total: total,
            max_per_ip: per_ip,
            max_per_user: per_user,
        }
    }

    fn conn(origin: &str, user: Option<&str>) -> Arc<Connection> {
        let conn = Connection::new(
            MockTransport::new().boxed(),
            user.map(str::to_string),
            "tester".into(),
            origin.into(),
            &ConnectionLimits::default(),
        );
        conn.transition(ConnectionState::Connected);
        Arc::new(conn)
    }

    #[test]
    fn test_add_indexes_all_three_maps() {
        let registry = ConnectionRegistry::new(capacity(10, 10, 10));
        let a = conn("10.0.0.1", Some("alice"));
        let b = conn("10.0.0.1", None);

        registry.add(a.clone()).unwrap();
        registry.add(b.clone()).unwrap();

        assert_eq!(registry.count_total(), 2);
        assert_eq!(registry.count_by_ip("10.0.0.1"), 2);
        assert_eq!(registry.count_by_user("alice"), 1);
        assert_eq!(registry.get(a.id).unwrap().id, a.id);
        assert_eq!(registry.user_connections("alice").len(), 1);
    }

    #[test]
    fn test_remove_prunes_empty_buckets() {
        let registry = ConnectionRegistry::new(capacity(10, 10, 10));
        let a = conn("10.0.0.1", Some("alice"));
        registry.add(a.clone()).unwrap();

        let removed = registry.remove(a.id).unwrap();
        assert_eq!(removed.id, a.id);
        assert!(registry.remove(a.id).is_none());

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.unique_ips, 0);
        assert_eq!(stats.unique_users, 0);
    }

    #[test]
    fn test_capacity_checks_in_order() {
        let registry = ConnectionRegistry::new(capacity(2, 1, 1));
        registry.add(conn("10.0.0.1", Some("alice"))).unwrap();

        // Same IP and same user: the per-IP ceiling is reported first
        let err = registry.add(conn("10.0.0.1", Some("alice"))).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::CapacityExceeded {
                scope: CapacityScope::PerIp,
                ..
            }
        ));

        let err = registry.add(conn("10.0.0.2", Some("alice"))).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::CapacityExceeded {
                scope: CapacityScope::PerUser,
                ..
            }
        ));

        registry.add(conn("10.0.0.2", None)).unwrap();
        let err = registry.add(conn("10.0.0.3", None)).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::CapacityExceeded {
                scope: CapacityScope::Total,
                current: 2,
                max: 2
            }
        ));
    }

    #[test]
    fn test_all_active_filters_states() {
        let registry = ConnectionRegistry::new(capacity(10, 10, 10));
        let connected = conn("10.0.0.1", None);
        let errored = conn("10.0.0.2", None);
        errored.transition(ConnectionState::Error);
        let active = conn("10.0.0.3", None);
        active.transition(ConnectionState::Active);

        registry.add(connected.clone()).unwrap();
        registry.add(errored).unwrap();
        registry.add(active.clone()).unwrap();

        let mut ids: Vec<Uuid> = registry.all_active().iter().map(|c| c.id).collect();
        ids.sort();
        let mut expected = vec![connected.id, active.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(registry.all().len(), 3);
    }

    #[test]
    fn test_clear_empties_registry() {
        let registry = ConnectionRegistry::new(capacity(10, 10, 10));
        registry.add(conn("10.0.0.1", Some("a"))).unwrap();
        registry.add(conn("10.0.0.2", Some("b"))).unwrap();

        assert_eq!(registry.clear().len(), 2);
        assert_eq!(registry.count_total(), 0);
        assert_eq!(registry.count_by_user("a"), 0);
        assert!(registry.ids().is_empty());
    }
}
