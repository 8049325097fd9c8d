//! Keyed cache of live shell sessions.
//!
//! Sessions are keyed by `(client session id, robot id)` so two browser tabs
//! talking to the same robot never share a shell. The map lock is only held
//! for in-memory bookkeeping; connecting and closing happen outside it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::catalog::CatalogHandle;
use crate::config::{SessionConfig, secs};
use crate::error::{FleetError, FleetResult};
use crate::guard::{ActivityGuard, ActivitySource};
use crate::shell::{ConnectTarget, Connector, ShellOptions, ShellSession};

type SessionKey = (String, String);

struct Handle {
    shell: Arc<ShellSession>,
    last_used: Instant,
}

struct StoreInner {
    catalog: CatalogHandle,
    connector: Arc<dyn Connector>,
    guard: ActivityGuard,
    config: SessionConfig,
    options: ShellOptions,
    idle_timeout: Duration,
    handles: Mutex<HashMap<SessionKey, Handle>>,
}

/// Owner of every open shell session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(
        catalog: CatalogHandle,
        connector: Arc<dyn Connector>,
        guard: ActivityGuard,
        config: SessionConfig,
        options: ShellOptions,
    ) -> Self {
        let idle_timeout = secs(config.idle_timeout_secs);
        Self {
            inner: Arc::new(StoreInner {
                catalog,
                connector,
                guard,
                config,
                options,
                idle_timeout,
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<SessionKey, Handle>> {
        match self.inner.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key(client_session_id: &str, robot_id: &str) -> SessionKey {
        (client_session_id.to_string(), robot_id.to_string())
    }

    /// Connection details for a robot from the current catalog.
    pub fn connect_target(&self, robot_id: &str) -> FleetResult<ConnectTarget> {
        let catalog = self.inner.catalog.snapshot();
        let robot = catalog
            .robot(robot_id)
            .ok_or_else(|| FleetError::not_found(format!("Unknown robot id: {robot_id}")))?;

        let host = robot.host.trim();
        if host.is_empty() {
            return Err(FleetError::bad_request(format!(
                "Robot {robot_id} missing 'ip' in config"
            )));
        }
        let username = robot.ssh.username.trim();
        let password = robot.ssh.password.trim();
        if username.is_empty() || password.is_empty() {
            return Err(FleetError::bad_request(format!(
                "Robot {robot_id} missing SSH username/password in config"
            )));
        }

        Ok(ConnectTarget {
            robot_id: robot_id.to_string(),
            host: host.to_string(),
            port: robot.port(),
            username: username.to_string(),
            password: password.to_string(),
            term: self.inner.config.term.clone(),
            width: self.inner.config.width,
            height: self.inner.config.height,
            connect_timeout: secs(self.inner.config.connect_timeout_secs),
        })
    }

    pub fn shell_options(&self) -> ShellOptions {
        self.inner.options.clone()
    }

    /// Open a shell without registering it in the store.
    pub async fn connect_detached(
        &self,
        target: &ConnectTarget,
        options: ShellOptions,
    ) -> FleetResult<ShellSession> {
        ShellSession::connect(self.inner.connector.as_ref(), target, options)
            .await
            .map_err(|e| {
                FleetError::connectivity(
                    &target.robot_id,
                    format!(
                        "SSH connect failed for {} ({}): {}",
                        target.robot_id,
                        target.address(),
                        e
                    ),
                )
            })
    }

    /// Existing session for the key, or a freshly connected one.
    pub async fn get_or_connect(
        &self,
        client_session_id: &str,
        robot_id: &str,
    ) -> FleetResult<Arc<ShellSession>> {
        self.inner.guard.mark_manual_activity(
            robot_id,
            Some(client_session_id),
            ActivitySource::Manual,
        );
        let key = Self::key(client_session_id, robot_id);
        let now = Instant::now();

        let (stale, existing) = {
            let mut handles = self.handles();
            let mut stale = self.take_idle_locked(&mut handles, now);
            let existing = match handles.entry(key.clone()) {
                Entry::Occupied(entry) if entry.get().shell.is_closed() => {
                    stale.push(entry.remove().shell);
                    None
                }
                Entry::Occupied(mut entry) => {
                    entry.get_mut().last_used = now;
                    Some(Arc::clone(&entry.get().shell))
                }
                Entry::Vacant(_) => None,
            };
            (stale, existing)
        };
        close_all(stale).await;
        if let Some(shell) = existing {
            return Ok(shell);
        }

        let target = self.connect_target(robot_id)?;
        let shell = Arc::new(
            self.connect_detached(&target, self.inner.options.clone())
                .await?,
        );

        let winner = {
            let mut handles = self.handles();
            match handles.entry(key) {
                Entry::Occupied(mut entry) if !entry.get().shell.is_closed() => {
                    entry.get_mut().last_used = Instant::now();
                    Some(Arc::clone(&entry.get().shell))
                }
                Entry::Occupied(mut entry) => {
                    entry.insert(Handle {
                        shell: Arc::clone(&shell),
                        last_used: Instant::now(),
                    });
                    None
                }
                Entry::Vacant(entry) => {
                    entry.insert(Handle {
                        shell: Arc::clone(&shell),
                        last_used: Instant::now(),
                    });
                    None
                }
            }
        };

        if let Some(existing) = winner {
            debug!("Concurrent connect to {robot_id} lost the race, closing extra shell");
            shell.close().await;
            return Ok(existing);
        }
        info!("Opened shell session {client_session_id} on {robot_id}");
        Ok(shell)
    }

    /// Refresh the last-used timestamp of a session.
    pub fn touch(&self, client_session_id: &str, robot_id: &str) {
        if let Some(handle) = self
            .handles()
            .get_mut(&Self::key(client_session_id, robot_id))
        {
            handle.last_used = Instant::now();
        }
    }

    pub async fn close(&self, client_session_id: &str, robot_id: &str) {
        let removed = self
            .handles()
            .remove(&Self::key(client_session_id, robot_id));
        if let Some(handle) = removed {
            debug!("Closing shell session {client_session_id} on {robot_id}");
            handle.shell.close().await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<ShellSession>> = self
            .handles()
            .drain()
            .map(|(_, handle)| handle.shell)
            .collect();
        if !drained.is_empty() {
            info!("Closing {} shell session(s)", drained.len());
        }
        close_all(drained).await;
    }

    /// Close sessions idle past the threshold.
    pub async fn evict_idle(&self) {
        let stale = {
            let mut handles = self.handles();
            self.take_idle_locked(&mut handles, Instant::now())
        };
        close_all(stale).await;
    }

    pub fn session_count(&self) -> usize {
        self.handles().len()
    }

    pub fn has_session(&self, client_session_id: &str, robot_id: &str) -> bool {
        self.handles()
            .contains_key(&Self::key(client_session_id, robot_id))
    }

    fn take_idle_locked(
        &self,
        handles: &mut HashMap<SessionKey, Handle>,
        now: Instant,
    ) -> Vec<Arc<ShellSession>> {
        let idle: Vec<SessionKey> = handles
            .iter()
            .filter(|(_, handle)| now.duration_since(handle.last_used) > self.inner.idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        idle.into_iter()
            .filter_map(|key| {
                debug!("Evicting idle shell session {} on {}", key.0, key.1);
                handles.remove(&key).map(|handle| handle.shell)
            })
            .collect()
    }
}

async fn close_all(shells: Vec<Arc<ShellSession>>) {
    for shell in shells {
        shell.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogDocuments};
    use crate::config::ActivityConfig;
    use crate::testing::ScriptedFleet;
    use serde_json::json;

    fn catalog() -> CatalogHandle {
        let docs: CatalogDocuments = serde_json::from_value(json!({
            "robots": [
                {"id": "r1", "ip": "10.0.0.1", "type": "rover", "ssh": {"username": "u", "password": "p"}},
                {"id": "r2", "ip": "10.0.0.2", "type": "rover", "ssh": {"username": "u", "password": "p", "port": 2222}},
                {"id": "nocreds", "ip": "10.0.0.3", "type": "rover"},
                {"id": "noip", "type": "rover", "ssh": {"username": "u", "password": "p"}}
            ]
        }))
        .unwrap();
        CatalogHandle::new(Catalog::from_documents(docs).unwrap())
    }

    fn store(fleet: &ScriptedFleet, idle_timeout_secs: f64) -> SessionStore {
        let config = SessionConfig {
            idle_timeout_secs,
            ..SessionConfig::default()
        };
        let options = ShellOptions {
            banner_settle: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            idle_backoff: Duration::from_millis(5),
            ..ShellOptions::default()
        };
        SessionStore::new(
            catalog(),
            Arc::new(fleet.clone()),
            ActivityGuard::new(&ActivityConfig::default()),
            config,
            options,
        )
    }

    #[tokio::test]
    async fn test_reuses_session_per_key() {
        let fleet = ScriptedFleet::new();
        let store = store(&fleet, 900.0);

        let a = store.get_or_connect("page-1", "r1").await.unwrap();
        let b = store.get_or_connect("page-1", "r1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fleet.connect_count("10.0.0.1"), 1);

        let c = store.get_or_connect("page-2", "r1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(store.session_count(), 2);
        store.close_all().await;
        assert_eq!(store.session_count(), 0);
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted_on_access() {
        let fleet = ScriptedFleet::new();
        let store = store(&fleet, 0.05);

        let first = store.get_or_connect("page-1", "r1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _other = store.get_or_connect("page-1", "r2").await.unwrap();
        assert!(first.is_closed());
        assert!(!store.has_session("page-1", "r1"));
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let fleet = ScriptedFleet::new();
        let store = store(&fleet, 900.0);

        let first = store.get_or_connect("page-1", "r1").await.unwrap();
        first.close().await;
        let second = store.get_or_connect("page-1", "r1").await.unwrap();
        assert!(!second.is_closed());
        assert_eq!(fleet.connect_count("10.0.0.1"), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connectivity_error() {
        let fleet = ScriptedFleet::new();
        fleet.set_unreachable("10.0.0.2", true);
        let store = store(&fleet, 900.0);

        let err = store.get_or_connect("page-1", "r2").await.err().unwrap();
        assert!(err.is_connectivity());
        assert!(err.to_string().contains("SSH connect failed for r2 (10.0.0.2:2222)"));
    }

    #[tokio::test]
    async fn test_credential_errors() {
        let fleet = ScriptedFleet::new();
        let store = store(&fleet, 900.0);

        let err = store.get_or_connect("p", "ghost").await.err().unwrap();
        assert_eq!(err.status_code(), 404);
        let err = store.get_or_connect("p", "nocreds").await.err().unwrap();
        assert_eq!(err.status_code(), 400);
        let err = store.get_or_connect("p", "noip").await.err().unwrap();
        assert!(err.to_string().contains("missing 'ip'"));
    }

    #[tokio::test]
    async fn test_concurrent_connects_keep_one_session() {
        let fleet = ScriptedFleet::new();
        let store = store(&fleet, 900.0);

        let (a, b) = tokio::join!(
            store.get_or_connect("page-1", "r1"),
            store.get_or_connect("page-1", "r1")
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.session_count(), 1);
    }
}
