//! Process-level wiring.
//!
//! [`Agent`] owns one store, one monitor and (when configured) one
//! replication engine, and runs their loops on a shared cancellation token.

use std::sync::Arc;
use std::time::Duration;

use packetbuddy_core::{CounterSource, PowerSource, SystemCounters, SystemPower};
use packetbuddy_store::Store;
use thiserror::Error;
use time::UtcOffset;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::identity::DeviceIdentity;
use crate::maintenance::{MaintenanceSettings, run_maintenance_loop};
use crate::monitor::{Monitor, MonitorSettings};
use crate::state::{SharedStore, TaskStatus, share};
use crate::sync::{
    PostgresRemote, RemoteStore, ReplicationEngine, SyncError, SyncSettings, run_sync_loop,
};

/// Errors that prevent the agent from starting.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The local store could not be opened or is corrupt.
    #[error("Local store error: {0}")]
    Store(#[from] packetbuddy_store::Error),

    /// The device identity file could not be read or written.
    #[error("Device identity error: {0}")]
    Identity(#[from] std::io::Error),
}

/// Open the configured store, bucketing days in `offset`.
///
/// A corrupt database is an error; the caller should not start.
pub fn open_store(config: &Config, offset: UtcOffset) -> Result<Store, AgentError> {
    let store = Store::open(&config.storage.path).inspect_err(|e| {
        if e.is_fatal() {
            error!("Refusing to start: {}", e);
        }
    })?;
    Ok(store.with_utc_offset(offset))
}

/// Bind `store` to `identity`.
pub fn register(store: &mut Store, identity: &DeviceIdentity) -> Result<(), AgentError> {
    store.register_device(&identity.device_id, &identity.os_type, &identity.hostname)?;
    Ok(())
}

/// The Postgres replica, if sync is enabled and a usable URL is configured.
pub fn connect_remote(config: &Config) -> Option<Arc<dyn RemoteStore>> {
    let Some(url) = config.sync_url() else {
        info!("Sync disabled or no remote database configured, running local-only");
        return None;
    };

    match PostgresRemote::connect_lazy(&url, &config.database) {
        Ok(remote) => Some(Arc::new(remote)),
        Err(e) => {
            warn!("Remote database URL rejected, running local-only: {}", e);
            None
        }
    }
}

/// Everything the agent needs that touches the host or the network.
pub struct AgentParts<C, P> {
    /// The opened local store.
    pub store: Store,
    /// This install's identity.
    pub identity: DeviceIdentity,
    /// Counter source for the monitor.
    pub counters: C,
    /// Power source for the monitor.
    pub power: P,
    /// Replica, or `None` to run local-only.
    pub remote: Option<Arc<dyn RemoteStore>>,
}

/// A running agent.
pub struct Agent {
    store: SharedStore,
    identity: DeviceIdentity,
    monitor: Monitor,
    engine: Option<Arc<ReplicationEngine>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    status: TaskStatus,
    shutdown_timeout: Duration,
}

impl Agent {
    /// Start against the real host, store and replica.
    pub async fn start(config: &Config, offset: UtcOffset) -> Result<Self, AgentError> {
        let store = open_store(config, offset)?;
        let identity = DeviceIdentity::load_or_create(DeviceIdentity::default_path())?;
        let remote = connect_remote(config);

        Self::start_with(
            config,
            AgentParts {
                store,
                identity,
                counters: SystemCounters::new(),
                power: SystemPower::new(),
                remote,
            },
        )
        .await
    }

    /// Start with the given parts.
    pub async fn start_with<C, P>(config: &Config, parts: AgentParts<C, P>) -> Result<Self, AgentError>
    where
        C: CounterSource + 'static,
        P: PowerSource + 'static,
    {
        let AgentParts {
            mut store,
            identity,
            counters,
            power,
            remote,
        } = parts;

        register(&mut store, &identity)?;
        info!(
            "Starting agent for device {} ({}, {})",
            identity.device_id, identity.os_type, identity.hostname
        );

        let store = share(store);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let monitor = Monitor::new(
            Arc::clone(&store),
            counters,
            power,
            MonitorSettings::from(&config.monitoring),
        );
        tasks.push(monitor.start(cancel.clone()));

        let engine = remote.map(|remote| {
            Arc::new(ReplicationEngine::new(
                Arc::clone(&store),
                remote,
                identity.clone(),
                SyncSettings::from_config(config),
            ))
        });

        if let Some(engine) = &engine {
            let ready = Arc::clone(engine);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ready.ensure_ready().await {
                    warn!("Remote replica not ready yet, will retry on next sync: {}", e);
                }
            }));
            tasks.push(tokio::spawn(run_sync_loop(
                Arc::clone(engine),
                Duration::from_secs(config.sync.interval),
                cancel.clone(),
            )));
        }

        tasks.push(tokio::spawn(run_maintenance_loop(
            Arc::clone(&store),
            engine.clone(),
            MaintenanceSettings::from(&config.storage),
            cancel.clone(),
        )));

        let status = TaskStatus::new();
        status.set_running(true);

        Ok(Self {
            store,
            identity,
            monitor,
            engine,
            cancel,
            tasks,
            status,
            shutdown_timeout: Duration::from_secs(config.sync.shutdown_timeout),
        })
    }

    /// The shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// This install's identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The monitor.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// The replication engine, if sync is enabled.
    pub fn engine(&self) -> Option<&Arc<ReplicationEngine>> {
        self.engine.as_ref()
    }

    /// Running flag and start time.
    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    /// Stop every loop, flush buffered samples and run a final sync.
    ///
    /// Waiting on the loops and the final sync are each bounded by the
    /// configured shutdown timeout. Returns the final sync's result, or
    /// `None` when running local-only.
    pub async fn shutdown(mut self) -> Option<Result<usize, SyncError>> {
        info!("Shutting down");
        self.cancel.cancel();
        self.monitor.stop().await;

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for mut handle in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Background task did not stop in time, aborting it");
                handle.abort();
            }
        }

        let result = match &self.engine {
            Some(engine) => Some(engine.shutdown(self.shutdown_timeout).await),
            None => None,
        };

        self.status.set_running(false);
        info!("Agent stopped");
        result
    }
}
