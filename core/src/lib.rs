//! Core library for the messaging scheduling and dispatch engine.
//!
//! Components are constructed once at [`Engine::boot`] and wired together
//! by reference, per the design note against per-request factory closures:
//! the Event Bus is built first and handed (read-only, by clone) to every
//! producer; the State Store is the single source of truth everything else
//! re-reads from by id.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod contacts;
pub mod delivery_listener;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod job_runtime;
pub mod model;
pub mod rate_limiter;
pub mod retention;
pub mod scheduling;
pub mod store;
pub mod vault;

use std::path::Path;
use std::sync::Arc;

use config::EngineConfig;
use connection::{ConnectionManager, SocketFactory};
use contacts::ContactStore;
use delivery_listener::DeliveryListener;
use dispatcher::Dispatcher;
use error::Result;
use event_bus::EventBus;
use job_runtime::model::{JobKind, Schedule, SchedulePattern};
use job_runtime::JobRuntime;
use rate_limiter::RateLimiter;
use retention::RetentionSweeper;
use scheduling::SchedulingService;
use store::StateStore;
use vault::CredentialVault;

/// The fully wired engine: every component named in the design, built once
/// and held behind `Arc` where a component is shared across tasks.
pub struct Engine {
    pub store: StateStore,
    pub events: EventBus,
    pub rate_limiter: Arc<RateLimiter>,
    pub connection: Arc<ConnectionManager>,
    pub jobs: Arc<JobRuntime>,
    pub scheduling: Arc<SchedulingService>,
    pub retention: Arc<RetentionSweeper>,
}

impl Engine {
    /// Boots every component but does not yet start background loops — the
    /// caller supplies the `SocketFactory` and `ContactStore` collaborators
    /// that live outside the core, then calls [`Engine::start`].
    pub async fn boot(
        config: EngineConfig,
        data_dir: impl AsRef<Path>,
        passphrase: impl Into<String>,
        contacts: Arc<dyn ContactStore>,
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.as_ref();

        let store = StateStore::open(data_dir.join("engine.sqlite3")).await?;
        let events = EventBus::new();

        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), events.clone(), &config));
        let vault = CredentialVault::new(passphrase);
        let connection = Arc::new(ConnectionManager::new(vault, events.clone(), config.clone()));

        let delivery_listener = Arc::new(DeliveryListener::new(store.clone(), events.clone()));
        connection.register_hook(delivery_listener).await;

        let jobs = JobRuntime::open(data_dir.join("jobs")).await?;
        let retention = Arc::new(RetentionSweeper::new(store.clone(), config.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            rate_limiter.clone(),
            connection.clone(),
            contacts.clone(),
            events.clone(),
            retention.clone(),
            config.min_delay_ms,
            config.max_delay_ms,
        ));

        let scheduling = Arc::new(SchedulingService::new(
            store.clone(),
            rate_limiter.clone(),
            jobs.clone(),
            contacts,
            events.clone(),
            config.default_send_hour,
            config.birthday_template.clone(),
        ));

        jobs.start(dispatcher);
        jobs.upsert_schedule(Schedule {
            id: "retention-sweep".into(),
            pattern: SchedulePattern::Cron(retention.cron_expression()),
            end_date: None,
            max_occurrences: None,
            occurrence_count: 0,
            job_template: JobKind::Cleanup,
            last_fired_at: None,
        })
        .await?;

        Ok(Self { store, events, rate_limiter, connection, jobs, scheduling, retention })
    }

    /// Starts the Connection Manager's control loop against a concrete
    /// socket implementation. Kept separate from `boot` so tests can build
    /// an `Engine` without ever opening a real socket.
    pub fn start(&self, factory: Arc<dyn SocketFactory>) {
        self.connection.start(self.store.clone(), factory);
    }

    /// Drains in the order the concurrency model requires: job consumer
    /// first (letting an in-flight send finish), then the schedule
    /// producer, then the Connection Manager's socket, then the State
    /// Store — which needs no explicit close, since nothing above it can
    /// issue a write once the first three have stopped.
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
        self.connection.destroy().await;
    }
}
