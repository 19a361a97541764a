use std::io;
use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::Engine;
use crate::notify::NotifyHub;
use crate::scheduler::{InventorySync, Scheduler};
use crate::tenant::{PLATFORM_TENANT, Role, TenantDirectory};
use crate::uplink::Ingestor;

/// Everything a process needs: both journals replayed, components wired.
pub struct Service {
    pub config: Config,
    pub engine: Arc<Engine>,
    pub ingestor: Arc<Ingestor>,
    pub tenants: Arc<TenantDirectory>,
    pub notify: Arc<NotifyHub>,
    pub scheduler: Scheduler,
}

impl Service {
    pub fn open(config: Config) -> io::Result<Self> {
        Self::open_with(config, Arc::new(SystemClock), None)
    }

    pub fn open_with(
        config: Config,
        clock: Arc<dyn Clock>,
        inventory: Option<Arc<dyn InventorySync>>,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::open(
            &config.state_wal_path(),
            config.booking.clone(),
            clock.clone(),
            notify.clone(),
        )?);
        let ingestor = Arc::new(Ingestor::open(
            &config.uplink_wal_path(),
            engine.clone(),
            config.ingest.clone(),
            clock.clone(),
            notify.clone(),
        )?);

        let tenants = Arc::new(TenantDirectory::new());
        for subject in &config.platform_admins {
            tenants.grant(subject, PLATFORM_TENANT, Role::Owner);
        }

        let scheduler = Scheduler::new(
            engine.clone(),
            ingestor.clone(),
            inventory,
            clock,
            config.jobs.clone(),
            config.compact_threshold,
        );

        info!(
            "opened {} spaces, {} spooled uplinks from {}",
            engine.space_count(),
            ingestor.spool_depth(),
            config.data_dir.display()
        );
        if config.ingest.webhook_secret.is_none() {
            tracing::warn!("no webhook secret configured, every uplink will be rejected");
        }

        Ok(Self {
            config,
            engine,
            ingestor,
            tenants,
            notify,
            scheduler,
        })
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stop background jobs. Journals flush on every append, nothing else to drain.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
