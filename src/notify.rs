use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{DevEui, Ms, ReservationStatus, SpaceStatus, TenantId, TransitionCause};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SpaceChanged {
        space_id: Ulid,
        from: SpaceStatus,
        to: SpaceStatus,
        cause: TransitionCause,
        at: Ms,
    },
    ReservationChanged {
        reservation_id: Ulid,
        space_id: Ulid,
        status: ReservationStatus,
        at: Ms,
    },
    /// A spooled uplink exhausted its retries.
    UplinkDeadLettered {
        spool_id: Ulid,
        dev_eui: DevEui,
        retries: u32,
        error: String,
        at: Ms,
    },
}

/// Broadcast hub: per-tenant change feeds plus a platform-wide alert feed.
pub struct NotifyHub {
    channels: DashMap<TenantId, broadcast::Sender<Notice>>,
    alerts: broadcast::Sender<Notice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            alerts: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to a tenant's notices. Creates the channel if needed.
    pub fn subscribe(&self, tenant_id: TenantId) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Notice> {
        self.alerts.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, tenant_id: TenantId, notice: Notice) {
        if let Some(sender) = self.channels.get(&tenant_id) {
            let _ = sender.send(notice);
        }
    }

    /// Alerts go to the platform feed and to the owning tenant's feed.
    pub fn alert(&self, tenant_id: Option<TenantId>, notice: Notice) {
        if let Some(tenant_id) = tenant_id {
            self.send(tenant_id, notice.clone());
        }
        let _ = self.alerts.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(space_id: Ulid) -> Notice {
        Notice::SpaceChanged {
            space_id,
            from: SpaceStatus::Free,
            to: SpaceStatus::Occupied,
            cause: TransitionCause::Sensor,
            at: 1,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let tenant = Ulid::new();
        let mut rx = hub.subscribe(tenant);
        let notice = changed(Ulid::new());
        hub.send(tenant, notice.clone());
        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_b = hub.subscribe(b);
        hub.send(a, changed(Ulid::new()));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn alerts_reach_platform_feed() {
        let hub = NotifyHub::new();
        let tenant = Ulid::new();
        let mut alerts = hub.subscribe_alerts();
        let mut tenant_rx = hub.subscribe(tenant);
        let notice = Notice::UplinkDeadLettered {
            spool_id: Ulid::new(),
            dev_eui: DevEui::parse("0011223344556677").unwrap(),
            retries: 9,
            error: "busy".into(),
            at: 5,
        };
        hub.alert(Some(tenant), notice.clone());
        assert_eq!(alerts.recv().await.unwrap(), notice);
        assert_eq!(tenant_rx.recv().await.unwrap(), notice);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Ulid::new(), changed(Ulid::new()));
        hub.alert(None, changed(Ulid::new()));
    }
}
