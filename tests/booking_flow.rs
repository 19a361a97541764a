//! Service-level flows: booking, sensor uplinks, background jobs, restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use parkd::clock::ManualClock;
use parkd::config::Config;
use parkd::engine::{Booking, EngineError, ReservationRequest, SensorOutcome};
use parkd::model::{DevEui, Ms, ReservationStatus, SpaceStatus};
use parkd::scheduler::JobOutcome;
use parkd::service::Service;
use parkd::tenant::{PLATFORM_TENANT, Principal, Role, Scope, TenantContext};
use parkd::uplink::{Receipt, signature};

/// 2025-01-01T09:00:00Z
const NINE: Ms = 1_735_722_000_000;
const TEN: Ms = 1_735_725_600_000;
const ELEVEN: Ms = 1_735_729_200_000;
const NOON: Ms = 1_735_732_800_000;
const ONE_PM: Ms = 1_735_736_400_000;

const SECRET: &str = "gateway-secret";
const SENSOR: &str = "A84041000181C5D2";

fn data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkd_it").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.data_dir = dir.to_path_buf();
    cfg.platform_admins = vec!["ops@platform".into()];
    cfg.ingest.webhook_secret = Some(SECRET.into());
    cfg
}

fn open(dir: &Path, clock: &Arc<ManualClock>) -> Service {
    assert_ok!(Service::open_with(config(dir), clock.clone(), None))
}

fn req(space_id: Ulid, start: Ms, end: Ms, request_id: &str) -> ReservationRequest {
    ReservationRequest {
        space_id,
        start,
        end,
        requester: "driver@example.com".into(),
        request_id: request_id.into(),
    }
}

fn uplink(fcnt: u32, data: &str) -> (Vec<u8>, String) {
    let body = serde_json::json!({
        "deviceInfo": { "devEui": SENSOR },
        "fCnt": fcnt,
        "data": data,
    })
    .to_string()
    .into_bytes();
    let sig = signature::sign(SECRET, &body);
    (body, sig)
}

/// A tenant with an admin and a desk operator, and one registered space.
async fn lot(svc: &Service) -> (TenantContext, TenantContext, Ulid) {
    let tenant = Ulid::new();
    svc.tenants.grant("admin@acme", tenant, Role::Admin);
    svc.tenants.grant("desk@acme", tenant, Role::Operator);
    let admin = assert_ok!(svc.tenants.resolve(&Principal {
        subject: "admin@acme".into(),
        tenant_id: tenant,
    }));
    let desk = assert_ok!(svc.tenants.resolve(&Principal {
        subject: "desk@acme".into(),
        tenant_id: tenant,
    }));
    let space = Ulid::new();
    assert_ok!(
        svc.engine
            .register_space(&admin, space, Some("S1".into()))
            .await
    );
    (admin, desk, space)
}

#[tokio::test]
async fn reserve_conflict_and_replay() {
    let dir = data_dir("reserve_conflict_and_replay");
    let clock = Arc::new(ManualClock::new(NINE));
    let svc = open(&dir, &clock);
    let (_admin, desk, s1) = lot(&svc).await;

    let r1 = match assert_ok!(
        svc.engine
            .create_reservation(&desk, req(s1, TEN, NOON, "r1"))
            .await
    ) {
        Booking::Created(r) => r,
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!(r1.status, ReservationStatus::Confirmed);
    let space = assert_ok!(svc.engine.get_space(&desk, s1).await);
    assert_eq!(space.status, SpaceStatus::Reserved);

    let second = assert_ok!(
        svc.engine
            .create_reservation(&desk, req(s1, ELEVEN, ONE_PM, "r2"))
            .await
    );
    match second {
        Booking::Conflict(conflicts) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].reservation_id, r1.id);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    let retry = assert_ok!(
        svc.engine
            .create_reservation(&desk, req(s1, ELEVEN, ONE_PM, "r1"))
            .await
    );
    assert_eq!(retry, Booking::Replayed(r1.clone()));

    let listed = assert_ok!(
        svc.engine
            .list_reservations(&desk, Scope::Own, Some(s1), None)
            .await
    );
    assert_eq!(listed, vec![r1]);
    svc.shutdown().await;
}

#[tokio::test]
async fn other_tenants_cannot_see_or_book() {
    let dir = data_dir("other_tenants_cannot_see_or_book");
    let clock = Arc::new(ManualClock::new(NINE));
    let svc = open(&dir, &clock);
    let (_admin, _desk, s1) = lot(&svc).await;

    let rival = Ulid::new();
    svc.tenants.grant("desk@rival", rival, Role::Operator);
    let outsider = assert_ok!(svc.tenants.resolve(&Principal {
        subject: "desk@rival".into(),
        tenant_id: rival,
    }));

    assert_eq!(
        svc.engine.get_space(&outsider, s1).await,
        Err(EngineError::NotFound(s1))
    );
    assert_err!(
        svc.engine
            .create_reservation(&outsider, req(s1, TEN, NOON, "x1"))
            .await
    );
    let visible = assert_ok!(svc.engine.list_spaces(&outsider, Scope::Own, None).await);
    assert!(visible.is_empty());

    // Platform admin sees across tenants.
    let ops = assert_ok!(svc.tenants.resolve(&Principal {
        subject: "ops@platform".into(),
        tenant_id: PLATFORM_TENANT,
    }));
    let all = assert_ok!(svc.engine.list_spaces(&ops, Scope::All, None).await);
    assert_eq!(all.len(), 1);
    svc.shutdown().await;
}

#[tokio::test]
async fn sensor_uplinks_drive_occupancy() {
    let dir = data_dir("sensor_uplinks_drive_occupancy");
    let clock = Arc::new(ManualClock::new(NINE));
    let svc = open(&dir, &clock);
    let (admin, desk, s1) = lot(&svc).await;
    let sensor = DevEui::parse(SENSOR).unwrap();
    assert_ok!(svc.engine.assign_sensor(&admin, s1, sensor.clone()).await);
    assert_ok!(
        svc.engine
            .create_reservation(&desk, req(s1, TEN, NOON, "r1"))
            .await
    );

    clock.set(TEN + 5 * 60_000);
    let (body, sig) = uplink(7, "01");
    let receipt = assert_ok!(svc.ingestor.receive_webhook(&body, &sig).await);
    assert_eq!(
        receipt,
        Receipt::Applied(SensorOutcome::Changed {
            from: SpaceStatus::Reserved,
            to: SpaceStatus::Occupied,
        })
    );

    // Gateway redelivery.
    let again = assert_ok!(svc.ingestor.receive_webhook(&body, &sig).await);
    assert_eq!(again, Receipt::Duplicate);
    assert_eq!(svc.ingestor.readings(&admin, &sensor).len(), 1);

    // Forged signature.
    assert_err!(svc.ingestor.receive_webhook(&body, "sha256=00").await);

    // Car leaves while the booking is still running.
    clock.set(ELEVEN);
    let (body, sig) = uplink(8, "00");
    assert_ok!(svc.ingestor.receive_webhook(&body, &sig).await);
    let space = assert_ok!(svc.engine.get_space(&desk, s1).await);
    assert_eq!(space.status, SpaceStatus::Reserved);

    // After the booking ends the expiry job releases the space.
    clock.set(ONE_PM);
    let outcome = svc.scheduler.trigger("expire_reservations").await;
    assert_eq!(outcome, Some(JobOutcome::Completed("expired 1, busy 0".into())));
    let space = assert_ok!(svc.engine.get_space(&desk, s1).await);
    assert_eq!(space.status, SpaceStatus::Free);
    svc.shutdown().await;
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = data_dir("state_survives_restart");
    let clock = Arc::new(ManualClock::new(NINE));

    let (desk, s1, r1) = {
        let svc = open(&dir, &clock);
        let (admin, desk, s1) = lot(&svc).await;
        assert_ok!(
            svc.engine
                .assign_sensor(&admin, s1, DevEui::parse(SENSOR).unwrap())
                .await
        );
        let r1 = match assert_ok!(
            svc.engine
                .create_reservation(&desk, req(s1, TEN, NOON, "r1"))
                .await
        ) {
            Booking::Created(r) => r,
            other => panic!("expected Created, got {other:?}"),
        };
        let (body, sig) = uplink(1, "01");
        assert_ok!(svc.ingestor.receive_webhook(&body, &sig).await);
        let outcome = svc.scheduler.trigger("compact_journals").await;
        assert!(matches!(outcome, Some(JobOutcome::Completed(_))));
        svc.shutdown().await;
        (desk, s1, r1)
    };

    let svc = open(&dir, &clock);
    let space = assert_ok!(svc.engine.get_space(&desk, s1).await);
    assert_eq!(space.status, SpaceStatus::Occupied);
    assert_eq!(space.active_reservations, 1);
    let stored = assert_ok!(svc.engine.get_reservation(&desk, r1.id).await);
    assert_eq!(stored, r1);

    // Idempotency keys and dedup cursors came back too.
    let retry = assert_ok!(
        svc.engine
            .create_reservation(&desk, req(s1, TEN, NOON, "r1"))
            .await
    );
    assert_eq!(retry, Booking::Replayed(r1));
    let (body, sig) = uplink(1, "01");
    let receipt = assert_ok!(svc.ingestor.receive_webhook(&body, &sig).await);
    assert_eq!(receipt, Receipt::Duplicate);
    svc.shutdown().await;
}
