mod common;

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use common::{FaultyStore, Harness};
use inventory_service::models::{Reservation, ReservationStatus};
use inventory_service::reaper::{ExpirationReaper, ReaperSettings};
use inventory_service::reservations::CreateReservation;

async fn reserve(h: &Harness, item_id: Uuid, quantity: i32, timeout_minutes: i64) -> Reservation {
    h.orchestrator
        .create_reservation(
            CreateReservation::new(item_id, Uuid::new_v4(), quantity).with_timeout_minutes(timeout_minutes),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn sweep_expires_overdue_holds_once() {
    let h = Harness::new();
    let item_id = h.seed_item(5).await;
    let overdue = reserve(&h, item_id, 2, 10).await;
    let fresh = reserve(&h, item_id, 1, 60).await;

    h.clock.advance(Duration::minutes(11));
    let report = h.reaper.sweep().await.unwrap();
    assert_eq!((report.examined, report.expired, report.failed), (1, 1, 0));

    let expired = h.store.find_reservation(&overdue.reservation_id).await.unwrap().unwrap();
    assert_eq!(expired.status, ReservationStatus::Expired);
    assert_eq!(expired.expired_at, Some(h.clock_now()));
    let untouched = h.store.find_reservation(&fresh.reservation_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, ReservationStatus::Pending);

    let item = h.item(item_id).await;
    assert_eq!((item.available_quantity, item.pending_reservations), (5, 1));

    let again = h.reaper.sweep().await.unwrap();
    assert_eq!((again.examined, again.expired), (0, 0));
    assert_eq!(h.item(item_id).await.pending_reservations, 1);

    let names = h.sink.event_names();
    assert_eq!(names.iter().filter(|n| **n == "ReservationExpired").count(), 1);
}

#[tokio::test]
async fn expired_reservations_are_terminal() {
    let h = Harness::new();
    let item_id = h.seed_item(5).await;
    let reservation = reserve(&h, item_id, 2, 10).await;
    h.clock.advance(Duration::minutes(10));

    h.reaper.sweep().await.unwrap();
    let item_after_sweep = h.item(item_id).await;

    let err = h
        .orchestrator
        .cancel_reservation(&reservation.reservation_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidStateTransition");
    let err = h
        .orchestrator
        .confirm_reservation(&reservation.reservation_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidStateTransition");
    assert_eq!(h.item(item_id).await, item_after_sweep);
}

#[tokio::test]
async fn extended_and_confirmed_rows_are_left_alone() {
    let h = Harness::new();
    let item_id = h.seed_item(5).await;
    let extended = reserve(&h, item_id, 1, 10).await;
    let confirmed = reserve(&h, item_id, 1, 10).await;

    h.clock.advance(Duration::minutes(5));
    h.orchestrator
        .extend_reservation(&extended.reservation_id, 30, None)
        .await
        .unwrap();
    h.orchestrator
        .confirm_reservation(&confirmed.reservation_id)
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(10));
    let report = h.reaper.sweep().await.unwrap();
    assert_eq!(report.examined, 0);

    let item = h.item(item_id).await;
    assert_eq!(
        (item.available_quantity, item.reserved_quantity, item.pending_reservations),
        (4, 1, 1)
    );
}

#[tokio::test]
async fn one_failing_row_does_not_abort_the_sweep() {
    let store = Arc::new(FaultyStore::default());
    let h = Harness::with_store(store.clone());
    let item_id = h.seed_item(10).await;

    let first = reserve(&h, item_id, 1, 5).await;
    let broken = reserve(&h, item_id, 2, 6).await;
    let third = reserve(&h, item_id, 3, 7).await;
    store.break_reservation(&broken.reservation_id);

    h.clock.advance(Duration::minutes(10));
    let report = h.reaper.sweep().await.unwrap();
    assert_eq!((report.examined, report.expired, report.failed), (3, 2, 1));

    for id in [&first.reservation_id, &third.reservation_id] {
        let r = h.store.find_reservation(id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Expired);
    }
    assert_eq!(h.item(item_id).await.pending_reservations, 2);

    // Retried on the next sweep once the store recovers.
    store.heal();
    let report = h.reaper.sweep().await.unwrap();
    assert_eq!((report.examined, report.expired), (1, 1));
    assert_eq!(h.item(item_id).await.pending_reservations, 0);
}

#[tokio::test]
async fn failing_rows_do_not_starve_newer_overdue_holds() {
    let store = Arc::new(FaultyStore::default());
    let h = Harness::with_store(store.clone());
    let item_id = h.seed_item(10).await;

    let oldest = reserve(&h, item_id, 1, 5).await;
    let older = reserve(&h, item_id, 1, 6).await;
    let newer = reserve(&h, item_id, 1, 7).await;
    store.break_reservation(&oldest.reservation_id);
    store.break_reservation(&older.reservation_id);

    let reaper = ExpirationReaper::new(
        h.orchestrator.clone(),
        ReaperSettings {
            batch_size: 2,
            ..ReaperSettings::default()
        },
    );
    h.clock.advance(Duration::minutes(10));
    let report = reaper.sweep().await.unwrap();
    assert_eq!((report.examined, report.expired, report.failed), (3, 1, 2));

    let r = h.store.find_reservation(&newer.reservation_id).await.unwrap().unwrap();
    assert_eq!(r.status, ReservationStatus::Expired);
    assert_eq!(h.item(item_id).await.pending_reservations, 2);
}

#[tokio::test(start_paused = true)]
async fn spawned_reaper_sweeps_and_stops() {
    let h = Harness::new();
    let item_id = h.seed_item(5).await;
    let reservation = reserve(&h, item_id, 2, 1).await;
    h.clock.advance(Duration::minutes(2));

    let handle = h.reaper.clone().spawn();
    // The first tick fires immediately.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    handle.shutdown().await;

    let r = h.store.find_reservation(&reservation.reservation_id).await.unwrap().unwrap();
    assert_eq!(r.status, ReservationStatus::Expired);
    assert_eq!(h.item(item_id).await.pending_reservations, 0);
}
