mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Semaphore;

use care_tracker_lib::commands;
use care_tracker_lib::controller::{ControllerOptions, ControllerState, SampleOrigin, SyncError};
use care_tracker_lib::geo::Coordinate;
use care_tracker_lib::geocode::ADDRESS_UNAVAILABLE;
use care_tracker_lib::position::{PositionError, PositionOptions, PositionSource};
use care_tracker_lib::scheduler::{BackgroundOptions, BackgroundScheduler, HeadlessUploadTask, TaskId};

use common::*;

#[tokio::test]
async fn granted_one_shot_uploads_and_resolves_once() {
    let mut harness = Harness::new();
    harness.resolver = Arc::new(SpyResolver::failing());
    let here = Coordinate::new(25.03, 121.56);
    harness.location.queue_one_shot(Ok(here));

    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Active);

    eventually("upload and address", || {
        !harness.uploader.calls().is_empty() && controller.snapshot().address().is_some()
    })
    .await;

    assert_eq!(harness.uploader.calls(), vec![here]);
    assert_eq!(harness.resolver.calls(), vec![(here, "zh-TW".to_string())]);

    let view = controller.snapshot();
    assert_eq!(view.coordinate(), Some(here));
    assert_eq!(view.address(), Some(ADDRESS_UNAVAILABLE));
    assert_eq!(view.origin, Some(SampleOrigin::OneShot));

    assert_eq!(harness.location.live_subscriptions(), 1);
    assert_eq!(harness.background.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.background.configured.lock().unwrap().as_ref().map(|o| o.interval_minutes),
        Some(15)
    );
}

#[tokio::test]
async fn fine_permission_denied_starts_nothing() {
    let mut harness = Harness::new();
    harness.permissions = Arc::new(MockPermissions::new(false, true, true));
    harness.location.queue_one_shot(Ok(Coordinate::new(25.03, 121.56)));

    let controller = harness.controller(ControllerOptions::default());
    let result = controller.mount().await;

    assert!(matches!(result, Err(SyncError::PermissionDenied)));
    assert_eq!(controller.state(), ControllerState::TornDown);

    settle().await;
    assert_eq!(harness.location.watch_starts.load(Ordering::SeqCst), 0);
    assert_eq!(harness.location.one_shot_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.background.starts.load(Ordering::SeqCst), 0);
    assert!(harness.uploader.calls().is_empty());
}

#[tokio::test]
async fn every_watch_fix_is_uploaded() {
    let harness = Harness::new();
    let controller = harness.controller(options_with_filter(0.0));
    controller.mount().await.unwrap();

    let start = Coordinate::new(25.03, 121.56);
    let fixes: Vec<Coordinate> = (0..5).map(|i| north_of(start, 100.0 * i as f64)).collect();
    for fix in &fixes {
        assert_eq!(harness.location.push(Ok(*fix)), 1);
    }

    eventually("five uploads", || harness.uploader.calls().len() == 5).await;
    settle().await;

    assert_eq!(harness.uploader.calls(), fixes);
    assert_eq!(controller.snapshot().coordinate(), fixes.last().copied());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uploads_keep_fix_order_on_multi_thread_runtime() {
    for _ in 0..10 {
        let harness = Harness::new();
        let controller = harness.controller(options_with_filter(0.0));
        controller.mount().await.unwrap();

        let start = Coordinate::new(25.03, 121.56);
        let fixes: Vec<Coordinate> = (1..=40).map(|i| north_of(start, 10.0 * i as f64)).collect();
        for fix in &fixes {
            harness.location.push(Ok(*fix));
        }

        eventually("forty uploads", || harness.uploader.calls().len() == 40).await;
        assert_eq!(harness.uploader.calls(), fixes);
        eventually("queue drained", || controller.snapshot().uploads_in_flight == 0).await;
        assert_eq!(controller.snapshot().upload_seq, 40);
    }
}

#[tokio::test]
async fn newer_successful_upload_clears_older_failure() {
    let here = Coordinate::new(25.03, 121.56);
    let mut harness = Harness::new();
    harness.uploader = Arc::new(SpyUploader::failing_for(here));

    let controller = harness.controller(options_with_filter(0.0));
    controller.mount().await.unwrap();

    harness.location.push(Ok(here));
    eventually("failure recorded", || controller.snapshot().last_upload_error.is_some()).await;

    harness.location.push(Ok(north_of(here, 100.0)));
    eventually("both uploads settled", || {
        let view = controller.snapshot();
        view.uploads_in_flight == 0 && view.upload_seq == 2
    })
    .await;

    let view = controller.snapshot();
    assert!(view.last_upload_error.is_none());
    assert!(view.last_uploaded_at.is_some());
}

#[tokio::test]
async fn refusing_background_grant_keeps_foreground_tracking() {
    let mut harness = Harness::new();
    harness.permissions = Arc::new(MockPermissions::new(true, true, false));

    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();

    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(harness.permissions.requests.load(Ordering::SeqCst), 2);
    assert_eq!(harness.location.live_subscriptions(), 1);
}

#[tokio::test]
async fn required_background_grant_is_enforced() {
    let mut harness = Harness::new();
    harness.permissions = Arc::new(MockPermissions::new(true, true, false));

    let mut options = ControllerOptions::default();
    options.require_background = true;
    let controller = harness.controller(options);

    assert!(matches!(controller.mount().await, Err(SyncError::PermissionDenied)));
    assert_eq!(harness.permissions.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn sub_threshold_movement_is_not_uploaded() {
    let harness = Harness::new();
    let controller = harness.controller(options_with_filter(3.0));
    controller.mount().await.unwrap();

    let start = Coordinate::new(25.03, 121.56);
    harness.location.push(Ok(start));
    harness.location.push(Ok(north_of(start, 2.0)));
    harness.location.push(Ok(north_of(start, 4.0)));

    eventually("two uploads", || harness.uploader.calls().len() == 2).await;
    settle().await;

    assert_eq!(harness.uploader.calls(), vec![start, north_of(start, 4.0)]);
}

#[tokio::test]
async fn watch_errors_produce_no_sample() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();

    harness.location.push(Err(PositionError::Timeout));
    settle().await;

    assert!(harness.uploader.calls().is_empty());
    assert_eq!(controller.state(), ControllerState::Active);
}

#[tokio::test]
async fn nothing_changes_after_teardown() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = Harness::new();
    harness.uploader = Arc::new(SpyUploader::held(gate.clone()));

    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();

    let here = Coordinate::new(25.03, 121.56);
    harness.location.push(Ok(here));
    eventually("upload in flight", || harness.uploader.calls().len() == 1).await;
    eventually("address applied", || controller.snapshot().address().is_some()).await;

    controller.unmount();
    let frozen = controller.snapshot();
    assert_eq!(frozen.uploads_in_flight, 1);

    // Late completions and late producers
    gate.add_permits(10);
    assert_eq!(harness.location.push(Ok(north_of(here, 500.0))), 0);
    controller.scheduler().wake(TaskId::from("late-wake")).await;
    settle().await;

    assert_eq!(controller.snapshot(), frozen);
    assert_eq!(controller.state(), ControllerState::TornDown);
    assert_eq!(harness.uploader.calls().len(), 1);
    assert_eq!(harness.location.live_subscriptions(), 0);
    assert_eq!(harness.background.stops.load(Ordering::SeqCst), 1);
    assert_eq!(harness.background.finished(), vec![TaskId::from("late-wake")]);

    controller.unmount();
    assert_eq!(harness.background.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmount_during_permission_prompt_starts_nothing() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = Harness::new();
    harness.permissions = Arc::new(MockPermissions::held(gate.clone()));

    let controller = Arc::new(harness.controller(ControllerOptions::default()));
    let mounting = tokio::spawn({
        let controller = controller.clone();
        async move { controller.mount().await }
    });

    eventually("prompt shown", || harness.permissions.requests.load(Ordering::SeqCst) == 1).await;
    assert_eq!(controller.state(), ControllerState::PermissionPending);

    controller.unmount();
    gate.add_permits(3);

    let result = mounting.await.unwrap();
    assert!(matches!(result, Err(SyncError::TornDown)));
    assert_eq!(harness.location.watch_starts.load(Ordering::SeqCst), 0);
    assert_eq!(harness.background.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mount_is_not_reentrant() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();

    let again = controller.mount().await;
    assert!(matches!(
        again,
        Err(SyncError::InvalidTransition { from: ControllerState::Active, .. })
    ));
    assert_eq!(harness.location.watch_starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.background.starts.load(Ordering::SeqCst), 1);

    controller.unmount();
    assert!(controller.mount().await.is_err());
}

#[tokio::test]
async fn background_fetch_error_still_finishes_wake() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();
    settle().await;

    controller.scheduler().wake(TaskId::from("bg-1")).await;

    assert_eq!(harness.background.finished(), vec![TaskId::from("bg-1")]);
    assert!(harness.uploader.calls().is_empty());
    assert_eq!(controller.state(), ControllerState::Active);
}

#[tokio::test]
async fn background_fix_goes_through_the_same_pipeline() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();
    settle().await;

    let here = Coordinate::new(24.99, 121.30);
    harness.location.queue_one_shot(Ok(here));
    controller.scheduler().wake(TaskId::from("bg-2")).await;

    eventually("background upload", || harness.uploader.calls() == vec![here]).await;
    assert_eq!(harness.background.finished(), vec![TaskId::from("bg-2")]);
    assert_eq!(controller.snapshot().origin, Some(SampleOrigin::Background));
}

#[tokio::test]
async fn manual_upload_requires_active_controller() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());

    assert!(matches!(
        controller.upload_now().await,
        Err(SyncError::InvalidTransition { from: ControllerState::Idle, .. })
    ));

    controller.mount().await.unwrap();
    settle().await;

    let here = Coordinate::new(25.05, 121.52);
    harness.location.queue_one_shot(Ok(here));
    assert_eq!(controller.upload_now().await.unwrap(), here);

    eventually("manual upload", || harness.uploader.calls() == vec![here]).await;
    eventually("uploaded timestamp", || controller.snapshot().last_uploaded_at.is_some()).await;
    assert_eq!(controller.snapshot().origin, Some(SampleOrigin::Manual));
}

#[tokio::test]
async fn view_subscribers_are_notified() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());
    let mut rx = controller.subscribe();
    controller.mount().await.unwrap();

    harness.location.push(Ok(Coordinate::new(25.03, 121.56)));

    tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(rx.borrow().revision > 0);
}

#[tokio::test]
async fn dropping_the_controller_tears_down() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());
    controller.mount().await.unwrap();
    assert_eq!(harness.location.live_subscriptions(), 1);

    drop(controller);

    assert_eq!(harness.location.live_subscriptions(), 0);
    assert_eq!(harness.background.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn location_status_reflects_samples() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());

    let idle = commands::location_status(&controller);
    assert_eq!(idle.state, "idle");
    assert!(idle.latitude.is_none());
    assert!(idle.last_uploaded_at.is_none());
    assert!(!idle.uploading);

    controller.mount().await.unwrap();
    let here = Coordinate::new(25.03, 121.56);
    harness.location.push(Ok(here));
    eventually("upload and address", || {
        let view = controller.snapshot();
        view.last_uploaded_at.is_some() && view.address().is_some()
    })
    .await;

    let status = commands::location_status(&controller);
    assert_eq!(status.state, "active");
    assert_eq!(status.latitude, Some(here.latitude));
    assert_eq!(status.longitude, Some(here.longitude));
    assert_eq!(status.address.as_deref(), Some("No. 7, Xinyi Rd"));
    assert_eq!(status.last_uploaded_at.map(|t| t.len()), Some("YYYY-MM-DD HH:MM:SS".len()));
    assert!(!status.uploading);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn upload_current_location_command() {
    let harness = Harness::new();
    let controller = harness.controller(ControllerOptions::default());

    let refused = commands::upload_current_location(&controller).await;
    assert!(!refused.success);
    assert!(refused.error.is_some());
    assert!(refused.latitude.is_none());

    controller.mount().await.unwrap();
    settle().await;

    let here = Coordinate::new(25.05, 121.52);
    harness.location.queue_one_shot(Ok(here));
    let result = commands::upload_current_location(&controller).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.latitude, Some(here.latitude));
    eventually("manual upload", || harness.uploader.calls() == vec![here]).await;
}

#[tokio::test]
async fn headless_wake_uploads_fix_and_finishes() {
    let harness = Harness::new();
    let scheduler = headless_scheduler(&harness);

    let here = Coordinate::new(24.99, 121.30);
    harness.location.queue_one_shot(Ok(here));
    scheduler.wake(TaskId::from("headless-1")).await;

    assert_eq!(harness.uploader.calls(), vec![here]);
    assert_eq!(harness.background.finished(), vec![TaskId::from("headless-1")]);
}

#[tokio::test]
async fn headless_wake_without_fix_finishes_once() {
    let harness = Harness::new();
    let scheduler = headless_scheduler(&harness);

    scheduler.wake(TaskId::from("headless-2")).await;
    scheduler.expire(&TaskId::from("headless-2"));

    assert!(harness.uploader.calls().is_empty());
    assert_eq!(harness.background.finished(), vec![TaskId::from("headless-2")]);
}

fn headless_scheduler(harness: &Harness) -> BackgroundScheduler {
    let task = HeadlessUploadTask::new(
        PositionSource::new(harness.location.clone()),
        harness.uploader.clone(),
        PositionOptions::one_shot(),
    );
    let scheduler = BackgroundScheduler::new(harness.background.clone());
    scheduler.configure(&BackgroundOptions::default(), Arc::new(task), None).unwrap();
    scheduler.start().unwrap();
    scheduler
}
