mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{peer, wait_connected_to, wait_for_view, Harness, InMemoryClient};
use mesh_peer_core::{
    media::{MediaDevices, SyntheticDevices, TrackKind},
    registry::RegistryApi,
    teardown::LeaveOutcome,
    MeshSession, SessionDeps, SessionError,
};
use mesh_protocol::{PeerId, PeerRecord, RoomId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[test_timeout::tokio_timeout_test(paused)]
async fn steady_room_triggers_no_further_calls() {
    let harness = Harness::new(8);
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;
    wait_connected_to(&aaa, &["bbb"]).await;
    wait_connected_to(&bbb, &["aaa"]).await;

    let before = harness.network.call_log().len();
    // Several resync ticks, heartbeats and keepalives.
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(harness.network.call_log().len(), before);
    assert_eq!(aaa.active_participants().len(), 1);

    aaa.leave().await.unwrap();
    bbb.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failed_call_is_retried() {
    let harness = Harness::new(8);
    harness.network.fail_next_calls(&peer("aaa"), 1);
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;

    wait_connected_to(&aaa, &["bbb"]).await;
    wait_connected_to(&bbb, &["aaa"]).await;
    assert_eq!(harness.network.call_log().len(), 2);
    assert_eq!(harness.network.open_calls_between(&peer("aaa"), &peer("bbb")), 1);

    aaa.leave().await.unwrap();
    bbb.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn lost_call_is_redialled_after_the_wait() {
    let harness = Harness::new(8);
    harness.network.lose_next_calls(&peer("aaa"), 1);
    let started = Instant::now();
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;

    wait_connected_to(&aaa, &["bbb"]).await;
    wait_connected_to(&bbb, &["aaa"]).await;
    assert!(started.elapsed() >= harness.config().callee_timeout);
    assert_eq!(harness.network.call_log().len(), 2);
    assert_eq!(harness.network.open_calls_between(&peer("aaa"), &peer("bbb")), 1);

    aaa.leave().await.unwrap();
    bbb.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failed_negotiation_only_affects_that_pair() {
    let harness = Harness::new(8);
    harness.network.fail_next_answers(&peer("ccc"), 1);
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;
    let ccc = harness.start("ccc").await;

    wait_connected_to(&aaa, &["bbb", "ccc"]).await;
    wait_connected_to(&bbb, &["aaa", "ccc"]).await;
    wait_connected_to(&ccc, &["aaa", "bbb"]).await;
    assert_eq!(harness.network.established().len(), 3);

    for session in [aaa, bbb, ccc] {
        let outcome = session.leave().await.unwrap();
        assert!(outcome.error.is_none());
    }
}

#[test_timeout::tokio_timeout_test(paused)]
async fn registry_expiry_is_healed_by_heartbeat() {
    let harness = Harness::new(8);
    let started = Instant::now();
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;
    wait_connected_to(&aaa, &["bbb"]).await;

    let expired = harness
        .registry
        .expire_stale(Duration::ZERO, Instant::now() + Duration::from_secs(1));
    assert_eq!(expired.len(), 2);

    while harness.present().len() < 2 {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(Instant::now() - started <= harness.config().heartbeat_interval * 2);
    wait_connected_to(&aaa, &["bbb"]).await;
    wait_connected_to(&bbb, &["aaa"]).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.network.open_calls_between(&peer("aaa"), &peer("bbb")), 1);

    aaa.leave().await.unwrap();
    bbb.leave().await.unwrap();
}

/// Delegates to the in-memory registry but never answers a leave.
struct HangingLeave(Arc<InMemoryClient>);

#[async_trait]
impl RegistryApi for HangingLeave {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<PeerRecord, SessionError> {
        self.0.join(room, peer).await
    }

    async fn leave(&self, _room: &RoomId, _peer: &PeerId) -> Result<(), SessionError> {
        std::future::pending().await
    }

    async fn heartbeat(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError> {
        self.0.heartbeat(room, peer).await
    }
}

#[test_timeout::tokio_timeout_test(paused)]
async fn teardown_completes_when_leave_hangs() {
    let harness = Harness::new(8);
    let mut deps = harness.deps("aaa");
    deps.registry = Arc::new(HangingLeave(harness.client("aaa")));
    let aaa = MeshSession::start(harness.config(), deps).await.unwrap();
    let bbb = harness.start("bbb").await;
    wait_connected_to(&aaa, &["bbb"]).await;

    let stream = aaa.local_stream();
    let started = Instant::now();
    let outcome = aaa.leave().await.unwrap();
    assert_eq!(outcome.report.registry_leave, LeaveOutcome::TimedOut);
    assert_eq!(outcome.report.connections_closed, 1);
    assert_eq!(outcome.report.tracks_stopped, 2);
    assert!(stream.tracks().iter().all(|track| track.is_stopped()));
    assert!(started.elapsed() <= harness.config().leave_timeout + Duration::from_millis(100));

    // The other side sees the call drop even though aaa is still listed.
    wait_for_view(&bbb, "call dropped", |view| view.active_participants.is_empty()).await;
    bbb.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn dropping_the_handle_leaves_the_room() {
    let harness = Harness::new(8);
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;
    wait_connected_to(&aaa, &["bbb"]).await;

    drop(bbb);
    wait_for_view(&aaa, "bbb gone", |view| view.active_participants.is_empty()).await;
    assert_eq!(harness.present(), vec![peer("aaa")]);
    aaa.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn mute_reaches_the_remote_copy() {
    let harness = Harness::new(8);
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;
    wait_connected_to(&aaa, &["bbb"]).await;
    wait_connected_to(&bbb, &["aaa"]).await;

    aaa.set_audio_enabled(false);
    let remote = bbb.remote_streams()[&peer("aaa")].clone();
    for track in remote.tracks() {
        assert_eq!(track.is_enabled(), track.kind() == TrackKind::Video);
    }
    aaa.set_audio_enabled(true);
    assert!(remote.tracks().iter().all(|track| track.is_enabled()));

    aaa.leave().await.unwrap();
    bbb.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn denied_devices_fail_before_joining() {
    let harness = Harness::new(8);
    let mut deps = harness.deps("aaa");
    deps.devices = Arc::new(SyntheticDevices::new("aaa").denying());
    let err = MeshSession::start(harness.config(), deps).await.err().unwrap();
    assert!(matches!(err, SessionError::MediaAcquisition(_)));
    assert!(err.is_fatal());
    assert!(harness.present().is_empty());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn full_room_rejects_the_extra_peer() {
    let harness = Harness::new(2);
    let aaa = harness.start("aaa").await;
    let bbb = harness.start("bbb").await;

    let err = MeshSession::start(harness.config(), harness.deps("ccc"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::RoomFull(_)));
    assert!(!err.is_fatal());
    assert_eq!(harness.present(), vec![peer("aaa"), peer("bbb")]);

    aaa.leave().await.unwrap();
    bbb.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn navigating_away_cancels_a_pending_permission_prompt() {
    let harness = Harness::new(8);
    let devices: Arc<dyn MediaDevices> =
        Arc::new(SyntheticDevices::new("aaa").with_grant_delay(Duration::from_secs(30)));
    let deps = SessionDeps {
        devices,
        ..harness.deps("aaa")
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = MeshSession::start_with_cancel(harness.config(), deps, &cancel)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::Cancelled));
    assert!(harness.present().is_empty());
}
