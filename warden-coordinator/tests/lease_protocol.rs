mod common;

use chrono::Duration;
use common::Fixture;
use std::sync::Arc;
use tokio::sync::Barrier;
use uuid::Uuid;
use warden_coordinator::CoordinationError;
use warden_core::clock::Clock;
use warden_core::domain::lease::{ClaimOutcome, FenceToken, OwnerId};
use warden_core::tenant;

#[tokio::test]
async fn test_concurrent_claims_have_exactly_one_winner() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;

    let pipeline_id = pipeline.id;
    let contenders = 16;
    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for i in 0..contenders {
        let coordinator = fixture.coordinator.clone();
        let barrier = barrier.clone();
        let project = fixture.project;
        handles.push(tokio::spawn(async move {
            let owner = OwnerId::new(format!("worker-{}", i));
            barrier.wait().await;
            tenant::scope(project, coordinator.leases().claim(pipeline_id, &owner))
                .await
                .unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let ClaimOutcome::Claimed(grant) = handle.await.unwrap() {
            winners.push(grant);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one claim must win");

    let stored = fixture
        .scoped(fixture.coordinator.pipelines().get(pipeline.id))
        .await
        .unwrap();
    assert_eq!(stored.owner(), Some(&winners[0].owner_id));
    assert_eq!(stored.fence_token, FenceToken(1));
}

#[tokio::test]
async fn test_claim_is_idempotent_for_current_owner() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;

    let first = fixture.claim(pipeline.id, "worker-a").await;
    fixture.clock.advance(Duration::seconds(3));
    let second = fixture.claim(pipeline.id, "worker-a").await;

    assert_eq!(first.owner_id, second.owner_id);
    assert_eq!(first.fence_token, second.fence_token);
    assert!(second.heartbeat_at > first.heartbeat_at);
}

#[tokio::test]
async fn test_claim_denied_reports_current_owner() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    fixture.claim(pipeline.id, "worker-a").await;

    let outcome = fixture
        .scoped(fixture.coordinator.leases().claim(pipeline.id, &OwnerId::from("worker-b")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ClaimOutcome::Denied {
            current_owner: Some(OwnerId::from("worker-a"))
        }
    );
}

#[tokio::test]
async fn test_claim_unknown_pipeline_is_an_error() {
    let fixture = Fixture::schema_discovery();
    let missing = Uuid::new_v4();
    let err = fixture
        .scoped(fixture.coordinator.leases().claim(missing, &OwnerId::from("worker-a")))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::PipelineNotFound(id) if id == missing));
}

#[tokio::test]
async fn test_heartbeat_requires_ownership() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    fixture.claim(pipeline.id, "worker-a").await;

    let err = fixture
        .scoped(fixture.coordinator.leases().heartbeat(pipeline.id, &OwnerId::from("worker-b")))
        .await
        .unwrap_err();
    match err {
        CoordinationError::OwnershipMismatch { current_owner, .. } => {
            assert_eq!(current_owner, Some(OwnerId::from("worker-a")));
        }
        other => panic!("expected OwnershipMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_strictly_advances_even_without_clock_movement() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let grant = fixture.claim(pipeline.id, "worker-a").await;
    let leases = fixture.coordinator.leases();

    let first = fixture
        .scoped(leases.heartbeat(pipeline.id, &grant.owner_id))
        .await
        .unwrap();
    let second = fixture
        .scoped(leases.heartbeat(pipeline.id, &grant.owner_id))
        .await
        .unwrap();
    assert!(first > grant.heartbeat_at);
    assert!(second > first);

    fixture.clock.advance(Duration::seconds(30));
    let third = fixture
        .scoped(leases.heartbeat(pipeline.id, &grant.owner_id))
        .await
        .unwrap();
    assert_eq!(third, fixture.clock.now());
}

#[tokio::test]
async fn test_release_clears_ownership_and_keeps_fence() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let grant = fixture.claim(pipeline.id, "worker-a").await;

    fixture
        .scoped(fixture.coordinator.leases().release(pipeline.id))
        .await
        .unwrap();
    let stored = fixture
        .scoped(fixture.coordinator.pipelines().get(pipeline.id))
        .await
        .unwrap();
    assert!(stored.lease.is_none());
    assert_eq!(stored.fence_token, grant.fence_token);

    let next = fixture.claim(pipeline.id, "worker-b").await;
    assert_eq!(next.fence_token, grant.fence_token.next());
}

#[tokio::test]
async fn test_release_of_unknown_pipeline_fails() {
    let fixture = Fixture::schema_discovery();
    let err = fixture
        .scoped(fixture.coordinator.leases().release(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::PipelineNotFound(_)));
}

#[tokio::test]
async fn test_reclaim_stale_only_takes_silent_leases() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let original = fixture.claim(pipeline.id, "worker-a").await;
    let rescuer = OwnerId::from("worker-b");
    let leases = fixture.coordinator.leases();

    fixture.clock.advance(Duration::seconds(30));
    let early = fixture
        .scoped(leases.reclaim_stale(pipeline.id, &rescuer, Duration::minutes(2)))
        .await
        .unwrap();
    assert!(!early.is_claimed());

    fixture.clock.advance(Duration::minutes(5));
    let late = fixture
        .scoped(leases.reclaim_stale(pipeline.id, &rescuer, Duration::minutes(2)))
        .await
        .unwrap();
    let grant = late.into_grant().expect("stale lease should be taken over");
    assert_eq!(grant.owner_id, rescuer);
    assert!(grant.fence_token > original.fence_token);

    let err = fixture
        .scoped(leases.verify(&original))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::LeaseFenced { .. }));
}

#[tokio::test]
async fn test_reclaim_stale_rejects_non_positive_timeout() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let err = fixture
        .scoped(fixture.coordinator.leases().reclaim_stale(
            pipeline.id,
            &OwnerId::from("worker-a"),
            Duration::zero(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));
}

#[tokio::test]
async fn test_out_of_range_stale_timeout_is_rejected() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let ages = Duration::days(365 * 300_000);

    let err = fixture
        .scoped(fixture.coordinator.leases().reclaim_stale(
            pipeline.id,
            &OwnerId::from("worker-a"),
            ages,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));

    let err = fixture
        .scoped(fixture.coordinator.pipelines().list_claimable(Some(ages), 10))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));

    // Nothing was claimed by the rejected call
    let claimable = fixture
        .scoped(fixture.coordinator.pipelines().list_claimable(None, 10))
        .await
        .unwrap();
    assert_eq!(claimable.len(), 1);
}

#[tokio::test]
async fn test_operations_outside_scope_fail() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let err = fixture
        .coordinator
        .leases()
        .claim(pipeline.id, &OwnerId::from("worker-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::MissingTenantScope));
}
