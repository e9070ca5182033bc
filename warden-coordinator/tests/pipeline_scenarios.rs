mod common;

use chrono::Duration;
use common::Fixture;
use uuid::Uuid;
use warden_coordinator::CoordinationError;
use warden_core::domain::lease::{ClaimOutcome, OwnerId};
use warden_core::domain::node::NodeStatus;
use warden_core::domain::pipeline::{PipelineKind, PipelineStatus};
use warden_core::dto::pipeline::CreatePipeline;
use warden_core::tenant::{self, ProjectId};

#[tokio::test]
async fn test_happy_path_runs_every_step_in_order() {
    let fixture = Fixture::new(PipelineKind::OntologyWorkflow);
    let (pipeline, nodes) = fixture.create_pipeline().await;
    assert_eq!(nodes.len(), 4);

    let grant = fixture.claim(pipeline.id, "worker-a").await;
    let pipelines = fixture.coordinator.pipelines();
    let tracker = fixture.coordinator.nodes();

    fixture
        .scoped(pipelines.update_status(&grant, pipeline.id, PipelineStatus::Running, None))
        .await
        .unwrap();

    while let Some(node) = fixture
        .scoped(tracker.get_next_pending_node(pipeline.id))
        .await
        .unwrap()
    {
        fixture
            .scoped(pipelines.update_status(
                &grant,
                pipeline.id,
                PipelineStatus::Running,
                Some(node.step_name.clone()),
            ))
            .await
            .unwrap();
        fixture
            .scoped(tracker.update_status(&grant, node.id, NodeStatus::Running, None))
            .await
            .unwrap();
        fixture.clock.advance(Duration::seconds(1));
        fixture
            .scoped(tracker.update_status(&grant, node.id, NodeStatus::Completed, None))
            .await
            .unwrap();
    }

    let done = fixture
        .scoped(pipelines.update_status(&grant, pipeline.id, PipelineStatus::Completed, None))
        .await
        .unwrap();
    fixture
        .scoped(fixture.coordinator.leases().release(pipeline.id))
        .await
        .unwrap();

    assert_eq!(done.status, PipelineStatus::Completed);
    assert_eq!(done.current_step.as_deref(), Some("ontology_finalize"));
    assert!(done.completed_at.is_some());

    let summary = fixture
        .scoped(pipelines.summary(pipeline.id))
        .await
        .unwrap();
    assert_eq!(summary.completed_nodes, 4);
    assert_eq!(summary.total_nodes, 4);
    assert!(summary.owner_id.is_none());
}

#[tokio::test]
async fn test_contested_claim_leaves_single_driver() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let winner = fixture.claim(pipeline.id, "worker-a").await;

    let loser = OwnerId::from("worker-b");
    let outcome = fixture
        .scoped(fixture.coordinator.leases().claim(pipeline.id, &loser))
        .await
        .unwrap();
    assert!(matches!(outcome, ClaimOutcome::Denied { .. }));

    fixture
        .scoped(fixture.coordinator.leases().heartbeat(pipeline.id, &winner.owner_id))
        .await
        .unwrap();
    let err = fixture
        .scoped(fixture.coordinator.leases().heartbeat(pipeline.id, &loser))
        .await
        .unwrap_err();
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn test_release_hands_ownership_to_next_claimer() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let leases = fixture.coordinator.leases();
    let a = OwnerId::from("worker-a");
    let b = OwnerId::from("worker-b");

    let first = fixture.claim(pipeline.id, a.as_str()).await;
    fixture.scoped(leases.release(pipeline.id)).await.unwrap();

    fixture.clock.advance(Duration::seconds(1));
    let second = fixture.claim(pipeline.id, b.as_str()).await;
    assert!(second.fence_token > first.fence_token);

    fixture.clock.advance(Duration::seconds(1));
    let renewed = fixture
        .scoped(leases.heartbeat(pipeline.id, &b))
        .await
        .unwrap();
    assert!(renewed > second.heartbeat_at);

    let err = fixture
        .scoped(leases.heartbeat(pipeline.id, &a))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::OwnershipMismatch { .. }));
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn test_lost_ownership_stops_pipeline_writes() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let first = fixture.claim(pipeline.id, "worker-a").await;
    let pipelines = fixture.coordinator.pipelines();

    fixture
        .scoped(pipelines.update_status(&first, pipeline.id, PipelineStatus::Running, None))
        .await
        .unwrap();

    fixture.clock.advance(Duration::minutes(10));
    let takeover = fixture
        .scoped(fixture.coordinator.leases().reclaim_stale(
            pipeline.id,
            &OwnerId::from("worker-b"),
            Duration::minutes(5),
        ))
        .await
        .unwrap()
        .into_grant()
        .unwrap();

    let err = fixture
        .scoped(fixture.coordinator.leases().heartbeat(pipeline.id, &first.owner_id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::OwnershipMismatch { .. }));

    let err = fixture
        .scoped(pipelines.update_status(&first, pipeline.id, PipelineStatus::Failed, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::LeaseFenced { .. }));

    let stored = fixture
        .scoped(pipelines.update_status(&takeover, pipeline.id, PipelineStatus::Completed, None))
        .await
        .unwrap();
    assert_eq!(stored.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_pipeline_transitions_are_enforced() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let grant = fixture.claim(pipeline.id, "worker-a").await;
    let pipelines = fixture.coordinator.pipelines();

    let err = fixture
        .scoped(pipelines.update_status(&grant, pipeline.id, PipelineStatus::Completed, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidTransition { .. }));

    let err = fixture
        .scoped(pipelines.update_status(
            &grant,
            pipeline.id,
            PipelineStatus::Running,
            Some("no_such_step".into()),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));

    let failed = fixture
        .scoped(pipelines.update_status(&grant, pipeline.id, PipelineStatus::Failed, None))
        .await
        .unwrap();
    assert!(failed.completed_at.is_some());
    assert!(failed.started_at.is_none());
}

#[tokio::test]
async fn test_one_active_pipeline_per_resource() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, _) = fixture.create_pipeline().await;
    let pipelines = fixture.coordinator.pipelines();
    let again = CreatePipeline {
        kind: PipelineKind::SchemaDiscovery,
        resource_id: pipeline.resource_id,
        fingerprint: None,
    };

    let err = fixture
        .scoped(pipelines.create(again.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::ActivePipelineExists { pipeline_id, .. } if pipeline_id == pipeline.id
    ));

    let grant = fixture.claim(pipeline.id, "worker-a").await;
    fixture
        .scoped(pipelines.update_status(&grant, pipeline.id, PipelineStatus::Failed, None))
        .await
        .unwrap();

    let (rerun, _) = fixture.scoped(pipelines.create(again)).await.unwrap();
    let active = fixture
        .scoped(pipelines.get_active_by_resource(pipeline.resource_id))
        .await
        .unwrap();
    assert_eq!(active.map(|p| p.id), Some(rerun.id));
}

#[tokio::test]
async fn test_create_rejects_other_kind() {
    let fixture = Fixture::schema_discovery();
    let err = fixture
        .scoped(fixture.coordinator.pipelines().create(CreatePipeline {
            kind: PipelineKind::OntologyWorkflow,
            resource_id: Uuid::new_v4(),
            fingerprint: None,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));
}

#[tokio::test]
async fn test_latest_and_needs_extraction() {
    let fixture = Fixture::schema_discovery();
    let (first, _) = fixture.create_pipeline().await;
    let resource_id = first.resource_id;
    let pipelines = fixture.coordinator.pipelines();

    assert!(
        !fixture
            .scoped(pipelines.needs_extraction(resource_id, "fp-1"))
            .await
            .unwrap(),
        "an active run suppresses a new extraction"
    );

    let grant = fixture.claim(first.id, "worker-a").await;
    fixture
        .scoped(pipelines.update_status(&grant, first.id, PipelineStatus::Running, None))
        .await
        .unwrap();
    fixture
        .scoped(pipelines.update_status(&grant, first.id, PipelineStatus::Completed, None))
        .await
        .unwrap();

    assert!(
        !fixture
            .scoped(pipelines.needs_extraction(resource_id, "fp-1"))
            .await
            .unwrap()
    );
    assert!(
        fixture
            .scoped(pipelines.needs_extraction(resource_id, "fp-2"))
            .await
            .unwrap()
    );
    assert!(
        fixture
            .scoped(pipelines.needs_extraction(Uuid::new_v4(), "fp-1"))
            .await
            .unwrap()
    );

    fixture.clock.advance(Duration::seconds(1));
    let (second, _) = fixture
        .scoped(pipelines.create(CreatePipeline {
            kind: PipelineKind::SchemaDiscovery,
            resource_id,
            fingerprint: Some("fp-2".into()),
        }))
        .await
        .unwrap();
    let latest = fixture
        .scoped(pipelines.get_latest_by_resource(resource_id))
        .await
        .unwrap();
    assert_eq!(latest.map(|p| p.id), Some(second.id));
}

#[tokio::test]
async fn test_list_claimable_respects_ownership_and_staleness() {
    let fixture = Fixture::schema_discovery();
    let (owned, _) = fixture.create_pipeline().await;
    fixture.clock.advance(Duration::seconds(1));
    let (free, _) = fixture.create_pipeline().await;
    fixture.claim(owned.id, "worker-a").await;
    let pipelines = fixture.coordinator.pipelines();

    let claimable = fixture
        .scoped(pipelines.list_claimable(None, 10))
        .await
        .unwrap();
    assert_eq!(claimable.iter().map(|p| p.id).collect::<Vec<_>>(), vec![free.id]);

    fixture.clock.advance(Duration::minutes(3));
    let claimable = fixture
        .scoped(pipelines.list_claimable(Some(Duration::minutes(2)), 10))
        .await
        .unwrap();
    assert_eq!(
        claimable.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![owned.id, free.id]
    );

    let limited = fixture
        .scoped(pipelines.list_claimable(Some(Duration::minutes(2)), 1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, nodes) = fixture.create_pipeline().await;
    let other = ProjectId::new(Uuid::new_v4());
    let coordinator = &fixture.coordinator;

    let err = tenant::scope(other, coordinator.pipelines().get(pipeline.id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::PipelineNotFound(_)));

    let err = tenant::scope(other, coordinator.nodes().get(nodes[0].id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::NodeNotFound(_)));

    let err = tenant::scope(
        other,
        coordinator.leases().claim(pipeline.id, &OwnerId::from("intruder")),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoordinationError::PipelineNotFound(_)));

    let deleted = tenant::scope(other, coordinator.pipelines().delete_by_resource(pipeline.resource_id))
        .await
        .unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn test_delete_by_resource_removes_pipelines_and_nodes() {
    let fixture = Fixture::schema_discovery();
    let (pipeline, nodes) = fixture.create_pipeline().await;
    let pipelines = fixture.coordinator.pipelines();

    let deleted = fixture
        .scoped(pipelines.delete_by_resource(pipeline.resource_id))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    assert!(matches!(
        fixture.scoped(pipelines.get(pipeline.id)).await,
        Err(CoordinationError::PipelineNotFound(_))
    ));
    assert!(matches!(
        fixture.scoped(fixture.coordinator.nodes().get(nodes[0].id)).await,
        Err(CoordinationError::NodeNotFound(_))
    ));
}
