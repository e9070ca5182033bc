//! Shared fixtures for coordinator integration tests

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;
use warden_coordinator::{Coordinator, InMemoryPipelineRepository};
use warden_core::clock::ManualClock;
use warden_core::domain::lease::{LeaseGrant, OwnerId};
use warden_core::domain::node::Node;
use warden_core::domain::pipeline::{Pipeline, PipelineKind};
use warden_core::dto::pipeline::CreatePipeline;
use warden_core::tenant::{self, ProjectId};

pub struct Fixture {
    pub coordinator: Coordinator,
    pub clock: ManualClock,
    pub project: ProjectId,
}

impl Fixture {
    pub fn new(kind: PipelineKind) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let repository = Arc::new(InMemoryPipelineRepository::new(kind));
        Self {
            coordinator: Coordinator::with_clock(repository, Arc::new(clock.clone())),
            clock,
            project: ProjectId::new(Uuid::new_v4()),
        }
    }

    pub fn schema_discovery() -> Self {
        Self::new(PipelineKind::SchemaDiscovery)
    }

    /// Run `fut` inside this fixture's project scope
    pub async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        tenant::scope(self.project, fut).await
    }

    pub async fn create_pipeline(&self) -> (Pipeline, Vec<Node>) {
        self.scoped(self.coordinator.pipelines().create(CreatePipeline {
            kind: self.coordinator.kind(),
            resource_id: Uuid::new_v4(),
            fingerprint: Some("fp-1".into()),
        }))
        .await
        .unwrap()
    }

    pub async fn claim(&self, pipeline_id: Uuid, owner: &str) -> LeaseGrant {
        self.scoped(self.coordinator.leases().claim(pipeline_id, &OwnerId::from(owner)))
            .await
            .unwrap()
            .into_grant()
            .expect("claim should succeed")
    }
}
