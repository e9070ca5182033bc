//! Tenant (project) scoping
//!
//! Every coordinator operation runs on behalf of one project. The project is
//! carried in task-local storage for the duration of a future, so repository
//! code can read it without threading it through every call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use uuid::Uuid;

/// Tenant identifier for multi-tenant isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ProjectId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

tokio::task_local! {
    static CURRENT_PROJECT: ProjectId;
}

/// Run `fut` with `project` as the active tenant scope
pub async fn scope<F>(project: ProjectId, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_PROJECT.scope(project, fut).await
}

/// The active tenant scope, if any
pub fn current() -> Option<ProjectId> {
    CURRENT_PROJECT.try_with(|project| *project).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_sets_current_project() {
        let project = ProjectId::new(Uuid::new_v4());
        let seen = scope(project, async { current() }).await;
        assert_eq!(seen, Some(project));
    }

    #[tokio::test]
    async fn test_no_scope_outside_future() {
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn test_nested_scope_overrides() {
        let outer = ProjectId::new(Uuid::new_v4());
        let inner = ProjectId::new(Uuid::new_v4());
        let (seen_inner, seen_outer) = scope(outer, async move {
            let seen_inner = scope(inner, async { current() }).await;
            (seen_inner, current())
        })
        .await;
        assert_eq!(seen_inner, Some(inner));
        assert_eq!(seen_outer, Some(outer));
    }
}
