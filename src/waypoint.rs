//! Waypoint store (spec §3, §4.5 step 5): an operator-maintained
//! `host:port -> host:port` override map, consulted before dialing
//! upstream and refreshed from the external store on explicit resync.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::OpaqueError;
use crate::persistence::WaypointRepository;

/// A shared, lockable waypoint map (spec §5: "an in-memory map refreshed
/// under lock on explicit `sync_waypoints`"). Cheap to clone.
#[derive(Clone, Default)]
pub struct Waypoints(Arc<RwLock<HashMap<String, String>>>);

impl Waypoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The override for `host_port`, if any (spec §4.5 step 5).
    #[must_use]
    pub fn resolve(&self, host_port: &str) -> Option<String> {
        self.0.read().get(host_port).cloned()
    }

    /// Replace the in-memory map with every mapping the repository has,
    /// returning how many were loaded (SPEC_FULL §11: diagnostics for
    /// drift between the store and the in-memory map, instead of a
    /// silent mutation).
    pub async fn sync(&self, repo: &impl WaypointRepository) -> Result<usize, OpaqueError> {
        let mappings = repo.load_all().await?;
        let count = mappings.len();

        let mut guard = self.0.write();
        guard.clear();
        guard.extend(mappings);

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRepo(Vec<(String, String)>);

    impl WaypointRepository for FakeRepo {
        async fn load_all(&self) -> Result<Vec<(String, String)>, OpaqueError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn sync_replaces_the_map_and_reports_count() {
        let waypoints = Waypoints::new();
        let repo = FakeRepo(vec![("echo.test:80".into(), "127.0.0.1:9000".into())]);

        let loaded = waypoints.sync(&repo).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(
            waypoints.resolve("echo.test:80"),
            Some("127.0.0.1:9000".to_owned())
        );
        assert_eq!(waypoints.resolve("other.test:80"), None);
    }

    #[tokio::test]
    async fn sync_drops_mappings_no_longer_present_upstream() {
        let waypoints = Waypoints::new();
        waypoints
            .sync(&FakeRepo(vec![("a.test:80".into(), "b.test:80".into())]))
            .await
            .unwrap();

        waypoints.sync(&FakeRepo(vec![])).await.unwrap();
        assert_eq!(waypoints.resolve("a.test:80"), None);
    }
}
