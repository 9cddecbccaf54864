// Cluster Identity Binding
//
// Before any election, every member must agree on a single cluster id.
// A bootstrap-capable member mints and publishes one through the
// discovery layer; everyone else polls for it up to a deadline and
// persists what appears. A persisted id that disagrees with discovery
// fails startup fast, so two clusters can never fuse.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::time::{sleep, Instant};

use crate::common::{ClusterId, MemberId};
use crate::config::BindingConfig;
use crate::error::{RaftError, Result};
use crate::state::ClusterIdStore;

/// The slice of the discovery layer the consensus core depends on.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Offer a cluster id to the group. Returns false if another id
    /// was published first.
    async fn publish_cluster_id(&self, id: ClusterId) -> Result<bool>;

    /// The cluster id currently visible in discovery, if any.
    async fn observe_cluster_id(&self) -> Result<Option<ClusterId>>;

    /// The core members currently known to discovery.
    async fn core_members(&self) -> Result<HashSet<MemberId>>;

    /// Whether this member is designated to mint a fresh cluster id.
    fn is_bootstrap_capable(&self) -> bool;
}

/// One-time startup handshake stamping the shared cluster identity.
pub struct ClusterBinding<'a, D: Discovery + ?Sized> {
    store: &'a ClusterIdStore,
    discovery: &'a D,
    config: &'a BindingConfig,
}

impl<'a, D: Discovery + ?Sized> ClusterBinding<'a, D> {
    pub fn new(store: &'a ClusterIdStore, discovery: &'a D, config: &'a BindingConfig) -> Self {
        Self {
            store,
            discovery,
            config,
        }
    }

    /// Resolve the cluster id this member runs under, persisting it
    /// once known. Fails with `BindingMismatch` on a conflicting
    /// persisted id and `BindingTimeout` when discovery never yields
    /// one within the deadline.
    pub async fn bind(&self) -> Result<ClusterId> {
        if let Some(persisted) = self.store.load()? {
            if let Some(observed) = self.discovery.observe_cluster_id().await? {
                if observed != persisted {
                    return Err(RaftError::BindingMismatch {
                        persisted,
                        observed,
                    });
                }
            }
            let _ = self.discovery.publish_cluster_id(persisted).await?;
            tracing::info!(cluster_id = %persisted, "republished persisted cluster id");
            return Ok(persisted);
        }

        if self.discovery.is_bootstrap_capable() {
            if let Some(observed) = self.discovery.observe_cluster_id().await? {
                self.store.put(observed)?;
                return Ok(observed);
            }
            let fresh = ClusterId::random();
            if self.discovery.publish_cluster_id(fresh).await? {
                self.store.put(fresh)?;
                tracing::info!(cluster_id = %fresh, "bootstrapped fresh cluster id");
                return Ok(fresh);
            }
            // Lost the publication race; fall through and adopt the
            // winner like any other member.
        }

        let deadline = Instant::now() + self.config.deadline;
        loop {
            if let Some(observed) = self.discovery.observe_cluster_id().await? {
                self.store.put(observed)?;
                tracing::info!(cluster_id = %observed, "adopted cluster id from discovery");
                return Ok(observed);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::BindingTimeout(self.config.deadline));
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct StubDiscovery {
        published: Mutex<Option<ClusterId>>,
        bootstrap_capable: bool,
        accept_publication: bool,
    }

    impl StubDiscovery {
        fn empty(bootstrap_capable: bool) -> Self {
            Self {
                published: Mutex::new(None),
                bootstrap_capable,
                accept_publication: true,
            }
        }

        fn with_id(id: ClusterId) -> Self {
            Self {
                published: Mutex::new(Some(id)),
                bootstrap_capable: false,
                accept_publication: false,
            }
        }
    }

    #[async_trait]
    impl Discovery for StubDiscovery {
        async fn publish_cluster_id(&self, id: ClusterId) -> Result<bool> {
            if !self.accept_publication {
                return Ok(false);
            }
            let mut published = self.published.lock();
            match *published {
                Some(existing) => Ok(existing == id),
                None => {
                    *published = Some(id);
                    Ok(true)
                }
            }
        }

        async fn observe_cluster_id(&self) -> Result<Option<ClusterId>> {
            Ok(*self.published.lock())
        }

        async fn core_members(&self) -> Result<HashSet<MemberId>> {
            Ok(HashSet::new())
        }

        fn is_bootstrap_capable(&self) -> bool {
            self.bootstrap_capable
        }
    }

    fn quick_binding() -> BindingConfig {
        BindingConfig {
            deadline: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_member_mints_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterIdStore::new(dir.path());
        let discovery = StubDiscovery::empty(true);
        let config = quick_binding();

        let bound = ClusterBinding::new(&store, &discovery, &config)
            .bind()
            .await
            .unwrap();
        assert_eq!(store.load().unwrap(), Some(bound));
        assert_eq!(discovery.observe_cluster_id().await.unwrap(), Some(bound));
    }

    #[tokio::test]
    async fn test_non_bootstrap_member_adopts_published_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterIdStore::new(dir.path());
        let id = ClusterId::random();
        let discovery = StubDiscovery::with_id(id);
        let config = quick_binding();

        let bound = ClusterBinding::new(&store, &discovery, &config)
            .bind()
            .await
            .unwrap();
        assert_eq!(bound, id);
        assert_eq!(store.load().unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_binding_times_out_without_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterIdStore::new(dir.path());
        let discovery = StubDiscovery::empty(false);
        let config = quick_binding();

        let result = ClusterBinding::new(&store, &discovery, &config).bind().await;
        assert!(matches!(result, Err(RaftError::BindingTimeout(_))));
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_persisted_mismatch_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterIdStore::new(dir.path());
        let persisted = ClusterId::random();
        store.put(persisted).unwrap();

        let discovery = StubDiscovery::with_id(ClusterId::random());
        let config = quick_binding();

        let result = ClusterBinding::new(&store, &discovery, &config).bind().await;
        assert!(matches!(result, Err(RaftError::BindingMismatch { .. })));
    }

    #[tokio::test]
    async fn test_persisted_id_republished() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterIdStore::new(dir.path());
        let persisted = ClusterId::random();
        store.put(persisted).unwrap();

        let discovery = StubDiscovery::empty(false);
        let config = quick_binding();

        let bound = ClusterBinding::new(&store, &discovery, &config)
            .bind()
            .await
            .unwrap();
        assert_eq!(bound, persisted);
        assert_eq!(
            discovery.observe_cluster_id().await.unwrap(),
            Some(persisted)
        );
    }
}
