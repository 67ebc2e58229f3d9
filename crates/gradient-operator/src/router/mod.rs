//! Traffic routing seams
//!
//! The mesh router owns the weighted route pair between primary and canary;
//! the Kubernetes router provisions the ClusterIP services both of them
//! front. The engine treats the pair read from the mesh as the source of
//! truth on every tick, so out-of-band edits are tolerated.

mod http_route;
mod kubernetes;

pub use http_route::HttpRouteRouter;
pub use kubernetes::ClusterIpRouter;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use gradient_common::crd::Canary;
use gradient_common::Result;

/// Weighted route read/write against the service mesh.
///
/// `set_routes` must be idempotent; the engine re-applies pairs freely. Every
/// engine-initiated pair sums to 100.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshRouter: Send + Sync {
    /// Ensure the mesh-side route object exists for this canary
    async fn sync(&self, canary: &Canary) -> Result<()>;

    /// Read the current `(primary_weight, canary_weight)` pair
    async fn get_routes(&self, canary: &Canary) -> Result<(i32, i32)>;

    /// Apply a `(primary_weight, canary_weight)` pair
    async fn set_routes(&self, canary: &Canary, primary_weight: i32, canary_weight: i32)
        -> Result<()>;
}

/// Kubernetes-side service provisioning for a canary target
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesRouter: Send + Sync {
    /// Ensure the ClusterIP services fronting the workloads exist
    async fn sync(&self, canary: &Canary) -> Result<()>;
}
