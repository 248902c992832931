// Time-series store boundary. The collector only writes points, runs queries and manages
// job definitions; the store executes the jobs itself.

pub mod csv;
mod influx;

pub use influx::InfluxStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{Job, JobSpec, Organization, Point, QueryRow};

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// One multi-point write.
    async fn write(&self, points: &[Point]) -> Result<(), StoreError>;

    async fn query(&self, query: &str) -> Result<Vec<QueryRow>, StoreError>;

    /// Jobs with exactly this name, or every job visible to the collector when `None`.
    async fn find_jobs(&self, name: Option<&str>) -> Result<Vec<Job>, StoreError>;

    async fn create_job(&self, org: &Organization, spec: &JobSpec) -> Result<Job, StoreError>;

    async fn delete_job(&self, id: &str) -> Result<(), StoreError>;

    async fn find_organizations(&self, name: &str) -> Result<Vec<Organization>, StoreError>;

    /// Deletes points in `[start, stop)` matching `predicate`.
    async fn delete_range(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &str,
    ) -> Result<(), StoreError>;

    async fn bucket_exists(&self) -> Result<bool, StoreError>;

    /// Bucket the collector writes to.
    fn bucket(&self) -> &str;
}
