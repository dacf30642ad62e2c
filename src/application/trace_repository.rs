// Repository trait for vehicle trace, alarm and region data access
use crate::domain::alarm::AlarmEvent;
use crate::domain::region::RegionCollection;
use crate::domain::sample::{Sample, TimeRange};
use async_trait::async_trait;

#[async_trait]
pub trait TraceRepository: Send + Sync {
    /// List vehicles with position data in `range` (all available data when None)
    async fn list_vehicle_ids(&self, range: Option<TimeRange>) -> anyhow::Result<Vec<String>>;

    /// Raw samples for one vehicle, in source order. Cleaning happens in the store.
    async fn load_samples(
        &self,
        vehicle_id: &str,
        range: Option<TimeRange>,
    ) -> anyhow::Result<Vec<Sample>>;

    /// Alarm events, restricted to `vehicle_ids` when non-empty
    async fn load_alarms(
        &self,
        vehicle_ids: &[String],
        range: Option<TimeRange>,
    ) -> anyhow::Result<Vec<AlarmEvent>>;

    async fn load_regions(&self) -> anyhow::Result<RegionCollection>;
}
