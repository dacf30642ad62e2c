// JSON file repository implementation
use crate::application::trace_repository::TraceRepository;
use crate::domain::alarm::{AlarmEvent, AlarmRecord};
use crate::domain::error::SourceError;
use crate::domain::region::RegionCollection;
use crate::domain::sample::{Sample, SampleRecord, TimeRange};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Reads `<data_dir>/traces/<vehicle>.json`, `<data_dir>/alarms.json` and a GeoJSON region file.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    data_dir: PathBuf,
    regions_file: PathBuf,
}

impl JsonFileRepository {
    pub fn new(data_dir: impl Into<PathBuf>, regions_file: Option<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let regions_file = regions_file.unwrap_or_else(|| data_dir.join("regions.geojson"));
        Self { data_dir, regions_file }
    }

    fn traces_dir(&self) -> PathBuf {
        self.data_dir.join("traces")
    }
}

async fn read_document(path: &Path) -> Result<Value, SourceError> {
    let display = path.display().to_string();
    let raw = tokio::fs::read(path).await.map_err(|source| SourceError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| SourceError::Parse { path: display, source })
}

/// Decode a top-level JSON array one record at a time; records that do not
/// decode are logged and skipped.
fn decode_records<T: DeserializeOwned>(
    document: Value,
    origin: &Path,
) -> Result<Vec<T>, SourceError> {
    let Value::Array(items) = document else {
        return Err(SourceError::Format {
            path: origin.display().to_string(),
            reason: "expected a JSON array of records".to_string(),
        });
    };
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value(item) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping record {} in {}: {}", index, origin.display(), e),
        }
    }
    Ok(records)
}

/// Load a GeoJSON feature collection from disk.
pub async fn read_regions(path: &Path) -> Result<RegionCollection> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::warn!("Region file {} not found; no regions loaded", path.display());
        return Ok(RegionCollection::default());
    }
    let document = read_document(path).await?;
    Ok(RegionCollection::from_document(document, &path.display().to_string())?)
}

fn in_range(range: &Option<TimeRange>, timestamp_ms: i64) -> bool {
    range.as_ref().is_none_or(|r| r.contains(timestamp_ms))
}

#[async_trait]
impl TraceRepository for JsonFileRepository {
    async fn list_vehicle_ids(&self, _range: Option<TimeRange>) -> Result<Vec<String>> {
        let dir = self.traces_dir();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|source| SourceError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        tracing::debug!("Found {} trace files in {}", ids.len(), dir.display());
        Ok(ids)
    }

    async fn load_samples(
        &self,
        vehicle_id: &str,
        range: Option<TimeRange>,
    ) -> Result<Vec<Sample>> {
        let path = self.traces_dir().join(format!("{}.json", vehicle_id));
        let records: Vec<SampleRecord> = decode_records(read_document(&path).await?, &path)?;

        let mut samples = Vec::with_capacity(records.len());
        for record in records {
            match record.into_sample(vehicle_id) {
                Ok(sample) if in_range(&range, sample.timestamp_ms) => samples.push(sample),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping sample for {}: {}", vehicle_id, e),
            }
        }
        Ok(samples)
    }

    async fn load_alarms(
        &self,
        vehicle_ids: &[String],
        range: Option<TimeRange>,
    ) -> Result<Vec<AlarmEvent>> {
        let path = self.data_dir.join("alarms.json");
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!("No alarm file at {}", path.display());
            return Ok(Vec::new());
        }
        let records: Vec<AlarmRecord> = decode_records(read_document(&path).await?, &path)?;

        let total = records.len();
        let mut alarms = Vec::with_capacity(total);
        for record in records {
            let vehicle_id = record.vehicle_id.clone();
            match record.into_event() {
                Ok(alarm) => alarms.push(alarm),
                Err(e) => tracing::warn!("Skipping alarm for {}: {}", vehicle_id, e),
            }
        }
        alarms.retain(|a| vehicle_ids.is_empty() || vehicle_ids.contains(&a.vehicle_id));
        alarms.retain(|a| in_range(&range, a.timestamp_ms));
        tracing::debug!("Loaded {} of {} alarm records", alarms.len(), total);
        Ok(alarms)
    }

    async fn load_regions(&self) -> Result<RegionCollection> {
        read_regions(&self.regions_file).await
    }
}
