// InfluxDB repository implementation
use crate::application::trace_repository::TraceRepository;
use crate::domain::alarm::{classify_alarm, AlarmEvent, AlarmSeverity};
use crate::domain::error::SourceError;
use crate::domain::region::RegionCollection;
use crate::domain::sample::{format_timestamp_ms, parse_timestamp_ms, Sample, TimeRange};
use crate::infrastructure::config::prepare_query;
use crate::infrastructure::json_repository::read_regions;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

const MS_TO_KMH: f64 = 3.6;

const POSITION_QUERY: &str = "SELECT \"Value.Latitude\", \"Value.Longitude\" \
    FROM \"${db}\".\"${rp}\".\"PositionGroup.GlobalPosition\" \
    WHERE \"Vehicle\" = '${vehicle}' AND ${time} ORDER BY time ASC";
const SPEED_QUERY: &str = "SELECT \"Value\" FROM \"${db}\".\"${rp}\".\"Velocity X\" \
    WHERE \"Vehicle\" = '${vehicle}' AND ${time} ORDER BY time ASC";
const OFFPATH_QUERY: &str = "SELECT \"Value\" FROM \"${db}\".\"${rp}\".\"Off Path Error\" \
    WHERE \"Vehicle\" = '${vehicle}' AND ${time} ORDER BY time ASC";
const PITCH_QUERY: &str = "SELECT \"Value\" FROM \"${db}\".\"${rp}\".\"Attitude Pitch\" \
    WHERE \"Vehicle\" = '${vehicle}' AND ${time} ORDER BY time ASC";
const ROLL_QUERY: &str = "SELECT \"Value\" FROM \"${db}\".\"${rp}\".\"Attitude Roll\" \
    WHERE \"Vehicle\" = '${vehicle}' AND ${time} ORDER BY time ASC";
const NOTIFICATION_QUERY: &str = "SELECT \"Title\", \"Vehicle\" \
    FROM \"${db}\".\"${rp}\".\"Notification State\" WHERE ${time}${vehicles} ORDER BY time ASC";
const VEHICLES_QUERY: &str = "SHOW TAG VALUES FROM \"PositionGroup.GlobalPosition\" \
    WITH KEY = \"Vehicle\" WHERE ${time}";

#[derive(Debug, Clone)]
pub struct InfluxRepository {
    host: String,
    token: Option<String>,
    database: String,
    retention_policy: String,
    alarm_types: Vec<String>,
    regions_file: PathBuf,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResponse {
    results: Vec<InfluxQLResult>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResult {
    #[serde(default)]
    series: Option<Vec<InfluxQLSeries>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLSeries {
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl InfluxQLSeries {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl InfluxQLResponse {
    fn series(&self) -> impl Iterator<Item = &InfluxQLSeries> {
        self.results
            .iter()
            .filter_map(|r| r.series.as_ref())
            .flatten()
    }

    /// `(time_ms, value)` pairs from the named numeric column
    fn numeric(&self, column: &str) -> Vec<(i64, f64)> {
        let mut points = Vec::new();
        for s in self.series() {
            let (Some(time_idx), Some(value_idx)) = (s.column("time"), s.column(column)) else {
                continue;
            };
            for row in &s.values {
                let time = row
                    .get(time_idx)
                    .and_then(|v| v.as_str())
                    .and_then(parse_timestamp_ms);
                let value = row.get(value_idx).and_then(|v| v.as_f64());
                if let (Some(time), Some(value)) = (time, value) {
                    points.push((time, value));
                }
            }
        }
        points
    }
}

/// InfluxQL time predicate; unbounded sources fall back to the last day.
fn time_clause(range: Option<TimeRange>) -> String {
    match range {
        Some(r) => format!(
            "time >= '{}' AND time <= '{}'",
            format_timestamp_ms(r.start_ms),
            format_timestamp_ms(r.end_ms)
        ),
        None => "time >= now() - 24h".to_string(),
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Attach the latest reading at or before each sample's time.
fn carry_forward(
    samples: &mut [Sample],
    readings: &[(i64, f64)],
    mut apply: impl FnMut(&mut Sample, f64),
) {
    let mut idx = 0;
    let mut latest = None;
    for sample in samples.iter_mut() {
        while idx < readings.len() && readings[idx].0 <= sample.timestamp_ms {
            latest = Some(readings[idx].1);
            idx += 1;
        }
        if let Some(value) = latest {
            apply(sample, value);
        }
    }
}

/// Per-measurement `(time_ms, value)` series joined onto positions.
#[derive(Debug, Default)]
struct Readings {
    speed: Vec<(i64, f64)>,
    offpath: Vec<(i64, f64)>,
    /// Radians
    pitch: Vec<(i64, f64)>,
    /// Radians
    roll: Vec<(i64, f64)>,
}

fn join_readings(
    vehicle_id: &str,
    positions: &InfluxQLResponse,
    readings: &Readings,
) -> Vec<Sample> {
    let lat = positions.numeric("Value.Latitude");
    let lon: HashMap<i64, f64> = positions.numeric("Value.Longitude").into_iter().collect();

    let mut samples: Vec<Sample> = lat
        .into_iter()
        .map(|(t, latitude)| {
            let longitude = lon.get(&t).copied().unwrap_or(f64::NAN);
            Sample::new(vehicle_id, t, latitude, longitude, 0.0)
        })
        .collect();
    samples.sort_by_key(|s| s.timestamp_ms);

    carry_forward(&mut samples, &readings.speed, |s, v| s.speed_kmh = v * MS_TO_KMH);
    carry_forward(&mut samples, &readings.offpath, |s, v| s.offpath_deviation_m = Some(v));
    carry_forward(&mut samples, &readings.pitch, |s, v| s.pitch_deg = Some(v.to_degrees()));
    carry_forward(&mut samples, &readings.roll, |s, v| s.roll_deg = Some(v.to_degrees()));
    samples
}

impl InfluxRepository {
    pub fn new(
        host: String,
        token: Option<String>,
        database: String,
        retention_policy: String,
        alarm_types: Vec<String>,
        regions_file: PathBuf,
    ) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            token,
            database,
            retention_policy,
            alarm_types,
            regions_file,
            client: reqwest::Client::new(),
        }
    }

    fn build_query_url(&self, query: &str) -> String {
        format!(
            "{}/query?db={}&rp={}&q={}",
            self.host,
            self.database,
            self.retention_policy,
            urlencoding::encode(query)
        )
    }

    fn render(&self, template: &str, vars: &[(&str, String)]) -> String {
        let mut all: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        all.insert("db".to_string(), self.database.clone());
        all.insert("rp".to_string(), self.retention_policy.clone());
        prepare_query(template, &all)
    }

    async fn execute_query(&self, query: &str) -> Result<InfluxQLResponse> {
        tracing::debug!("Executing InfluxQL: {}", query);
        let mut request = self
            .client
            .get(self.build_query_url(query))
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }

        let response = request.send().await.context("Failed to send request to InfluxDB")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Query(format!("status {}: {}", status, body)).into());
        }

        let data = response
            .json::<InfluxQLResponse>()
            .await
            .context("Failed to parse InfluxDB response")?;

        if let Some(error) = data.results.iter().find_map(|r| r.error.as_ref()) {
            return Err(SourceError::Query(error.clone()).into());
        }

        Ok(data)
    }

    async fn query_series(
        &self,
        template: &str,
        vehicle_id: &str,
        time: &str,
    ) -> Result<InfluxQLResponse> {
        let query = self.render(
            template,
            &[("vehicle", escape_literal(vehicle_id)), ("time", time.to_string())],
        );
        self.execute_query(&query).await
    }
}

#[async_trait]
impl TraceRepository for InfluxRepository {
    async fn list_vehicle_ids(&self, range: Option<TimeRange>) -> Result<Vec<String>> {
        let query = self.render(VEHICLES_QUERY, &[("time", time_clause(range))]);
        let response = self.execute_query(&query).await?;

        let mut vehicles: Vec<String> = response
            .series()
            .filter_map(|s| s.column("value").map(|idx| (s, idx)))
            .flat_map(|(s, idx)| {
                s.values
                    .iter()
                    .filter_map(move |row| row.get(idx)?.as_str().map(str::to_string))
            })
            .collect();
        vehicles.sort();
        vehicles.dedup();

        tracing::info!("Found {} vehicles with position data", vehicles.len());
        Ok(vehicles)
    }

    async fn load_samples(
        &self,
        vehicle_id: &str,
        range: Option<TimeRange>,
    ) -> Result<Vec<Sample>> {
        let time = time_clause(range);
        let (positions, speed, offpath, pitch, roll) = tokio::try_join!(
            self.query_series(POSITION_QUERY, vehicle_id, &time),
            self.query_series(SPEED_QUERY, vehicle_id, &time),
            self.query_series(OFFPATH_QUERY, vehicle_id, &time),
            self.query_series(PITCH_QUERY, vehicle_id, &time),
            self.query_series(ROLL_QUERY, vehicle_id, &time),
        )?;

        let readings = Readings {
            speed: speed.numeric("Value"),
            offpath: offpath.numeric("Value"),
            pitch: pitch.numeric("Value"),
            roll: roll.numeric("Value"),
        };
        let samples = join_readings(vehicle_id, &positions, &readings);
        tracing::debug!("Loaded {} position samples for {}", samples.len(), vehicle_id);
        Ok(samples)
    }

    async fn load_alarms(
        &self,
        vehicle_ids: &[String],
        range: Option<TimeRange>,
    ) -> Result<Vec<AlarmEvent>> {
        let vehicles = if vehicle_ids.is_empty() {
            String::new()
        } else {
            let conditions: Vec<String> = vehicle_ids
                .iter()
                .map(|v| format!("\"Vehicle\" = '{}'", escape_literal(v)))
                .collect();
            format!(" AND ({})", conditions.join(" OR "))
        };
        let query = self.render(
            NOTIFICATION_QUERY,
            &[("time", time_clause(range)), ("vehicles", vehicles)],
        );
        let response = self.execute_query(&query).await?;

        let mut alarms = Vec::new();
        let mut unclassified = 0;
        for s in response.series() {
            let (Some(time_idx), Some(title_idx), Some(vehicle_idx)) =
                (s.column("time"), s.column("Title"), s.column("Vehicle"))
            else {
                continue;
            };
            for row in &s.values {
                let time = row
                    .get(time_idx)
                    .and_then(|v| v.as_str())
                    .and_then(parse_timestamp_ms);
                let title = row.get(title_idx).and_then(|v| v.as_str()).unwrap_or_default();
                let vehicle = row.get(vehicle_idx).and_then(|v| v.as_str());
                let (Some(time), Some(vehicle)) = (time, vehicle) else {
                    continue;
                };
                match classify_alarm(title, &self.alarm_types) {
                    Some(alarm_type) => {
                        let mut event =
                            AlarmEvent::new(vehicle, time, AlarmSeverity::Warning, title);
                        event.alarm_type = Some(alarm_type);
                        alarms.push(event);
                    }
                    None => unclassified += 1,
                }
            }
        }

        tracing::debug!(
            "Classified {} alarms, ignored {} other notifications",
            alarms.len(),
            unclassified
        );
        Ok(alarms)
    }

    async fn load_regions(&self) -> Result<RegionCollection> {
        read_regions(&self.regions_file).await
    }
}
