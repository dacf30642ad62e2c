// Alarm clustering - groups alarms that are close in time and space
use crate::application::trace_store::TraceStore;
use crate::domain::alarm::{AlarmCluster, AlarmEvent};
use crate::domain::geometry::{euclidean_deg, GeoPoint};
use crate::domain::sample::TimeRange;

/// Where an alarm sits on the map: its vehicle's nearest trace sample, or
/// the alarm's own location when the vehicle has no trace.
fn anchor_for(alarm: &AlarmEvent, store: &TraceStore) -> Option<GeoPoint> {
    store
        .nearest_sample(&alarm.vehicle_id, alarm.timestamp_ms)
        .map(|s| GeoPoint::new(s.latitude, s.longitude))
        .or(alarm.location)
}

/// Group alarms into clusters sharing a time bucket whose anchors lie within
/// `distance_threshold_deg` of the cluster centroid. Alarms join the first
/// matching cluster in creation order, so the result depends only on input order.
pub fn group_nearby(
    alarms: &[AlarmEvent],
    store: &TraceStore,
    time_window_ms: i64,
    distance_threshold_deg: f64,
) -> Vec<AlarmCluster> {
    let window = time_window_ms.max(1);
    let mut clusters: Vec<AlarmCluster> = Vec::new();
    let mut skipped = 0usize;

    for alarm in alarms {
        let Some(anchor) = anchor_for(alarm, store) else {
            skipped += 1;
            continue;
        };
        let bucket = alarm.timestamp_ms.div_euclid(window);

        let nearby = clusters.iter_mut().find(|c| {
            c.bucket == bucket && euclidean_deg(c.centroid, anchor) <= distance_threshold_deg
        });
        match nearby {
            Some(cluster) => cluster.add(anchor, alarm.clone()),
            None => clusters.push(AlarmCluster::new(bucket, anchor, alarm.clone())),
        }
    }

    if skipped > 0 {
        tracing::debug!("Skipped {} alarms with no trace or location", skipped);
    }
    clusters
}

/// Cluster only the alarms inside `window`. Clusters are rebuilt from scratch
/// for every window.
pub fn cluster_in_window(
    alarms: &[AlarmEvent],
    store: &TraceStore,
    window: &TimeRange,
    time_window_ms: i64,
    distance_threshold_deg: f64,
) -> Vec<AlarmCluster> {
    let in_window: Vec<AlarmEvent> = alarms
        .iter()
        .filter(|a| window.contains(a.timestamp_ms))
        .cloned()
        .collect();
    group_nearby(&in_window, store, time_window_ms, distance_threshold_deg)
}
