// Alarm type registry - runtime-editable list of alarm types used for classification
use crate::domain::error::AlarmTypeError;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmTypeListing {
    pub alarm_types: Vec<String>,
    pub default_alarm_types: Vec<String>,
    pub is_using_defaults: bool,
    pub total_count: usize,
}

/// Shared alarm type list. Starts from the configured defaults; every
/// change is visible to the next classification request.
#[derive(Debug, Clone)]
pub struct AlarmTypeRegistry {
    defaults: Arc<Vec<String>>,
    current: Arc<RwLock<Vec<String>>>,
}

fn normalize(alarm_type: &str) -> Option<String> {
    let trimmed = alarm_type.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn same_type(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl AlarmTypeRegistry {
    pub fn new(defaults: Vec<String>) -> Self {
        let defaults: Vec<String> = defaults.iter().filter_map(|t| normalize(t)).collect();
        Self {
            current: Arc::new(RwLock::new(defaults.clone())),
            defaults: Arc::new(defaults),
        }
    }

    pub fn defaults(&self) -> Vec<String> {
        self.defaults.to_vec()
    }

    pub async fn current(&self) -> Vec<String> {
        self.current.read().await.clone()
    }

    pub async fn listing(&self) -> AlarmTypeListing {
        let alarm_types = self.current().await;
        AlarmTypeListing {
            is_using_defaults: alarm_types == *self.defaults,
            total_count: alarm_types.len(),
            default_alarm_types: self.defaults(),
            alarm_types,
        }
    }

    /// Replace the whole list. Blank entries and case-insensitive repeats
    /// are dropped; a list with nothing left is rejected.
    pub async fn replace(&self, alarm_types: &[String]) -> Result<Vec<String>, AlarmTypeError> {
        let mut cleaned: Vec<String> = Vec::with_capacity(alarm_types.len());
        for alarm_type in alarm_types.iter().filter_map(|t| normalize(t)) {
            if !cleaned.iter().any(|t| same_type(t, &alarm_type)) {
                cleaned.push(alarm_type);
            }
        }
        if cleaned.is_empty() {
            return Err(AlarmTypeError::Empty);
        }
        tracing::info!("Alarm types replaced: {:?}", cleaned);
        *self.current.write().await = cleaned.clone();
        Ok(cleaned)
    }

    pub async fn add(&self, alarm_type: &str) -> Result<Vec<String>, AlarmTypeError> {
        let alarm_type = normalize(alarm_type).ok_or(AlarmTypeError::Empty)?;
        let mut current = self.current.write().await;
        if current.iter().any(|t| same_type(t, &alarm_type)) {
            return Err(AlarmTypeError::Duplicate(alarm_type));
        }
        tracing::info!("Alarm type added: {}", alarm_type);
        current.push(alarm_type);
        Ok(current.clone())
    }

    pub async fn remove(&self, alarm_type: &str) -> Result<Vec<String>, AlarmTypeError> {
        let mut current = self.current.write().await;
        let Some(position) = current.iter().position(|t| same_type(t, alarm_type.trim())) else {
            return Err(AlarmTypeError::NotFound(alarm_type.to_string()));
        };
        let removed = current.remove(position);
        tracing::info!("Alarm type removed: {}", removed);
        Ok(current.clone())
    }

    pub async fn reset(&self) -> Vec<String> {
        let mut current = self.current.write().await;
        *current = self.defaults.to_vec();
        tracing::info!("Alarm types reset to {} defaults", current.len());
        current.clone()
    }
}
