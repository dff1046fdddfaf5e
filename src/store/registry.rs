use super::ReadingStore;
use crate::error::RelationalError;
use std::collections::HashMap;

/// Sensor name -> identifier, read once per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorRegistry {
    sensors: HashMap<String, i32>,
}

impl SensorRegistry {
    pub async fn load<S: ReadingStore>(store: &mut S) -> Result<Self, RelationalError> {
        let registry: Self = store.load_sensors().await?.into_iter().collect();
        tracing::info!(count = registry.len(), sensors = ?registry.sensors, "sensors");
        if registry.is_empty() {
            tracing::warn!("sensor catalog is empty; no readings will be written");
        }
        Ok(registry)
    }

    pub fn lookup(&self, name: &str) -> Option<i32> {
        self.sensors.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(i32, S)> for SensorRegistry {
    fn from_iter<I: IntoIterator<Item = (i32, S)>>(iter: I) -> Self {
        let mut sensors = HashMap::new();
        for (id, name) in iter {
            let name = name.into();
            if let Some(previous) = sensors.insert(name.clone(), id) {
                tracing::warn!(sensor = %name, previous, id, "duplicate sensor name in catalog");
            }
        }
        Self { sensors }
    }
}
