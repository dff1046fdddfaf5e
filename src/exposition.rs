use crate::readings::{Reading, ReadingSet};

/// Self-metrics of the exporter runtime; never forwarded.
pub const INTERNAL_METRIC_PREFIXES: &[&str] = &["go_", "process_", "promhttp_"];

pub const DEFAULT_SCALE_FACTOR: f64 = 1000.0;

/// Metrics whose name starts with one of `prefixes` are multiplied by `factor`
/// before integer coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitScaling {
    pub prefixes: Vec<String>,
    pub factor: f64,
}

impl Default for UnitScaling {
    fn default() -> Self {
        Self {
            prefixes: vec!["temperature_".to_string(), "pressure_".to_string()],
            factor: DEFAULT_SCALE_FACTOR,
        }
    }
}

impl UnitScaling {
    pub fn apply(&self, name: &str, value: f64) -> Reading {
        let scaled = if self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            value * self.factor
        } else {
            value
        };
        // `as` truncates toward zero and saturates at the i64 bounds.
        scaled as Reading
    }
}

fn is_internal(line: &str) -> bool {
    INTERNAL_METRIC_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Parses a `name value` exposition body. Malformed lines are logged and
/// skipped; parsing itself never fails.
pub fn parse_exposition(body: &str, scaling: &UnitScaling) -> ReadingSet {
    let mut readings = ReadingSet::new();

    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') || is_internal(line) {
            continue;
        }

        let parts: Vec<&str> = line.split(' ').collect();
        let [name, value_text] = parts.as_slice() else {
            tracing::warn!(line = %line, "invalid line");
            continue;
        };

        let value = match value_text.parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            Ok(_) => {
                tracing::warn!(metric = %name, value = %value_text, "skipping non-finite value");
                continue;
            }
            Err(err) => {
                tracing::warn!(metric = %name, value = %value_text, error = %err, "failed to parse value");
                continue;
            }
        };

        readings.insert(*name, scaling.apply(name, value));
    }

    readings
}
