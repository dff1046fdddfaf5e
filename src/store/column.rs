use thiserror::Error;

#[derive(Debug, Error)]
#[error("column {0:?} is not an allowed reading column")]
pub struct UnknownColumn(pub String);

/// Value columns of `sensor_readings` the writer may target. Each maps to a
/// fixed statement, so no caller-supplied text reaches the SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadingColumn {
    #[default]
    Reading,
    Value,
    RawReading,
    ScaledReading,
}

impl ReadingColumn {
    pub const ALL: [ReadingColumn; 4] = [
        ReadingColumn::Reading,
        ReadingColumn::Value,
        ReadingColumn::RawReading,
        ReadingColumn::ScaledReading,
    ];

    pub fn parse(name: &str) -> Result<Self, UnknownColumn> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|column| column.as_str() == name)
            .ok_or_else(|| UnknownColumn(name.to_string()))
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ReadingColumn::Reading => "reading",
            ReadingColumn::Value => "value",
            ReadingColumn::RawReading => "raw_reading",
            ReadingColumn::ScaledReading => "scaled_reading",
        }
    }

    pub const fn insert_statement(self) -> &'static str {
        match self {
            ReadingColumn::Reading => {
                "INSERT INTO sensor_readings (ts, sensor, reading) VALUES ($1, $2, $3)"
            }
            ReadingColumn::Value => {
                "INSERT INTO sensor_readings (ts, sensor, value) VALUES ($1, $2, $3)"
            }
            ReadingColumn::RawReading => {
                "INSERT INTO sensor_readings (ts, sensor, raw_reading) VALUES ($1, $2, $3)"
            }
            ReadingColumn::ScaledReading => {
                "INSERT INTO sensor_readings (ts, sensor, scaled_reading) VALUES ($1, $2, $3)"
            }
        }
    }
}

impl std::fmt::Display for ReadingColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
