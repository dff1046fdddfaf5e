use super::{ReadingColumn, ReadingStore, ResolvedReading, StoreConnector};
use crate::error::{RelationalError, TxStep};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Statement};
use std::time::Duration;

pub struct PgConnector {
    connect_string: String,
}

impl PgConnector {
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
        }
    }
}

impl StoreConnector for PgConnector {
    type Store = PgStore;

    async fn connect(&self) -> Result<PgStore, RelationalError> {
        let connect_string = self.connect_string.trim();
        if connect_string.is_empty() {
            return Err(RelationalError::NotConnected);
        }
        tracing::info!("connecting to db");
        // One tick writes at a time, so a single connection is enough.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(8))
            .connect(connect_string)
            .await
            .map_err(RelationalError::Connect)?;
        Ok(PgStore { pool })
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl ReadingStore for PgStore {
    async fn load_sensors(&mut self) -> Result<Vec<(i32, String)>, RelationalError> {
        sqlx::query_as::<_, (i32, String)>("SELECT id, name FROM sensors")
            .fetch_all(&self.pool)
            .await
            .map_err(RelationalError::Query)
    }

    async fn insert_batch(
        &mut self,
        timestamp: DateTime<Utc>,
        column: ReadingColumn,
        rows: &[ResolvedReading],
    ) -> Result<usize, RelationalError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(RelationalError::tx(TxStep::Begin))?;

        let statement = (&mut *tx)
            .prepare(column.insert_statement())
            .await
            .map_err(RelationalError::tx(TxStep::Prepare))?;

        // An early return drops `tx`, which rolls the batch back.
        for row in rows {
            statement
                .query()
                .bind(timestamp)
                .bind(row.sensor)
                .bind(row.value)
                .execute(&mut *tx)
                .await
                .map_err(RelationalError::tx(TxStep::Insert))?;
        }

        tx.commit()
            .await
            .map_err(RelationalError::tx(TxStep::Commit))?;
        Ok(rows.len())
    }
}
