//! JSONB-backed prescription store.

use pharmonico_core::prescription::{
    Prescription, PrescriptionStatus, PrescriptionStore, StoreError, StoreFuture,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// Statuses that hold one unit of a pharmacy's capacity.
const IN_FLIGHT: [PrescriptionStatus; 6] = [
    PrescriptionStatus::PharmacySelected,
    PrescriptionStatus::Adjudicated,
    PrescriptionStatus::AwaitingPayment,
    PrescriptionStatus::PaymentWaived,
    PrescriptionStatus::Shipped,
    PrescriptionStatus::InTransit,
];

/// `PostgreSQL`-based prescription store.
///
/// Writes are upserts, so replaying a stage rewrites the same document.
pub struct PostgresPrescriptionStore {
    pool: PgPool,
}

impl PostgresPrescriptionStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `prescriptions` table and its status index if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the DDL fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS prescriptions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                document JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create prescriptions table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_prescriptions_status ON prescriptions(status)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to create status index: {e}")))?;

        tracing::info!("Prescription schema ready");
        Ok(())
    }

    /// Ids of prescriptions in `status`, oldest update first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_ids_by_status(
        &self,
        status: PrescriptionStatus,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id FROM prescriptions
            WHERE status = $1
            ORDER BY updated_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .collect()
    }

    /// Number of prescriptions per status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a stored status is unknown.
    pub async fn count_by_status(&self) -> Result<Vec<(PrescriptionStatus, i64)>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM prescriptions GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                Ok((status.parse()?, count))
            })
            .collect()
    }

    /// Prescriptions routed to a pharmacy and not yet delivered, per pharmacy.
    ///
    /// This is the authoritative load used to reconcile the capacity cache.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_in_flight_by_pharmacy(&self) -> Result<HashMap<String, u32>, StoreError> {
        let in_flight: Vec<String> = IN_FLIGHT.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            r"
            SELECT document->>'pharmacy_id' AS pharmacy_id, COUNT(*) AS count
            FROM prescriptions
            WHERE status = ANY($1) AND document->>'pharmacy_id' IS NOT NULL
            GROUP BY 1
            ",
        )
        .bind(&in_flight)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let pharmacy_id: String = row
                    .try_get("pharmacy_id")
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                Ok((pharmacy_id, u32::try_from(count).unwrap_or(u32::MAX)))
            })
            .collect()
    }

    async fn upsert(&self, prescription: &Prescription) -> Result<(), StoreError> {
        let document = serde_json::to_value(prescription)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO prescriptions (id, status, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&prescription.id)
        .bind(prescription.status.as_str())
        .bind(&document)
        .bind(prescription.created_at)
        .bind(prescription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            prescription_id = %prescription.id,
            status = %prescription.status,
            "Prescription saved"
        );
        metrics::counter!(
            "pharmonico_store_writes_total",
            "status" => prescription.status.as_str()
        )
        .increment(1);
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<Prescription>, StoreError> {
        let row = sqlx::query("SELECT document FROM prescriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let document: serde_json::Value = row
            .try_get("document")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        serde_json::from_value(document)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("Corrupt document {id}: {e}")))
    }
}

impl PrescriptionStore for PostgresPrescriptionStore {
    fn save<'a>(&'a self, prescription: &'a Prescription) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert(prescription))
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Prescription>> {
        Box::pin(self.fetch(id))
    }
}
