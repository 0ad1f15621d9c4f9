// src/services/cost_ledger.rs
//! Append-only cost ledger.
//!
//! Every provider charge lands here once; rows are never updated or deleted,
//! and their per-session sum equals the session's cost total.

use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::PipelineError;

pub struct CostLedger;

/// Per-service aggregate for a session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceCost {
    pub service: String,
    pub total: Decimal,
    pub records: i64,
}

impl CostLedger {
    pub async fn record(
        pool: &PgPool,
        session_id: Uuid,
        service: &str,
        amount: Decimal,
        detail: serde_json::Value,
    ) -> Result<i64, PipelineError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO cost_records (session_id, service, amount, detail)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(session_id)
        .bind(service)
        .bind(amount)
        .bind(detail)
        .fetch_one(pool)
        .await?;

        tracing::debug!("💰 Recorded {} cost ${} for session {}", service, amount, session_id);
        Ok(row.0)
    }

    pub async fn session_total(pool: &PgPool, session_id: Uuid) -> Result<Decimal, PipelineError> {
        let row: (Option<Decimal>,) =
            sqlx::query_as("SELECT SUM(amount) FROM cost_records WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(pool)
                .await?;
        Ok(row.0.unwrap_or(Decimal::ZERO))
    }

    pub async fn session_breakdown(
        pool: &PgPool,
        session_id: Uuid,
    ) -> Result<Vec<ServiceCost>, PipelineError> {
        let rows: Vec<(String, Decimal, i64)> = sqlx::query_as(
            r#"
            SELECT service, SUM(amount), COUNT(*)
            FROM cost_records
            WHERE session_id = $1
            GROUP BY service
            ORDER BY SUM(amount) DESC
            "#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(service, total, records)| ServiceCost {
                service,
                total,
                records,
            })
            .collect())
    }
}
