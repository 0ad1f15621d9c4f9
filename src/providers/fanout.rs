// src/providers/fanout.rs
//! Concurrency-limited batch runner with partial-failure tolerance.
//!
//! N homogeneous work items run with at most K in flight; results come back
//! in input order and one item's failure never cancels its siblings. The
//! caller picks a completeness policy when turning the outcome into a result.

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::future::Future;

use crate::error::PipelineError;

/// How many item successes count as overall success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// At least one item must succeed. Used for batch asset generation.
    BestEffort,
    /// Every item must succeed. Used where partial output is unusable.
    AllRequired,
}

/// Raw per-item results in input order, plus aggregates.
pub struct FanOutOutcome<T> {
    pub results: Vec<Result<(T, Decimal), PipelineError>>,
}

/// Successful values (with their input index), surviving failures, and the
/// summed cost of everything that succeeded.
#[derive(Debug)]
pub struct FanOutReport<T> {
    pub values: Vec<(usize, T)>,
    pub failed: Vec<(usize, String)>,
    pub total_cost: Decimal,
}

impl<T> FanOutOutcome<T> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Apply a completeness policy. On rejection the first captured item
    /// failure is surfaced as the overall error.
    pub fn into_result(self, policy: CompletionPolicy) -> Result<FanOutReport<T>, PipelineError> {
        let succeeded = self.succeeded();
        let total = self.results.len();

        let mut values = Vec::with_capacity(succeeded);
        let mut failed = Vec::new();
        let mut first_error = None;
        let mut total_cost = Decimal::ZERO;

        for (index, result) in self.results.into_iter().enumerate() {
            match result {
                Ok((value, cost)) => {
                    total_cost += cost;
                    values.push((index, value));
                }
                Err(err) => {
                    failed.push((index, err.to_string()));
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let rejected = match policy {
            CompletionPolicy::AllRequired => succeeded < total,
            CompletionPolicy::BestEffort => succeeded == 0,
        };

        if rejected {
            return Err(first_error.unwrap_or_else(|| PipelineError::ProviderLogic {
                service: "fan_out".to_string(),
                message: "no work items produced a result".to_string(),
            }));
        }

        if !failed.is_empty() {
            tracing::warn!(
                "Fan-out finished with {}/{} items succeeded ({} failures tolerated)",
                succeeded,
                total,
                failed.len()
            );
        }

        Ok(FanOutReport {
            values,
            failed,
            total_cost,
        })
    }
}

/// Run `op` over every item with at most `limit` operations in flight.
/// Results preserve input order.
pub async fn run_bounded<I, T, F, Fut>(items: Vec<I>, limit: usize, op: F) -> FanOutOutcome<T>
where
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = Result<(T, Decimal), PipelineError>>,
{
    let limit = limit.max(1);
    let futures = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| op(index, item));

    let results = stream::iter(futures)
        .buffered(limit)
        .collect::<Vec<_>>()
        .await;

    FanOutOutcome { results }
}
