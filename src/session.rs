//! The bounded self-correction loop: generate SQL, execute, classify, retry
//! with the failure as context, give up at the attempt ceiling. Success after
//! a correction leaves a learning record behind.

use crate::{
    error::{Result, ServiceError},
    executor::{ExecuteQuery, ExecutionContext, QueryResult},
    generate::{GenerationRequest, SqlGenerator},
    knowledge::KnowledgeItem,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{sync::Arc, time::Duration, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hard ceiling per question: one original attempt plus up to three
/// corrections.
pub const MAX_ATTEMPTS: u32 = 4;

/// One attempt within a session. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAttempt {
    pub index: u32,
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_sql: Option<String>,
    pub elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    TypeMismatch,
    MissingFilter,
    JoinPattern,
    AggregationGotcha,
    NamingConvention,
    DataQuality,
    BusinessLogic,
}

/// A (failure, fix) pair worth keeping. Confidence starts in the middle of
/// [0, 1]; reuse confirmation and contradiction adjust it outside this core.
#[derive(Debug, Clone, Serialize)]
pub struct LearningRecord {
    pub session_id: Uuid,
    pub tenant_id: String,
    pub category: LearningCategory,
    pub original_sql: String,
    pub original_error: String,
    pub corrected_sql: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn record(&self, record: LearningRecord) -> Result<()>;
}

/// Keeps learnings in process memory; the durable store is an external
/// collaborator with the same interface.
#[derive(Default)]
pub struct MemoryLearningSink {
    records: Mutex<Vec<LearningRecord>>,
}

impl MemoryLearningSink {
    pub fn records(&self) -> Vec<LearningRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl LearningSink for MemoryLearningSink {
    async fn record(&self, record: LearningRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// The outcome of one question: every attempt made, in order, and the final
/// result. The session itself is ephemeral; only learnings persist.
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub attempts: Vec<QueryAttempt>,
    pub corrected: bool,
    pub result: Result<QueryResult>,
}

pub struct CorrectionLoop {
    generator: Arc<dyn SqlGenerator>,
    learnings: Arc<dyn LearningSink>,
    max_attempts: u32,
}

impl CorrectionLoop {
    pub fn new(generator: Arc<dyn SqlGenerator>, learnings: Arc<dyn LearningSink>) -> Self {
        Self {
            generator,
            learnings,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Drives one question to completion. Attempts are strictly sequential:
    /// each correction prompt depends on the previous attempt's error.
    /// Cancelling the returned future cancels the in-flight attempt; the
    /// scoped connection guard takes care of the checkout.
    pub async fn answer(
        &self,
        executor: &dyn ExecuteQuery,
        ctx: &ExecutionContext,
        question: &str,
        schema_metadata: &str,
        knowledge: &[KnowledgeItem],
    ) -> SessionOutcome {
        let session_id = Uuid::new_v4();
        let mut attempts: Vec<QueryAttempt> = Vec::new();
        let mut prior: Option<(String, String)> = None;

        loop {
            let attempt = attempts.len() as u32 + 1;
            debug!(%session_id, attempt, state = "generating", "requesting SQL");

            let mut request = GenerationRequest::new(question, schema_metadata, knowledge);
            if let Some((failed_sql, error)) = prior.as_ref() {
                request = request.with_failure(failed_sql, error);
            }
            let sql = match self.generator.generate(&request).await {
                Ok(sql) => sql,
                Err(err) => {
                    warn!(%session_id, attempt, error = %err, "generation step failed");
                    return SessionOutcome {
                        session_id,
                        attempts,
                        corrected: false,
                        result: Err(err),
                    };
                }
            };

            debug!(%session_id, attempt, state = "executing", "running candidate SQL");
            let started = Instant::now();
            let outcome = executor.execute(ctx, &sql).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(result) => {
                    attempts.push(attempt_record(attempt, &sql, Some(&result), elapsed, None));
                    let corrected = attempt > 1;
                    if corrected {
                        self.emit_learning(session_id, ctx, prior.as_ref(), &sql).await;
                    }
                    info!(
                        %session_id,
                        attempt,
                        rows = result.row_count,
                        corrected,
                        state = "succeeded",
                        "query session finished"
                    );
                    return SessionOutcome {
                        session_id,
                        attempts,
                        corrected,
                        result: Ok(result),
                    };
                }
                Err(err) => {
                    let message = err.public_message();
                    attempts.push(attempt_record(attempt, &sql, None, elapsed, Some(&message)));

                    if err.is_correctable() && attempt < self.max_attempts {
                        debug!(%session_id, attempt, state = "correcting", error = %message, "retrying with correction");
                        prior = Some((sql, message));
                        continue;
                    }

                    let corrections = attempt.saturating_sub(1);
                    info!(%session_id, attempt, corrections, state = "failed", "query session exhausted");
                    return SessionOutcome {
                        session_id,
                        attempts,
                        corrected: false,
                        result: Err(annotate_exhausted(err, corrections)),
                    };
                }
            }
        }
    }

    async fn emit_learning(
        &self,
        session_id: Uuid,
        ctx: &ExecutionContext,
        prior: Option<&(String, String)>,
        corrected_sql: &str,
    ) {
        let Some((original_sql, original_error)) = prior else {
            return;
        };
        let record = LearningRecord {
            session_id,
            tenant_id: ctx.descriptor.tenant_id.clone(),
            category: infer_category(original_error),
            original_sql: original_sql.clone(),
            original_error: original_error.clone(),
            corrected_sql: corrected_sql.to_string(),
            confidence: 0.5,
            created_at: Utc::now(),
        };
        if let Err(err) = self.learnings.record(record).await {
            // A full answer beats a lost learning; log and move on.
            warn!(%session_id, error = %err, "failed to persist learning record");
        }
    }
}

fn attempt_record(
    index: u32,
    sql: &str,
    result: Option<&QueryResult>,
    elapsed: Duration,
    error: Option<&str>,
) -> QueryAttempt {
    QueryAttempt {
        index,
        sql: sql.to_string(),
        executed_sql: result.map(|r| r.executed_sql.clone()),
        elapsed_ms: elapsed.as_millis(),
        error: error.map(str::to_string),
        succeeded: result.is_some(),
    }
}

/// After the ceiling, the caller learns how hard we tried.
fn annotate_exhausted(err: ServiceError, corrections: u32) -> ServiceError {
    match err {
        ServiceError::Correctable { message } if corrections > 0 => ServiceError::Correctable {
            message: format!(
                "{message} (automatic correction attempted {corrections} times)"
            ),
        },
        other => other,
    }
}

/// Best-effort category from the sanitized error text. The categories a
/// message cannot indicate (a missing filter reads as a wrong result, not an
/// error) stay reserved for curation outside the loop.
pub fn infer_category(error: &str) -> LearningCategory {
    let lower = error.to_lowercase();
    if lower.contains("ambiguous") {
        LearningCategory::JoinPattern
    } else if lower.contains("cannot be matched")
        || lower.contains("cast")
        || lower.contains("invalid input syntax")
        || lower.contains("type")
    {
        LearningCategory::TypeMismatch
    } else if lower.contains("aggregate")
        || lower.contains("group by")
        || lower.contains("must appear")
    {
        LearningCategory::AggregationGotcha
    } else if lower.contains("does not exist") {
        LearningCategory::NamingConvention
    } else if lower.contains("division by zero") || lower.contains("null") {
        LearningCategory::DataQuality
    } else {
        LearningCategory::BusinessLogic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn categories_follow_the_error_text() {
        assert_eq!(
            infer_category("column \"amt\" does not exist"),
            LearningCategory::NamingConvention
        );
        assert_eq!(
            infer_category("column reference \"id\" is ambiguous"),
            LearningCategory::JoinPattern
        );
        assert_eq!(
            infer_category("operator does not exist: text + integer, try a cast"),
            LearningCategory::TypeMismatch
        );
        assert_eq!(
            infer_category("column \"t.x\" must appear in the GROUP BY clause"),
            LearningCategory::AggregationGotcha
        );
        assert_eq!(infer_category("division by zero"), LearningCategory::DataQuality);
        assert_eq!(infer_category("something else"), LearningCategory::BusinessLogic);
    }

    #[test]
    fn exhausted_correctable_errors_mention_the_correction_count() {
        let err = annotate_exhausted(
            ServiceError::Correctable {
                message: "column \"amt\" does not exist".into(),
            },
            3,
        );
        assert!(err
            .public_message()
            .contains("automatic correction attempted 3 times"));
    }

    #[test]
    fn fatal_errors_are_not_annotated() {
        let err = annotate_exhausted(ServiceError::PoolBusy, 2);
        assert!(matches!(err, ServiceError::PoolBusy));
    }
}
