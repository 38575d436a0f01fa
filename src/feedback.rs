//! Background worker that drains the feedback job outbox.
//!
//! Submitting an exercise only enqueues a row in `feedback_jobs`; this
//! worker polls for pending rows, gathers the session's attempts and asks
//! the external generative service for a narrative summary. The summary is
//! stored back on the job, so clients poll the job status instead of
//! waiting on the external call.

use crate::cli::Args;
use crate::model::exercise::{
    FEEDBACK_STATUS_DONE, FEEDBACK_STATUS_FAILED, FEEDBACK_STATUS_PENDING,
};
use crate::schema::{
    exercise_attempts::dsl as ea_dsl, exercise_sessions::dsl as es_dsl,
    feedback_jobs::dsl as fj_dsl,
};
use anyhow::Context;
use chrono::Utc;
use deadpool_diesel::postgres::Pool;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

const CLAIM_BATCH_SIZE: i64 = 10;

#[derive(Serialize, Debug)]
struct FeedbackRequest {
    session_id: i64,
    chapter_id: i64,
    total_attempts: i32,
    correct_attempts: i32,
    accuracy: f64,
    mistakes: Vec<Mistake>,
}

#[derive(Serialize, Debug)]
struct Mistake {
    sentence_id: i64,
    word_index: i32,
    selected_case_id: Option<i64>,
    correct_case_id: i64,
}

#[derive(Deserialize, Debug)]
struct FeedbackReply {
    summary: String,
}

pub struct FeedbackWorker {
    pool: Pool,
    client: reqwest::Client,
    service_url: Url,
    poll_interval: Duration,
    max_attempts: i32,
}

impl FeedbackWorker {
    pub fn new(args: &Args, pool: Pool) -> Self {
        FeedbackWorker {
            pool,
            client: reqwest::Client::new(),
            service_url: args.feedback_service_url.clone(),
            poll_interval: Duration::from_secs(args.feedback_poll_interval_secs),
            max_attempts: args.feedback_max_attempts,
        }
    }

    /// Polls forever. A failed cycle is logged and retried on the next tick;
    /// the worker itself never gives up.
    pub async fn run(self) {
        info!(
            "Feedback worker started (interval: {:?}, max attempts: {})",
            self.poll_interval, self.max_attempts
        );
        loop {
            if let Err(err) = self.run_once().await {
                error!("Feedback worker cycle failed: {:?}", err);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let max_attempts = self.max_attempts;
        let conn = self.pool.get().await.context("Failed to get connection")?;
        let jobs = conn
            .interact(move |conn_sync| {
                fj_dsl::feedback_jobs
                    .filter(fj_dsl::status.eq(FEEDBACK_STATUS_PENDING))
                    .filter(fj_dsl::attempts.lt(max_attempts))
                    .order(fj_dsl::id.asc())
                    .limit(CLAIM_BATCH_SIZE)
                    .select((fj_dsl::id, fj_dsl::session_id, fj_dsl::attempts))
                    .load::<(i64, i64, i32)>(conn_sync)
            })
            .await
            .map_err(|err| anyhow::anyhow!("Database interaction error: {}", err))?
            .context("Failed to load pending feedback jobs")?;

        if jobs.is_empty() {
            debug!("No pending feedback jobs");
            return Ok(());
        }
        debug!("Claimed {} pending feedback jobs", jobs.len());

        for (job_id, session_id, attempts) in jobs {
            match self.process_job(session_id).await {
                Ok(summary) => {
                    self.finish_job(job_id, summary).await?;
                    info!("Feedback job {} for session {} done", job_id, session_id);
                }
                Err(err) => {
                    warn!(
                        "Feedback job {} for session {} failed (attempt {}): {:?}",
                        job_id,
                        session_id,
                        attempts + 1,
                        err
                    );
                    self.record_failure(job_id, attempts).await?;
                }
            }
        }

        Ok(())
    }

    /// Gathers the submitted session's attempts and asks the generative
    /// service for a summary.
    #[instrument(skip(self))]
    async fn process_job(&self, session_id: i64) -> anyhow::Result<String> {
        let conn = self.pool.get().await.context("Failed to get connection")?;
        let (chapter_id, attempts) = conn
            .interact(move |conn_sync| {
                let chapter_id = es_dsl::exercise_sessions
                    .find(session_id)
                    .select(es_dsl::chapter_id)
                    .first::<i64>(conn_sync)?;
                let attempts = ea_dsl::exercise_attempts
                    .filter(ea_dsl::session_id.eq(session_id))
                    .order(ea_dsl::id.asc())
                    .select((
                        ea_dsl::sentence_id,
                        ea_dsl::word_index,
                        ea_dsl::selected_case_id,
                        ea_dsl::correct_case_id,
                        ea_dsl::is_correct,
                    ))
                    .load::<(i64, i32, Option<i64>, i64, bool)>(conn_sync)?;
                Ok::<_, diesel::result::Error>((chapter_id, attempts))
            })
            .await
            .map_err(|err| anyhow::anyhow!("Database interaction error: {}", err))?
            .context("Failed to load session attempts")?;

        let total_attempts = attempts.len() as i32;
        let correct_attempts = attempts.iter().filter(|a| a.4).count() as i32;
        let accuracy = if total_attempts > 0 {
            f64::from(correct_attempts) / f64::from(total_attempts) * 100.0
        } else {
            0.0
        };
        let mistakes: Vec<Mistake> = attempts
            .iter()
            .filter(|a| !a.4)
            .map(|a| Mistake {
                sentence_id: a.0,
                word_index: a.1,
                selected_case_id: a.2,
                correct_case_id: a.3,
            })
            .collect();

        let request = FeedbackRequest {
            session_id,
            chapter_id,
            total_attempts,
            correct_attempts,
            accuracy,
            mistakes,
        };

        let url = self
            .service_url
            .join("feedback")
            .context("Invalid feedback service URL")?;
        let reply = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .context("Feedback service request failed")?
            .error_for_status()
            .context("Feedback service returned an error status")?
            .json::<FeedbackReply>()
            .await
            .context("Failed to parse feedback service reply")?;

        Ok(reply.summary)
    }

    async fn finish_job(&self, job_id: i64, summary: String) -> anyhow::Result<()> {
        let conn = self.pool.get().await.context("Failed to get connection")?;
        conn.interact(move |conn_sync| {
            diesel::update(fj_dsl::feedback_jobs.find(job_id))
                .set((
                    fj_dsl::status.eq(FEEDBACK_STATUS_DONE),
                    fj_dsl::summary.eq(summary),
                    fj_dsl::attempts.eq(fj_dsl::attempts + 1),
                    fj_dsl::updated_at.eq(Utc::now()),
                ))
                .execute(conn_sync)
        })
        .await
        .map_err(|err| anyhow::anyhow!("Database interaction error: {}", err))?
        .context("Failed to mark feedback job done")?;
        Ok(())
    }

    /// Bumps the attempt counter; the job is marked failed once the counter
    /// reaches the configured limit, otherwise it stays pending for the next
    /// tick.
    async fn record_failure(&self, job_id: i64, previous_attempts: i32) -> anyhow::Result<()> {
        let failed = previous_attempts + 1 >= self.max_attempts;
        let conn = self.pool.get().await.context("Failed to get connection")?;
        conn.interact(move |conn_sync| {
            if failed {
                diesel::update(fj_dsl::feedback_jobs.find(job_id))
                    .set((
                        fj_dsl::status.eq(FEEDBACK_STATUS_FAILED),
                        fj_dsl::attempts.eq(fj_dsl::attempts + 1),
                        fj_dsl::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn_sync)
            } else {
                diesel::update(fj_dsl::feedback_jobs.find(job_id))
                    .set((
                        fj_dsl::attempts.eq(fj_dsl::attempts + 1),
                        fj_dsl::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn_sync)
            }
        })
        .await
        .map_err(|err| anyhow::anyhow!("Database interaction error: {}", err))?
        .context("Failed to record feedback job failure")?;
        Ok(())
    }
}
