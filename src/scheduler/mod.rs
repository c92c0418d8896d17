//! Cron-driven replication scheduler.
//!
//! Each enabled schedule carries a cron expression, a group of contexts,
//! and a concurrency cap. Triggering goes through the exact same workflow
//! entry point as an interactive request, so scheduled and manual
//! replications can never diverge in validation; the scheduler's only extra
//! duty is filtering out contexts held by a failover and honoring the cap.

pub mod cron;

use crate::db::queries::{
    failover as failover_queries, replication as replication_queries, schedule as schedule_queries,
};
use crate::models::failover::FailoverPhase;
use crate::models::replication::ReplicationType;
use crate::models::schedule::ReplicationSchedule;
use crate::workflows::Workflows;
use chrono::Utc;
use cron::CronExpr;
use log::{info, warn};
use sqlx::{MySql, Pool};
use std::sync::Arc;
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
    pool: Pool<MySql>,
    workflows: Arc<Workflows>,
}

impl Scheduler {
    pub fn new(pool: Pool<MySql>, workflows: Arc<Workflows>) -> Self {
        Self { pool, workflows }
    }

    /// Runs forever; one pass every tick.
    pub async fn run(self) {
        info!("Scheduler started (tick every {:?})", TICK_INTERVAL);
        loop {
            if let Err(e) = self.tick().await {
                warn!("Scheduler tick failed: {:#}", e);
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        for schedule in schedule_queries::list_enabled(&self.pool).await? {
            let expr = match CronExpr::parse(&schedule.cron_expression) {
                Ok(expr) => expr,
                Err(e) => {
                    warn!("Schedule {} has a bad cron expression: {}", schedule.name, e);
                    continue;
                }
            };

            match schedule.next_run_at {
                None => {
                    // Newly created schedule; arm it without firing
                    if let Some(next) = expr.next_after(now) {
                        schedule_queries::set_run_times(
                            &self.pool,
                            schedule.id,
                            schedule.last_run_at.unwrap_or(now),
                            Some(next),
                        )
                        .await?;
                    }
                }
                Some(next_run) if next_run <= now => {
                    self.trigger(&schedule).await?;
                    schedule_queries::set_run_times(
                        &self.pool,
                        schedule.id,
                        now,
                        expr.next_after(now),
                    )
                    .await?;
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Fires one schedule: starts replications for as many group members as
    /// the concurrency cap leaves room for.
    pub async fn trigger(&self, schedule: &ReplicationSchedule) -> anyhow::Result<()> {
        let members = schedule_queries::members_for_schedule(&self.pool, schedule.id).await?;
        info!(
            "Schedule {} fired: {} member(s), cap {}",
            schedule.name,
            members.len(),
            schedule.max_concurrent
        );

        let mut in_flight = 0i32;
        let mut eligible = Vec::new();

        for member in &members {
            if replication_queries::find_active_for_context(&self.pool, &member.vm_context_id)
                .await?
                .is_some()
            {
                in_flight += 1;
                continue;
            }

            // Contexts held by a failover in phases 2-7 are filtered here,
            // at trigger time
            if let Some(job) =
                failover_queries::find_active_for_context(&self.pool, &member.vm_context_id).await?
            {
                let blocks = FailoverPhase::parse(&job.phase)
                    .map(|p| p.blocks_replication())
                    .unwrap_or(true);
                if blocks {
                    continue;
                }
            }

            eligible.push(member.vm_context_id.clone());
        }

        let available = (schedule.max_concurrent - in_flight).max(0) as usize;
        let requested_type = match schedule.replication_type.as_str() {
            "initial" => Some(ReplicationType::Initial),
            _ => None, // per-disk decision from stored cursors
        };

        for context_id in eligible.into_iter().take(available) {
            match self
                .workflows
                .clone()
                .start_replication(&context_id, requested_type)
                .await
            {
                Ok(job) => info!("Scheduled replication {} for {}", job.id, context_id),
                Err(e) => warn!("Scheduled replication for {} refused: {}", context_id, e),
            }
        }

        Ok(())
    }
}
