use chrono::{DateTime, Utc};
use flowrun_core::{Error, Result, TimerConfig, TimerKind, MAX_WAIT_SECS};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schedule::validate_cron;

/// Store key of the job owned by a node
pub fn job_key(flow_run_id: &str, node_id: &str) -> String {
    format!("timer:{}:{}", flow_run_id, node_id)
}

/// A scheduled resumption of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerJob {
    pub kind: TimerKind,
    pub tenant_id: String,
    pub flow_run_id: String,
    pub node_id: String,
    #[serde(default)]
    pub data: Value,
    /// Cron expression
    #[serde(default)]
    pub expression: Option<String>,
    /// Interval period in seconds
    #[serde(default)]
    pub interval: Option<u64>,
    /// One-shot delay in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl TimerJob {
    pub fn from_config(
        tenant_id: &str,
        flow_run_id: &str,
        node_id: &str,
        config: &TimerConfig,
        data: Value,
    ) -> Self {
        Self {
            kind: config.kind,
            tenant_id: tenant_id.to_string(),
            flow_run_id: flow_run_id.to_string(),
            node_id: node_id.to_string(),
            data,
            expression: config.cron.clone(),
            interval: config.interval,
            timeout: config.timeout,
            end_date: config.end_date,
        }
    }

    pub fn key(&self) -> String {
        job_key(&self.flow_run_id, &self.node_id)
    }

    pub fn is_recurring(&self) -> bool {
        self.kind != TimerKind::Timeout
    }

    /// Whether a recurring job's end date has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_recurring() && self.end_date.map_or(false, |end| end <= now)
    }

    pub fn validate(&self) -> Result<()> {
        for secs in [self.interval, self.timeout].into_iter().flatten() {
            if secs > MAX_WAIT_SECS {
                return Err(Error::validation(format!(
                    "Timer value {}s exceeds the {}s limit",
                    secs, MAX_WAIT_SECS
                )));
            }
        }
        match self.kind {
            TimerKind::Cron => {
                let expr = self
                    .expression
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| Error::validation("Cron expression is required for cron jobs"))?;
                validate_cron(expr)
            }
            TimerKind::Interval => match self.interval {
                Some(secs) if secs > 0 => Ok(()),
                _ => Err(Error::validation("Interval is required for interval jobs")),
            },
            TimerKind::Timeout => match self.timeout {
                Some(_) => Ok(()),
                None => Err(Error::validation("Timeout value is required for timeout jobs")),
            },
        }
    }
}

/// Durable form of an armed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub job: TimerJob,
    pub next_fire_at: DateTime<Utc>,
    #[serde(default)]
    pub fires: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireEvent {
    /// The schedule came due; resume the node
    Tick,
    /// A recurring schedule passed its end date and was removed
    Expired,
}

/// Delivered to the execution core for every fire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerFire {
    pub job_id: String,
    pub event: FireEvent,
    pub kind: TimerKind,
    pub tenant_id: String,
    pub flow_run_id: String,
    pub node_id: String,
    /// `{firedAt, tick, data}`
    pub payload: Value,
}

impl TimerFire {
    pub(crate) fn new(job: &TimerJob, event: FireEvent, tick: u64) -> Self {
        Self {
            job_id: job.key(),
            event,
            kind: job.kind,
            tenant_id: job.tenant_id.clone(),
            flow_run_id: job.flow_run_id.clone(),
            node_id: job.node_id.clone(),
            payload: serde_json::json!({
                "firedAt": Utc::now().to_rfc3339(),
                "tick": tick,
                "data": job.data,
            }),
        }
    }
}
