//! Timer service for suspended nodes
//!
//! A timer node schedules a `TimerJob`; the service persists it, arms a
//! task per job and delivers every fire over a channel to the execution
//! core. Jobs survive restarts through `TimerService::restore`.

pub mod job;
pub mod schedule;
pub mod service;

pub use job::{job_key, FireEvent, PersistedJob, TimerFire, TimerJob};
pub use service::TimerService;
