//! Integration test suite for cadence.
//!
//! These tests drive the engine through its public API only: tasks with
//! dependencies, the concurrency limit, retries, recurring triggers,
//! leveled workflows and persistence across restarts.
//!
//! # Test Categories
//!
//! - `task_flow`: Dependency fan-out, slot limits, retries and timeouts
//! - `scheduling`: Recurring cron triggers
//! - `workflow_e2e`: Full workflow execution tests
//! - `recovery`: Persistence, reload, push sync and health
//!
//! Time-dependent tests run on a paused tokio clock and finish instantly.

mod fixtures;

mod recovery;
mod scheduling;
mod task_flow;
mod workflow_e2e;
