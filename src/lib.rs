//! # Heimdall
//!
//! Supervision control plane for a redundant fleet of validator nodes that
//! share one staking identity. The fleet redundantly runs the same stake
//! pool; heimdall keeps the pool available by promoting the healthiest
//! node to block-producing leader, while rigorously preventing two nodes
//! from ever signing under the same identity at once.
//!
//! The control plane is made of four cooperating services:
//!
//! * the [`monitor`] polls every node for its statistics and broadcasts
//!   the aggregated snapshot;
//! * the [`schedule`] watchdog obtains the leader schedule of each epoch
//!   exactly once, checks which nodes computed the same schedule and
//!   persists the accepted one;
//! * the [`leadership`] jury consumes both feeds and decides which
//!   candidate holds the leader enrolment;
//! * the sanity and turnover loops of [`leadership`] audit the fleet
//!   around scheduled blocks and carry the leader role across epoch
//!   boundaries.

pub mod api;
pub mod blockcfg;
pub mod leadership;
pub mod monitor;
pub mod schedule;
pub mod secure;
pub mod settings;
pub mod time;
pub mod utils;
