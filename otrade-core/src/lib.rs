//! OTrade Core — the synchronous trading decision engine.
//!
//! This crate contains everything that decides, without doing any I/O beyond
//! the pattern store:
//! - Domain types (bars, ticks, decisions, order plans, positions, trades)
//! - Indicators and the multi-timeframe analyzer
//! - Pattern memory with similarity recall and a persistent store
//! - Decision synthesis from rules, memory and an external oracle
//! - Risk sizing and trade guards
//! - Position lifecycle with a ratcheting trailing stop

pub mod analysis;
pub mod decision;
pub mod domain;
pub mod indicators;
pub mod lifecycle;
pub mod memory;
pub mod risk;
pub mod rng;
