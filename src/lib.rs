//! Prompt evaluation service: generate prompt variations, judge them with
//! several LLM evaluators across test cases and criteria, and rank them.

pub mod auth;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod runs;
pub mod storage;
