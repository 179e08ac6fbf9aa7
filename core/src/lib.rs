//! Remittance bucket engine.
//!
//! Claims stream in, get grouped into buckets by the configured bucketing
//! rules, and each bucket is driven through its lifecycle: accumulate until
//! a threshold fires, gate on the commit criteria (automatic or human
//! approval), hand off to the file composer, then deliver with bounded
//! retry. `engine::BucketEngine` is the entry point.

// Macros first: `text_enum!` is used by the model modules below.
pub mod types;

pub mod claim;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod store;

pub mod approval_workflow;
pub mod bucketing_resolver;
pub mod claim_aggregator;
pub mod commit_criteria;
pub mod delivery_retry;
pub mod engine;
pub mod lifecycle_controller;
pub mod scheduled_monitor;
pub mod threshold_evaluator;
