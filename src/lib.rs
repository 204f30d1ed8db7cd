//! Render Job Orchestration
//!
//! This library provides the core of the render-jobs system: it accepts
//! media files with a transformation command, runs the command through an
//! external tool on a Redis-backed queue, tracks progress and previews, and
//! keeps persisted job records consistent with the files on disk.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
