//! PixPro image-transformation worker
//!
//! This library provides the core functionality for the pixpro-worker system:
//! a horizontally-replicable worker that consumes image jobs from partitioned
//! RabbitMQ queues, runs a fetch → AI transform → store pipeline under a
//! wall-clock deadline, and publishes outcome events.

pub mod app_state;
pub mod backoff;
pub mod classify;
pub mod config;
pub mod consumer;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
