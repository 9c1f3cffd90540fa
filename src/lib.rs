//! # Chainvault - Backup Orchestration Engine
//!
//! Chainvault schedules full and incremental backups of named volumes, keeps the
//! resulting chains consistent while several workers run at once, restores any point in a
//! chain, and deletes old entries without ever orphaning an incremental that still needs
//! its parent.
//!
//! ## Features
//!
//! - **Chain-Aware Retention**: entries are deleted leaf first, and only when every
//!   descendant is already gone. The newest valid backup of a volume is never expired.
//! - **Exclusive Job Leases**: a job (and its environment) runs on at most one worker at
//!   a time. Leases expire, get reclaimed, and late writes from a stale holder are rejected.
//! - **Verified Restores**: every unit is hashed against its recorded checksum before it
//!   is written. Interrupted restores resume from the last applied entry.
//! - **Transactional Metadata**: environments, jobs, entries, runs and leases live in one
//!   embedded sled database. Every multi-record change is a single transaction.
//! - **Async Design**: Tokio scheduler, bounded worker pool and periodic retention sweeper.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainvault::config::Config;
//! use chainvault::service::Service;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("chainvault.toml").await?;
//!     config.validate()?;
//!
//!     let service = Service::from_config(&config)?;
//!     service.apply_config(&config)?;
//!     service
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`model`] - persistent record types and identifiers
//! - [`store`] - sled-backed metadata store with transactional mutations
//! - [`chain`] - pure chain resolution: restore paths, expiry, deletion frontier
//! - [`lease`] - job leases and restore pins
//! - [`schedule`] - schedule expressions and next-slot computation
//! - [`scheduler`] - due-job scanning and enqueueing
//! - [`transfer`] - content-transfer abstraction and the filesystem implementation
//! - [`worker`] - backup and restore execution, worker pool
//! - [`retention`] - retention sweeps
//! - [`service`] - operations exposed to the CLI and the daemon loop
//! - [`config`] - configuration management and validation
//! - [`errors`] - error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Scheduler     │────▶│   Worker Pool   │ ← backup / restore runs
//! └─────────────────┘     └─────────────────┘
//!          │                       │
//! ┌─────────────────┐     ┌─────────────────┐
//! │  Lock Manager   │     │ Content Transfer│ ← payload bytes
//! └─────────────────┘     └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Metadata Store  │ ← chain state, runs, leases
//! └─────────────────┘
//! ```

pub mod chain;
pub mod config;
pub mod errors;
pub mod lease;
pub mod model;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transfer;
pub mod worker;
