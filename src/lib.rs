//! # k-dispatch
//!
//! A rule execution and scheduling engine that delegates backups to external
//! synchronizer executables.
//!
//! ## Features
//!
//! - **Pluggable engines**: any executable speaking the synchronizer verbs
//!   (`sync`, `versions-of`, `restore`, `list-files`, ...) can back a rule
//! - **Scheduler pipeline**: script hooks, per-rule log sinks, dry runs and
//!   batch dispatch layered over a minimal scheduler plugin contract
//! - **Crash-safe history**: one record per execution, recovered as failed
//!   when its writer died
//! - **At most one execution per rule**: non-blocking advisory locks
//! - **Signal propagation**: SIGINT/SIGTERM reach child processes and are
//!   reported once cleanup ran
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_dispatch::backup::orchestrator::Orchestrator;
//! use k_dispatch::backup::process::ProcessRunner;
//! use k_dispatch::backup::signals::SignalCoordinator;
//! use std::sync::Arc;
//!
//! let signals = Arc::new(SignalCoordinator::install()?);
//! let orchestrator = Orchestrator::load("k-dispatch.yaml", ProcessRunner::new(signals))?;
//!
//! // Hand every configured rule to its scheduler
//! orchestrator.schedule(&[], false)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
