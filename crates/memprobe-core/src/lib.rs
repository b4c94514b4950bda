//! # memprobe Core
//!
//! The benchmark execution engine for memprobe: characterizes a host's memory
//! subsystem by measuring aggregate throughput under configurable concurrent
//! load and access latency at varying injected load, broken down by NUMA
//! placement, access pattern, operation, transfer width, and stride.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      BenchmarkManager                        │
//! │                                                              │
//! │  EngineConfig ──► MatrixBuilder ──► ordered BenchmarkSpecs   │
//! │                                                              │
//! │  per spec:                                                   │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//! │  │ WorkingSet  │──►│  WorkerPool  │◄──│   PowerSampler   │  │
//! │  │ Arena(node) │   │ (pinned thr) │   │  (per package)   │  │
//! │  └─────────────┘   └──────┬───────┘   └──────────────────┘  │
//! │                           │                                  │
//! │                           ▼                                  │
//! │                      ResultRow ──► ResultSink                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`topology`] - NUMA node, logical CPU, and physical package detection
//! - [`config`] - Validated, read-only engine configuration
//! - [`arena`] - Per-node page/huge-page aligned working-set allocation
//! - [`matrix`] - Enumeration of the benchmark configuration space
//! - [`worker`] - Pinned worker threads running calibrated access kernels
//! - [`power`] - Per-package DRAM power sampling windows
//! - [`report`] - Result rows and reporting collaborators
//! - [`manager`] - Sequential orchestration of the whole sweep
//!
//! ## Example
//!
//! ```rust,ignore
//! use memprobe_core::config::EngineConfig;
//! use memprobe_core::manager::BenchmarkManager;
//! use memprobe_core::report::ConsoleReporter;
//!
//! let config = EngineConfig::builder()
//!     .working_set_per_thread(4 * 1024 * 1024)
//!     .worker_threads(2)
//!     .build()?;
//!
//! let mut manager = BenchmarkManager::new(config)?;
//! let mut sink = ConsoleReporter::new();
//! manager.run(&mut sink)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed where required, with SAFETY comments
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod config;
pub mod manager;
pub mod matrix;
pub mod power;
pub mod report;
pub mod topology;
pub mod worker;

pub use config::EngineConfig;
pub use manager::BenchmarkManager;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration rejected before any allocation took place.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Working-set allocation failed. Fatal: the engine never falls back to
    /// a different node or page size.
    #[error("arena allocation error: {0}")]
    Arena(#[from] arena::ArenaError),

    /// A worker pool could not be constructed for a configuration. The
    /// remaining matrix is abandoned; rows already emitted stay valid.
    #[error("worker error: {0}")]
    Worker(#[from] worker::WorkerError),

    /// The reporting collaborator failed to accept a row.
    #[error("report sink error: {0}")]
    Sink(#[from] std::io::Error),
}
