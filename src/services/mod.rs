//! Services Layer
//!
//! The download pipeline's building blocks. Each service is either a
//! stateless `XService` that takes `&AppState` or a shared store held in it.
//!
//! # Architecture
//!
//! ```text
//! pipeline --> DownloadService ──> ResultCache (hit: done)
//!                                  └─> RetryCoordinator --> ExchangeGateway
//!                                      └─> DataValidator --> DataStore + ResultCache
//!              PerformanceMonitor observes every request
//! ```
//!
//! # Services
//!
//! - `DownloadService` - Orchestrates single and batched downloads
//! - `RetryCoordinator` - Bounded exponential backoff around exchange calls
//! - `ResultCache` - Freshness cache of validated OHLCV per series
//! - `DataValidator` - Integrity checks on fetched datasets
//! - `PerformanceMonitor` - Per-operation metrics and JSONL ledger
//! - `Normalizer` / `technical_indicators` - ML preprocessing

pub mod cache;
pub mod download_service;
pub mod enrichment;
pub mod monitor;
pub mod retry;
pub mod validator;

// Re-export commonly used types and services
pub use cache::{CacheKey, ResultCache};
pub use download_service::{DataSource, Download, DownloadDiagnostics, DownloadOptions, DownloadService};
pub use enrichment::{technical_indicators, IndicatorFrame, Normalizer};
pub use monitor::{MetricUpdate, MonitorSummary, OperationId, OperationRecord, PerformanceMonitor};
pub use retry::{RetryCoordinator, RetryPolicy};
pub use validator::{DataValidator, ValidationResult};
