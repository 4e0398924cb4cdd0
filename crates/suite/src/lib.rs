//! Cloud validation test suite.
//!
//! Partitions a tests catalog into cluster groups, provisions each group's
//! infrastructure concurrently, runs the tests, aggregates results and costs,
//! and optionally tears the infrastructure down.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use test_suite::{
//!     Catalog, DestroyRequest, HourlyRateEstimator, Orchestrator, ProviderConfig, RunConfig,
//!     RunFlags, TestRegistry, Toolchain,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = ProviderConfig::load("configs.yaml".as_ref())?;
//!     let catalog = Catalog::load("testsCatalog.yaml".as_ref())?;
//!     let tools = Toolchain::production(&provider);
//!     let registry = TestRegistry::from_catalog(&catalog);
//!     let estimator = Arc::new(HourlyRateEstimator::new(provider.costs.clone()));
//!     let config = RunConfig::new(provider, catalog, RunFlags::default(), None, "infra", "results")?;
//!
//!     Orchestrator::new(config, tools, registry, estimator)
//!         .run(&DestroyRequest::none(), |_| false)
//!         .await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::doc_markdown)]

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod cost;
pub mod destroy;
pub mod error;
pub mod launcher;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod ui;
pub mod upload;
pub mod validator;

// Re-export commonly used types at the crate root
pub use aggregator::{AggregatedRun, Finalization, ResultAggregator, TestResultEntry};
pub use catalog::{Catalog, SharingMode, TestDefinition};
pub use config::{ProviderConfig, RunConfig, RunFlags, UploadConfig};
pub use cost::{Cost, CostEstimator, HourlyRateEstimator};
pub use destroy::{DestroyPolicy, DestroyRequest, DestroyTargets};
pub use error::{SuiteError, SuiteResult};
pub use orchestrator::{Orchestrator, RunStatus, RunSummary};
pub use pipeline::{BillableClock, ProvisionStage, Toolchain};
pub use registry::{TestContext, TestHandler, TestOutcome, TestRegistry, TestStatus};
pub use scheduler::{ClusterGroup, ClusterGroupScheduler, SHARED_GROUP};
pub use upload::ResultUploader;
