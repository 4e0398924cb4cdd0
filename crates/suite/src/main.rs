//! Cloud validation test suite CLI.
//!
//! Provisions one Kubernetes cluster per test group on a cloud provider,
//! runs the selected tests, and writes the results and estimated costs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Input};
use tracing_subscriber::EnvFilter;

use test_suite::validator::PrerequisitesValidator;
use test_suite::{
    ui, Catalog, DestroyRequest, DestroyTargets, HourlyRateEstimator, Orchestrator,
    ProviderConfig, ResultUploader, RunConfig, RunFlags, RunStatus, TestRegistry, Toolchain,
};

/// Cloud validation test suite.
#[derive(Parser)]
#[command(
    name = "test-suite",
    version,
    about = "Validate cloud providers by provisioning Kubernetes clusters and running tests",
    long_about = "Validate cloud providers by provisioning Kubernetes clusters and running tests.\n\n\
                  Tests marked as shared run together on one cluster; custom tests\n\
                  get a dedicated cluster each. Clusters are provisioned concurrently\n\
                  with Terraform and Ansible."
)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Answer yes to every prompt.
    #[arg(short = 'y', long = "yes")]
    non_interactive: bool,

    /// Run tests on existing clusters without provisioning.
    #[arg(short, long, conflicts_with = "retry")]
    only_test: bool,

    /// Reuse existing infrastructure and resume at cluster bootstrap.
    #[arg(long)]
    retry: bool,

    /// Bootstrap clusters over private node addresses.
    #[arg(long)]
    use_private_ips: bool,

    /// Provider configuration file.
    #[arg(short, long, env = "TS_CONFIGS", default_value = "configs.yaml")]
    configs: PathBuf,

    /// Tests catalog file.
    #[arg(short, long, env = "TS_TESTS_CATALOG", default_value = "testsCatalog.yaml")]
    tests_catalog: PathBuf,

    /// Destroy clusters now instead of running ("all" for every cluster).
    #[arg(long, num_args = 1.., value_name = "CLUSTERS", conflicts_with = "destroy_on_completion")]
    destroy: Option<Vec<String>>,

    /// Destroy clusters provisioned by this run once it completes.
    #[arg(long, num_args = 1.., value_name = "CLUSTERS")]
    destroy_on_completion: Option<Vec<String>>,

    /// Node count for the shared cluster.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    custom_nodes: Option<u32>,

    /// Root of the results tree.
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Root of the per-cluster infrastructure directories.
    #[arg(long, default_value = "infra")]
    infra_root: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn destroy_request(&self) -> DestroyRequest {
        match (&self.destroy, &self.destroy_on_completion) {
            (Some(clusters), _) => DestroyRequest::immediate(DestroyTargets::from_args(clusters)),
            (None, Some(clusters)) => {
                DestroyRequest::on_completion(DestroyTargets::from_args(clusters))
            }
            (None, None) => DestroyRequest::none(),
        }
    }

    fn flags(&self) -> RunFlags {
        RunFlags {
            interactive: !self.non_interactive,
            only_test: self.only_test,
            retry: self.retry,
            use_private_ips: self.use_private_ips,
        }
    }
}

fn confirm_destroy(clusters: &[String]) -> bool {
    ui::print_warning(&format!(
        "The following clusters will be destroyed: {}",
        clusters.join(", ")
    ));
    Input::<String>::with_theme(&ColorfulTheme::default())
        .with_prompt("Type 'yes' to continue")
        .allow_empty(true)
        .interact_text()
        .is_ok_and(|answer| answer.trim() == "yes")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("info,test_suite=debug,provision=debug")
    } else {
        EnvFilter::new("warn,test_suite=info,provision=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let provider = ProviderConfig::load(&cli.configs)
        .with_context(|| format!("Failed to load {}", cli.configs.display()))?;
    let catalog = Catalog::load(&cli.tests_catalog)
        .with_context(|| format!("Failed to load {}", cli.tests_catalog.display()))?;

    let destroy = cli.destroy_request();
    let tools = Toolchain::production(&provider);
    let registry = TestRegistry::from_catalog(&catalog);
    let estimator = Arc::new(HourlyRateEstimator::new(provider.costs.clone()));
    let uploader = provider.upload.clone().map(ResultUploader::new);

    let config = RunConfig::new(
        provider,
        catalog,
        cli.flags(),
        cli.custom_nodes,
        &cli.infra_root,
        &cli.results_dir,
    )?;

    if cli.destroy.is_none() {
        ui::print_section("Checking prerequisites");
        PrerequisitesValidator::for_run(&config).validate()?;
    }

    let mut orchestrator = Orchestrator::new(config, tools, registry, estimator);
    if let Some(uploader) = uploader {
        orchestrator = orchestrator.with_uploader(uploader);
    }

    match orchestrator.run(&destroy, confirm_destroy).await? {
        RunStatus::NothingToDo => {}
        RunStatus::DestroyAborted => println!("{}", "Destroy cancelled.".yellow()),
        RunStatus::Destroyed(reports) => {
            let failed = reports.iter().filter(|r| !r.succeeded()).count();
            if failed > 0 {
                ui::print_warning(&format!("{failed} cluster(s) could not be destroyed"));
            }
        }
        RunStatus::Completed(summary) => {
            if !summary.failures.is_empty() {
                ui::print_warning(&format!(
                    "{} of {} cluster group(s) failed",
                    summary.failures.len(),
                    summary.launched
                ));
            }
        }
    }

    Ok(())
}
