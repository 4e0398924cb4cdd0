//! End-to-end orchestration tests with fake infrastructure tools.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use provision::{
    BootstrapReport, BootstrapRequest, BootstrapTool, InfraDefinition, InfraTool, Readiness,
    ReadinessProbe, RenderRequest, SentinelRun, Templater, ToolError,
};
use tempfile::TempDir;
use test_suite::{
    Catalog, Cost, CostEstimator, DestroyRequest, DestroyTargets, Orchestrator, ProviderConfig,
    ResultUploader, RunConfig, RunFlags, RunStatus, RunSummary, SuiteError, TestContext,
    TestHandler, TestOutcome, TestRegistry, TestStatus, Toolchain, UploadConfig,
};
use test_suite::cost::ResourceUsage;

const PROVIDER: &str = r"
providerName: openstack
providerInstanceName: openstack_compute_instance_v2
pathToKey: /home/me/.ssh/id_rsa
flavor: m1.large
";

struct FakeTemplater;

impl Templater for FakeTemplater {
    fn render(&self, req: &RenderRequest) -> Result<InfraDefinition, ToolError> {
        Ok(InfraDefinition {
            main_tf: format!("# {}\n", req.node_name),
            variables: serde_json::Map::new(),
        })
    }
}

#[derive(Default)]
struct FakeInfra {
    failing: Vec<String>,
    applied: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
}

impl FakeInfra {
    fn failing(groups: &[&str]) -> Self {
        Self {
            failing: groups.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    fn run(&self, tag: &str) -> SentinelRun {
        SentinelRun {
            // exit status alone is never trusted
            exit_success: true,
            sentinel_seen: !self.failing.iter().any(|g| g == tag),
            tail: vec![format!("{tag} done")],
        }
    }

    fn applied(&self) -> Vec<String> {
        let mut applied = self.applied.lock().unwrap().clone();
        applied.sort();
        applied
    }

    fn destroyed(&self) -> Vec<String> {
        let mut destroyed = self.destroyed.lock().unwrap().clone();
        destroyed.sort();
        destroyed
    }
}

#[async_trait]
impl InfraTool for FakeInfra {
    async fn apply(&self, dir: &Path, tag: &str) -> Result<SentinelRun, ToolError> {
        self.applied.lock().unwrap().push(tag.to_string());
        std::fs::write(dir.join("terraform.tfstate"), "{}")?;
        Ok(self.run(tag))
    }

    async fn destroy(&self, _dir: &Path, tag: &str) -> Result<SentinelRun, ToolError> {
        self.destroyed.lock().unwrap().push(tag.to_string());
        Ok(self.run(tag))
    }
}

#[derive(Default)]
struct FakeBootstrap {
    failing: Vec<String>,
    panicking: Vec<String>,
}

#[async_trait]
impl BootstrapTool for FakeBootstrap {
    async fn bootstrap(&self, req: &BootstrapRequest) -> Result<BootstrapReport, ToolError> {
        if self.panicking.contains(&req.group) {
            panic!("inventory for {} is corrupt", req.group);
        }
        if self.failing.contains(&req.group) {
            return Err(ToolError::Failed {
                tool: "ansible-playbook".into(),
                message: "host unreachable".into(),
            });
        }
        std::fs::write(&req.kubeconfig, "apiVersion: v1\n")?;
        Ok(BootstrapReport {
            master_address: format!("10.0.0.{}", req.group.len()),
        })
    }
}

struct FakeProbe;

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn wait_ready(&self, _k: &Path, _t: Duration) -> Result<Readiness, ToolError> {
        Ok(Readiness::Ready)
    }
}

/// Fixed cost per flavor once anything was billed.
struct FlatCost(BTreeMap<String, f64>);

impl CostEstimator for FlatCost {
    fn estimate(&self, usage: &ResourceUsage) -> Cost {
        if usage.billable.is_zero() {
            return Cost::Known(0.0);
        }
        self.0.get(&usage.flavor).map_or(Cost::Unknown, |c| Cost::Known(*c))
    }
}

/// Writes a result file and reports a small payload.
struct WritingTest;

#[async_trait]
impl TestHandler for WritingTest {
    async fn run(&self, ctx: &TestContext) -> Result<TestOutcome> {
        std::fs::create_dir_all(&ctx.output_dir)?;
        std::fs::write(ctx.output_dir.join("result.log"), "ok")?;
        Ok(TestOutcome::passed(serde_json::json!({ "group": ctx.group })))
    }
}

struct PanickingTest;

#[async_trait]
impl TestHandler for PanickingTest {
    async fn run(&self, _ctx: &TestContext) -> Result<TestOutcome> {
        panic!("benchmark crashed");
    }
}

struct Harness {
    dir: TempDir,
    infra: Arc<FakeInfra>,
    bootstrap: Arc<FakeBootstrap>,
}

impl Harness {
    fn new(infra: FakeInfra) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            infra: Arc::new(infra),
            bootstrap: Arc::new(FakeBootstrap::default()),
        }
    }

    fn with_bootstrap(mut self, bootstrap: FakeBootstrap) -> Self {
        self.bootstrap = Arc::new(bootstrap);
        self
    }

    fn infra_root(&self) -> PathBuf {
        self.dir.path().join("infra")
    }

    fn results_root(&self) -> PathBuf {
        self.dir.path().join("results")
    }

    fn orchestrator(&self, catalog: &str, flags: RunFlags, costs: &[(&str, f64)]) -> Orchestrator {
        let catalog = Catalog::from_yaml(catalog).unwrap();
        let mut registry = TestRegistry::new();
        for name in catalog.tests.keys() {
            registry.register(name, Arc::new(WritingTest));
        }
        self.orchestrator_with(catalog, registry, flags, costs)
    }

    fn orchestrator_with(
        &self,
        catalog: Catalog,
        registry: TestRegistry,
        flags: RunFlags,
        costs: &[(&str, f64)],
    ) -> Orchestrator {
        let provider = ProviderConfig::from_yaml(PROVIDER).unwrap();
        let config = RunConfig::new(
            provider,
            catalog,
            flags,
            None,
            self.infra_root(),
            self.results_root(),
        )
        .unwrap();
        let tools = Toolchain {
            templater: Arc::new(FakeTemplater),
            infra: self.infra.clone(),
            bootstrap: self.bootstrap.clone(),
            readiness: Arc::new(FakeProbe),
        };
        let costs = costs.iter().map(|(f, c)| ((*f).to_string(), *c)).collect();
        Orchestrator::new(config, tools, registry, Arc::new(FlatCost(costs)))
    }
}

fn non_interactive() -> RunFlags {
    RunFlags {
        interactive: false,
        ..RunFlags::default()
    }
}

fn never_confirm(_: &[String]) -> bool {
    panic!("confirmation must not be requested");
}

fn completed(status: RunStatus) -> RunSummary {
    match status {
        RunStatus::Completed(summary) => summary,
        other => panic!("run did not complete: {other:?}"),
    }
}

fn artifact(summary: &RunSummary) -> serde_json::Value {
    let path = summary.artifact.as_ref().expect("run persisted");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

const SHARED_AND_CUSTOM: &str = r"
tests:
  a: { run: true, sharing: shared }
  b: { run: true, sharing: shared }
  c: { run: true, sharing: custom }
";

#[tokio::test]
async fn test_one_report_per_group() {
    let harness = Harness::new(FakeInfra::default());
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[]);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert_eq!(summary.launched, 2);
    assert_eq!(summary.reports, 2);
    assert_eq!(harness.infra.applied(), vec!["c", "shared"]);

    let document = artifact(&summary);
    let testing = document["testing"].as_array().unwrap();
    assert_eq!(testing.len(), 2);

    let shared = testing.iter().find(|e| e["cluster"] == "shared").unwrap();
    assert_eq!(shared["provisioned"], true);
    assert_eq!(shared["status"], "passed");
    assert_eq!(shared["metrics"]["a"]["status"], "passed");
    assert_eq!(shared["metrics"]["b"]["metrics"]["group"], "shared");

    // every pricing was unknown, so no estimate is published
    assert!(document.get("estimatedCost").is_none());
    assert_eq!(summary.unknown_cost_groups.len(), 2);
    assert_eq!(document["info"]["providerName"], "openstack");
    assert_eq!(document["testsCatalog"]["tests"]["c"]["sharing"], "custom");
}

#[tokio::test]
async fn test_failed_groups_still_report() {
    let harness = Harness::new(FakeInfra::failing(&["shared", "c"]));
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[]);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert_eq!(summary.launched, 2);
    assert_eq!(summary.reports, 2);
    assert_eq!(summary.failures.len(), 2);
    assert!(summary.failures["c"].contains("APPLY_INFRA"));

    // nothing was written, so the run is discarded
    assert!(summary.artifact.is_none());
    let provider_dir = harness.results_root().join("openstack");
    assert_eq!(std::fs::read_dir(provider_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_no_selected_tests_is_a_no_op() {
    let harness = Harness::new(FakeInfra::default());
    let catalog = "tests:\n  a: { run: false }\n  c: { run: false, sharing: custom }\n";
    let orchestrator = harness.orchestrator(catalog, non_interactive(), &[]);

    let status = orchestrator
        .run(&DestroyRequest::none(), never_confirm)
        .await
        .unwrap();

    assert!(matches!(status, RunStatus::NothingToDo));
    assert!(!harness.results_root().exists());
    assert!(harness.infra.applied().is_empty());
}

#[tokio::test]
async fn test_cost_counts_failed_groups() {
    let harness = Harness::new(FakeInfra::failing(&["x"]));
    let catalog = r"
tests:
  x: { run: true, sharing: custom, flavor: fx }
  y: { run: true, sharing: custom, flavor: fy }
";
    let orchestrator =
        harness.orchestrator(catalog, non_interactive(), &[("fx", 1.5), ("fy", 3.0)]);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert!((summary.total_cost - 4.5).abs() < f64::EPSILON);
    assert!(summary.unknown_cost_groups.is_empty());

    let document = artifact(&summary);
    let testing = document["testing"].as_array().unwrap();
    assert_eq!(testing.len(), 1);
    assert_eq!(testing[0]["cluster"], "y");
    assert_eq!(testing[0]["cost"], 3.0);
    assert_eq!(document["estimatedCost"], 4.5);
}

#[tokio::test]
async fn test_immediate_destroy_all_skips_the_run() {
    let harness = Harness::new(FakeInfra::default());
    let catalog = r"
tests:
  a: { run: true }
  c: { run: true, sharing: custom }
  d: { run: false, sharing: custom }
";
    for cluster in ["shared", "c", "d"] {
        std::fs::create_dir_all(harness.infra_root().join(cluster)).unwrap();
        std::fs::write(harness.infra_root().join(cluster).join("main.tf"), "").unwrap();
    }
    let orchestrator = harness.orchestrator(catalog, non_interactive(), &[]);

    let status = orchestrator
        .run(
            &DestroyRequest::immediate(DestroyTargets::All),
            never_confirm,
        )
        .await
        .unwrap();

    let RunStatus::Destroyed(reports) = status else {
        panic!("expected immediate destroy");
    };
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.succeeded()));
    assert_eq!(harness.infra.destroyed(), vec!["c", "d", "shared"]);
    assert!(!harness.infra_root().join("c/main.tf").exists());

    assert!(harness.infra.applied().is_empty());
    assert!(!harness.results_root().exists());
}

#[tokio::test]
async fn test_declined_destroy_aborts() {
    let harness = Harness::new(FakeInfra::default());
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, RunFlags::default(), &[]);

    let asked = Mutex::new(None);
    let status = orchestrator
        .run(
            &DestroyRequest::immediate(DestroyTargets::Clusters(vec!["c".into()])),
            |clusters| {
                *asked.lock().unwrap() = Some(clusters.to_vec());
                false
            },
        )
        .await
        .unwrap();

    assert!(matches!(status, RunStatus::DestroyAborted));
    assert_eq!(*asked.lock().unwrap(), Some(vec!["c".to_string()]));
    assert!(harness.infra.destroyed().is_empty());
}

#[tokio::test]
async fn test_on_completion_skips_unprovisioned_shared() {
    let harness = Harness::new(FakeInfra::default());
    let catalog = "tests:\n  a: { run: false }\n  c: { run: true, sharing: custom }\n";
    std::fs::create_dir_all(harness.infra_root().join("shared")).unwrap();
    let orchestrator = harness.orchestrator(catalog, non_interactive(), &[]);

    let destroy =
        DestroyRequest::on_completion(DestroyTargets::Clusters(vec!["shared".into()]));
    let summary = completed(orchestrator.run(&destroy, never_confirm).await.unwrap());

    assert!(summary.artifact.is_some());
    assert!(summary.teardowns.is_empty());
    assert!(harness.infra.destroyed().is_empty());
}

#[tokio::test]
async fn test_on_completion_destroys_provisioned_clusters() {
    let harness = Harness::new(FakeInfra::default());
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[]);

    let destroy = DestroyRequest::on_completion(DestroyTargets::Clusters(vec!["c".into()]));
    let summary = completed(orchestrator.run(&destroy, never_confirm).await.unwrap());

    assert_eq!(summary.teardowns.len(), 1);
    assert!(summary.teardowns[0].succeeded());
    assert_eq!(harness.infra.destroyed(), vec!["c"]);
    assert!(!harness.infra_root().join("c/terraform.tfstate").exists());
    assert!(harness.infra_root().join("shared/terraform.tfstate").exists());
}

#[tokio::test]
async fn test_retry_without_state_aborts_before_launch() {
    let harness = Harness::new(FakeInfra::default());
    std::fs::create_dir_all(harness.infra_root().join("shared")).unwrap();
    std::fs::write(harness.infra_root().join("shared/terraform.tfstate"), "{}").unwrap();
    let flags = RunFlags {
        retry: true,
        ..non_interactive()
    };
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, flags, &[]);

    let err = orchestrator
        .run(&DestroyRequest::none(), never_confirm)
        .await
        .unwrap_err();

    match err {
        SuiteError::RetryStateMissing { groups } => assert_eq!(groups, vec!["c"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!harness.results_root().exists());
    assert!(harness.infra.applied().is_empty());
}

#[tokio::test]
async fn test_retry_reuses_infrastructure() {
    let harness = Harness::new(FakeInfra::default());
    for cluster in ["shared", "c"] {
        std::fs::create_dir_all(harness.infra_root().join(cluster)).unwrap();
        std::fs::write(harness.infra_root().join(cluster).join("terraform.tfstate"), "{}")
            .unwrap();
    }
    let flags = RunFlags {
        retry: true,
        ..non_interactive()
    };
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, flags, &[]);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert!(summary.failures.is_empty());
    assert!(harness.infra.applied().is_empty());
    assert_eq!(artifact(&summary)["testing"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unregistered_test_aborts_before_launch() {
    let harness = Harness::new(FakeInfra::default());
    let catalog = Catalog::from_yaml(SHARED_AND_CUSTOM).unwrap();
    let mut registry = TestRegistry::new();
    registry.register("a", Arc::new(WritingTest));
    let orchestrator = harness.orchestrator_with(catalog, registry, non_interactive(), &[]);

    let err = orchestrator
        .run(&DestroyRequest::none(), never_confirm)
        .await
        .unwrap_err();

    assert!(matches!(err, SuiteError::UnregisteredTests(ref t) if t == &["b", "c"]));
    assert!(!harness.results_root().exists());
}

#[tokio::test]
async fn test_panicking_test_is_reported_as_failed() {
    let harness = Harness::new(FakeInfra::default());
    let catalog = Catalog::from_yaml(SHARED_AND_CUSTOM).unwrap();
    let mut registry = TestRegistry::new();
    registry.register("a", Arc::new(WritingTest));
    registry.register("b", Arc::new(PanickingTest));
    registry.register("c", Arc::new(WritingTest));
    let orchestrator = harness.orchestrator_with(catalog, registry, non_interactive(), &[]);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert_eq!(summary.reports, 2);
    let document = artifact(&summary);
    let shared = document["testing"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["cluster"] == "shared")
        .unwrap()
        .clone();
    assert_eq!(shared["status"], "failed");
    assert_eq!(shared["metrics"]["a"]["status"], "passed");
    assert_eq!(shared["metrics"]["b"]["status"], "failed");
    assert!(shared["metrics"]["b"]["metrics"]["error"]
        .as_str()
        .unwrap()
        .contains("benchmark crashed"));
}

#[tokio::test]
async fn test_only_test_mode_never_provisions() {
    let harness = Harness::new(FakeInfra::default());
    let flags = RunFlags {
        only_test: true,
        ..non_interactive()
    };
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, flags, &[("m1.large", 2.0)]);

    let destroy = DestroyRequest::on_completion(DestroyTargets::All);
    let summary = completed(orchestrator.run(&destroy, never_confirm).await.unwrap());

    assert!(harness.infra.applied().is_empty());
    assert!(harness.infra.destroyed().is_empty());
    assert!(summary.teardowns.is_empty());
    // nothing was billed
    assert!(summary.total_cost.abs() < f64::EPSILON);

    let document = artifact(&summary);
    assert!(document["testing"]
        .as_array()
        .unwrap()
        .iter()
        .all(|e| e["provisioned"] == false));
}

#[tokio::test]
async fn test_bootstrap_failures_keep_partial_cost() {
    let harness = Harness::new(FakeInfra::default()).with_bootstrap(FakeBootstrap {
        failing: vec!["shared".into()],
        panicking: vec!["c".into()],
    });
    let orchestrator =
        harness.orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[("m1.large", 2.0)]);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert_eq!(summary.launched, 2);
    assert_eq!(summary.reports, 2);
    assert!(summary.failures["c"].contains("worker panicked"));
    assert!(summary.failures["c"].contains("inventory for c is corrupt"));
    assert!(summary.failures["shared"].starts_with("Failed to bootstrap 'shared' k8s cluster"));

    // both groups were applied and billed before bootstrap went wrong
    assert_eq!(harness.infra.applied(), vec!["c", "shared"]);
    assert!((summary.total_cost - 4.0).abs() < f64::EPSILON);
    assert!(summary.unknown_cost_groups.is_empty());

    // no test ran, so nothing was persisted
    assert!(summary.artifact.is_none());
}

#[tokio::test]
async fn test_upload_failure_keeps_results() {
    let harness = Harness::new(FakeInfra::default());
    let uploader = ResultUploader::new(UploadConfig {
        endpoint: "https://s3.example.org".into(),
        bucket: "s3://results".into(),
    })
    .with_binary("aws-cli-not-installed");
    let orchestrator = harness
        .orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[])
        .with_uploader(uploader);

    let summary = completed(
        orchestrator
            .run(&DestroyRequest::none(), never_confirm)
            .await
            .unwrap(),
    );

    assert!(summary.artifact.as_ref().unwrap().is_file());
    assert!(matches!(
        summary.upload,
        Some(Err(SuiteError::UploadFailure { ref endpoint, .. })) if endpoint == "https://s3.example.org"
    ));
}

#[tokio::test]
async fn test_destroy_target_outside_infra_root_is_rejected() {
    let harness = Harness::new(FakeInfra::default());
    let outside = harness.dir.path().join("outside");
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("main.tf"), "").unwrap();
    std::fs::write(outside.join("config"), "").unwrap();
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[]);

    let destroy =
        DestroyRequest::immediate(DestroyTargets::Clusters(vec!["../outside".into()]));
    let err = orchestrator.run(&destroy, never_confirm).await.unwrap_err();

    assert!(matches!(err, SuiteError::Config(_)));
    assert!(harness.infra.destroyed().is_empty());
    assert!(outside.join("main.tf").exists());
    assert!(outside.join("config").exists());
}

#[tokio::test]
async fn test_unknown_on_completion_target_aborts_before_launch() {
    let harness = Harness::new(FakeInfra::default());
    let orchestrator = harness.orchestrator(SHARED_AND_CUSTOM, non_interactive(), &[]);

    let destroy = DestroyRequest::on_completion(DestroyTargets::Clusters(vec![
        "c".into(),
        "unknown".into(),
    ]));
    let err = orchestrator.run(&destroy, never_confirm).await.unwrap_err();

    assert!(err.to_string().contains("Unknown cluster 'unknown'"));
    assert!(harness.infra.applied().is_empty());
    assert!(!harness.results_root().exists());
}

#[test]
fn test_status_serialization() {
    assert_eq!(serde_json::to_value(TestStatus::Failed).unwrap(), "failed");
}
