//! Concurrent bottom-up build scheduler.
//!
//! Walks a [`BuildPlan`] in dependency order with bounded parallelism. A node
//! becomes eligible once all its dependencies have terminated successfully;
//! eligible nodes are dispatched FIFO, ties broken by package name. The first
//! failure stops dispatch, in-flight builds are awaited (never killed), and
//! the failure is surfaced.

use crate::builder::{BuildMode, Builder};
use crate::config::Config;
use crate::error::{EsyError, Result};
use crate::plan::{BuildPlan, BuildTask};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Rebuild policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Force {
    /// Rebuild only what the per-node decision requires.
    #[default]
    No,
    /// Rebuild the root unconditionally.
    ForRoot,
    /// Rebuild everything unconditionally.
    Yes,
}

/// Whether the stage → install commit is skipped for the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildOnly {
    #[default]
    No,
    /// The root's staged artifacts are not moved to its install path.
    /// Dependencies always install.
    ForRoot,
}

/// Side-channel for build progress.
pub trait ProgressReporter: Send + Sync {
    fn started(&self, task: &BuildTask);
    fn succeeded(&self, task: &BuildTask, from_cache: bool);
    fn failed(&self, task: &BuildTask, error: &EsyError);
}

/// Reporter forwarding progress to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn started(&self, task: &BuildTask) {
        info!(package = %task.pkg_id(), "building");
    }

    fn succeeded(&self, task: &BuildTask, from_cache: bool) {
        if from_cache {
            debug!(package = %task.pkg_id(), "up to date");
        } else {
            info!(package = %task.pkg_id(), "built");
        }
    }

    fn failed(&self, task: &BuildTask, error: &EsyError) {
        warn!(package = %task.pkg_id(), error = %error, "build failed");
    }
}

/// Cooperative cancellation signal, checked between scheduling ticks and
/// before each dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Attempts to take a task's store lock before giving up.
const LOCK_ATTEMPTS: u32 = 5;

/// Initial backoff after a lock contention, doubled per attempt.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Dependency-graph build scheduler.
#[derive(Debug, Clone)]
pub struct Scheduler {
    force: Force,
    build_only: BuildOnly,
    concurrency: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { force: Force::No, build_only: BuildOnly::No, concurrency: default_concurrency() }
    }

    pub fn with_force(mut self, force: Force) -> Self {
        self.force = force;
        self
    }

    pub fn with_build_only(mut self, build_only: BuildOnly) -> Self {
        self.build_only = build_only;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Build every task in the plan, bottom-up.
    ///
    /// Returns the first failure after all in-flight builds have settled.
    #[instrument(skip_all, fields(root = %plan.root, concurrency = self.concurrency))]
    pub async fn run(
        &self,
        config: &Config,
        plan: &BuildPlan,
        builder: Arc<dyn Builder>,
        reporter: Arc<dyn ProgressReporter>,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let config = Arc::new(config.clone());
        let root_id = plan.root.clone();

        let mut pending: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, task) in &plan.tasks {
            pending.insert(id.as_str(), task.dependencies.len());
            for dep in &task.dependencies {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut initial: Vec<&str> =
            pending.iter().filter(|(_, count)| **count == 0).map(|(id, _)| *id).collect();
        initial.sort_by_key(|id| (&plan.tasks[*id].name, *id));
        let mut ready: VecDeque<&str> = initial.into();

        let mut in_flight: JoinSet<(String, Result<bool>)> = JoinSet::new();
        let mut first_failure: Option<EsyError> = None;

        loop {
            while first_failure.is_none()
                && !cancel.is_cancelled()
                && in_flight.len() < self.concurrency
            {
                let Some(id) = ready.pop_front() else { break };
                let task = plan.tasks[id].clone();
                let forced = match self.force {
                    Force::Yes => true,
                    Force::ForRoot => id == root_id,
                    Force::No => false,
                };
                let commit_install =
                    !(self.build_only == BuildOnly::ForRoot && id == root_id);

                let config = Arc::clone(&config);
                let builder = Arc::clone(&builder);
                let reporter = Arc::clone(&reporter);
                in_flight.spawn(async move {
                    let result = execute_node(
                        &config,
                        &task,
                        builder.as_ref(),
                        reporter.as_ref(),
                        forced,
                        commit_install,
                    )
                    .await;
                    (task.id, result)
                });
            }

            if cancel.is_cancelled()
                && first_failure.is_none()
                && (!in_flight.is_empty() || !ready.is_empty())
            {
                debug!("cancellation requested, draining in-flight builds");
                first_failure = Some(EsyError::Cancelled);
                ready.clear();
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            let (id, result) = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    if first_failure.is_none() {
                        first_failure =
                            Some(anyhow::anyhow!("build task panicked: {join_err}").into());
                        ready.clear();
                    }
                    continue;
                }
            };

            let task = &plan.tasks[&id];
            match result {
                Ok(from_cache) => {
                    reporter.succeeded(task, from_cache);
                    if first_failure.is_none() {
                        let mut unlocked = Vec::new();
                        for dependent in dependents.get(id.as_str()).into_iter().flatten() {
                            let count =
                                pending.get_mut(dependent).expect("dependent is a known task");
                            *count -= 1;
                            if *count == 0 {
                                unlocked.push(*dependent);
                            }
                        }
                        unlocked.sort_by_key(|id| (&plan.tasks[*id].name, *id));
                        ready.extend(unlocked);
                    }
                }
                Err(error) => {
                    reporter.failed(task, &error);
                    if first_failure.is_none() {
                        first_failure = Some(error);
                    }
                    ready.clear();
                }
            }
        }

        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Default concurrency: the online processor count, at least 1.
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

/// Decide, lock, and execute a single node.
async fn execute_node(
    config: &Config,
    task: &BuildTask,
    builder: &dyn Builder,
    reporter: &dyn ProgressReporter,
    forced: bool,
    commit_install: bool,
) -> Result<bool> {
    if !forced {
        let installed = tokio::fs::metadata(&task.install_path).await.is_ok();
        if installed && !task.source_type.is_rebuilt_when_installed() {
            return Ok(true);
        }
    }

    reporter.started(task);

    let lock_path = acquire_lock(config, task).await?;
    let result = builder.execute(config, task, BuildMode::Build, commit_install).await;
    release_lock(&lock_path).await;

    match result {
        Ok(()) => Ok(false),
        Err(source) => Err(EsyError::BuildFailed { package: task.pkg_id(), source }),
    }
}

/// Take the advisory lock guarding this task's build, with bounded backoff.
async fn acquire_lock(config: &Config, task: &BuildTask) -> Result<std::path::PathBuf> {
    let lock_path = config.lock_path(task.source_type, &task.id);
    if let Some(parent) = lock_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EsyError::io(parent.to_path_buf(), e))?;
    }

    let mut delay = LOCK_RETRY_DELAY;
    for attempt in 1..=LOCK_ATTEMPTS {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_) => return Ok(lock_path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if attempt < LOCK_ATTEMPTS {
                    debug!(id = %task.id, attempt, "store lock held, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
            Err(e) => return Err(EsyError::io(lock_path, e)),
        }
    }

    Err(EsyError::LockContention { id: task.id.clone() })
}

async fn release_lock(lock_path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(lock_path).await {
        warn!(path = %lock_path.display(), error = %e, "failed to release store lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AdapterError, AdapterErrorCategory};
    use crate::graph::SourceType;
    use crate::manifest::{BuildType, CommandList};
    use crate::plan::env::Environment;
    use crate::plan::TaskEnv;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config::new(tmp.path().join("esy"), tmp.path().join("proj"), "0.7.2")
    }

    fn task(config: &Config, name: &str, deps: &[&str], source_type: SourceType) -> BuildTask {
        let id = format!("{}-id", name);
        let empty = Environment::new();
        BuildTask {
            id: id.clone(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            source_type,
            build_type: BuildType::OutOfSource,
            plan: vec![CommandList::default(), CommandList::default()],
            source_path: config.sandbox_path.join(name),
            build_path: config.build_path(source_type, &id),
            stage_path: config.stage_path(source_type, &id),
            install_path: config.install_path(source_type, &id),
            env: TaskEnv { sandbox: empty.clone(), command: empty.clone(), build: empty },
            dependencies: deps.iter().map(|d| format!("{}-id", d)).collect(),
        }
    }

    fn plan_of(tasks: Vec<BuildTask>, root: &str) -> BuildPlan {
        let tasks: BTreeMap<String, BuildTask> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        BuildPlan { root: format!("{}-id", root), tasks }
    }

    /// Fake adapter recording invocations and returning scripted outcomes.
    #[derive(Default)]
    struct FakeBuilder {
        fail: HashSet<String>,
        delays: HashMap<String, Duration>,
        events: Mutex<Vec<String>>,
        commits: Mutex<HashMap<String, bool>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl FakeBuilder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn started_names(&self) -> HashSet<String> {
            self.events()
                .iter()
                .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
                .collect()
        }

        fn position(&self, event: &str) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("event {event} not recorded"))
        }
    }

    #[async_trait]
    impl Builder for FakeBuilder {
        async fn execute(
            &self,
            _config: &Config,
            task: &BuildTask,
            _mode: BuildMode,
            commit_install: bool,
        ) -> std::result::Result<(), AdapterError> {
            self.events.lock().unwrap().push(format!("start:{}", task.name));
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delays.get(&task.name) {
                tokio::time::sleep(*delay).await;
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.commits.lock().unwrap().insert(task.name.clone(), commit_install);
            self.events.lock().unwrap().push(format!("end:{}", task.name));

            if self.fail.contains(&task.name) {
                Err(AdapterError::new(AdapterErrorCategory::ExitNonZero, "scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    /// Reporter recording the progress side-channel.
    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressReporter for RecordingReporter {
        fn started(&self, task: &BuildTask) {
            self.events.lock().unwrap().push(format!("started:{}", task.name));
        }

        fn succeeded(&self, task: &BuildTask, from_cache: bool) {
            self.events.lock().unwrap().push(format!("succeeded:{}:{}", task.name, from_cache));
        }

        fn failed(&self, task: &BuildTask, _error: &EsyError) {
            self.events.lock().unwrap().push(format!("failed:{}", task.name));
        }
    }

    async fn run_plan(
        scheduler: Scheduler,
        config: &Config,
        plan: &BuildPlan,
        builder: Arc<FakeBuilder>,
        reporter: Arc<RecordingReporter>,
    ) -> Result<()> {
        let cancel = CancelFlag::new();
        scheduler.run(config, plan, builder, reporter, &cancel).await
    }

    #[tokio::test]
    async fn test_builds_follow_dependency_order() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        // root -> mid -> leaf. Everything transient so it always rebuilds.
        let plan = plan_of(
            vec![
                task(&config, "root", &["mid"], SourceType::Transient),
                task(&config, "mid", &["leaf"], SourceType::Transient),
                task(&config, "leaf", &[], SourceType::Transient),
            ],
            "root",
        );
        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(Scheduler::new(), &config, &plan, Arc::clone(&builder), reporter)
            .await
            .unwrap();

        assert!(builder.position("end:leaf") < builder.position("start:mid"));
        assert!(builder.position("end:mid") < builder.position("start:root"));
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let dep_names: Vec<&str> = vec!["a", "b", "c", "d", "e", "f"];
        let mut tasks: Vec<BuildTask> = dep_names
            .iter()
            .map(|name| task(&config, name, &[], SourceType::Transient))
            .collect();
        tasks.push(task(&config, "root", &dep_names, SourceType::Transient));

        let plan = plan_of(tasks, "root");
        let mut builder = FakeBuilder::default();
        for name in &dep_names {
            builder.delays.insert(name.to_string(), Duration::from_millis(20));
        }
        let builder = Arc::new(builder);
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(
            Scheduler::new().with_concurrency(2),
            &config,
            &plan,
            Arc::clone(&builder),
            reporter,
        )
        .await
        .unwrap();

        assert!(builder.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(builder.started_names().len(), 7);
    }

    #[tokio::test]
    async fn test_first_failure_cancels_pending_and_drains_in_flight() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let plan = plan_of(
            vec![
                task(&config, "root", &["a", "b", "c"], SourceType::Transient),
                task(&config, "a", &[], SourceType::Transient),
                task(&config, "b", &[], SourceType::Transient),
                task(&config, "c", &[], SourceType::Transient),
            ],
            "root",
        );

        // Concurrency 2 dispatches a and b; b fails fast while a is still
        // running; c must never start, a must run to completion.
        let mut builder = FakeBuilder::default();
        builder.fail.insert("b".to_string());
        builder.delays.insert("a".to_string(), Duration::from_millis(50));
        let builder = Arc::new(builder);
        let reporter = Arc::new(RecordingReporter::default());

        let err = run_plan(
            Scheduler::new().with_concurrency(2),
            &config,
            &plan,
            Arc::clone(&builder),
            Arc::clone(&reporter),
        )
        .await
        .unwrap_err();

        match err {
            EsyError::BuildFailed { package, .. } => assert_eq!(package, "b@1.0.0"),
            other => panic!("unexpected error: {other}"),
        }

        let started = builder.started_names();
        assert!(started.contains("a") && started.contains("b"));
        assert!(!started.contains("c"));
        assert!(!started.contains("root"));
        // a was in flight when b failed; it must have been awaited.
        assert!(builder.events().contains(&"end:a".to_string()));
        assert!(reporter.events().contains(&"failed:b".to_string()));
    }

    #[tokio::test]
    async fn test_immutable_installed_artifact_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let cached = task(&config, "cached", &[], SourceType::Immutable);
        std::fs::create_dir_all(&cached.install_path).unwrap();
        let plan = plan_of(vec![cached], "cached");

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(Scheduler::new(), &config, &plan, Arc::clone(&builder), Arc::clone(&reporter))
            .await
            .unwrap();

        assert!(builder.events().is_empty());
        assert_eq!(reporter.events(), vec!["succeeded:cached:true"]);
    }

    #[tokio::test]
    async fn test_transient_rebuilds_despite_installed_artifact() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let linked = task(&config, "linked", &[], SourceType::Transient);
        std::fs::create_dir_all(&linked.install_path).unwrap();
        let plan = plan_of(vec![linked], "linked");

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(Scheduler::new(), &config, &plan, Arc::clone(&builder), Arc::clone(&reporter))
            .await
            .unwrap();

        assert_eq!(builder.started_names().len(), 1);
        assert_eq!(reporter.events(), vec!["started:linked", "succeeded:linked:false"]);
    }

    #[tokio::test]
    async fn test_force_for_root_rebuilds_root_only() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let root = task(&config, "root", &["dep"], SourceType::Immutable);
        let dep = task(&config, "dep", &[], SourceType::Immutable);
        std::fs::create_dir_all(&root.install_path).unwrap();
        std::fs::create_dir_all(&dep.install_path).unwrap();
        let plan = plan_of(vec![root, dep], "root");

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(
            Scheduler::new().with_force(Force::ForRoot),
            &config,
            &plan,
            Arc::clone(&builder),
            reporter,
        )
        .await
        .unwrap();

        let started = builder.started_names();
        assert!(started.contains("root"));
        assert!(!started.contains("dep"));
    }

    #[tokio::test]
    async fn test_build_only_for_root_skips_root_commit() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let plan = plan_of(
            vec![
                task(&config, "root", &["dep"], SourceType::Transient),
                task(&config, "dep", &[], SourceType::Transient),
            ],
            "root",
        );

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(
            Scheduler::new().with_build_only(BuildOnly::ForRoot),
            &config,
            &plan,
            Arc::clone(&builder),
            reporter,
        )
        .await
        .unwrap();

        let commits = builder.commits.lock().unwrap().clone();
        assert_eq!(commits["root"], false);
        assert_eq!(commits["dep"], true);
    }

    #[tokio::test]
    async fn test_cancellation_before_dispatch() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let plan = plan_of(vec![task(&config, "root", &[], SourceType::Transient)], "root");

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = Scheduler::new()
            .run(&config, &plan, Arc::clone(&builder) as Arc<dyn Builder>, reporter, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EsyError::Cancelled));
        assert!(builder.events().is_empty());
    }

    #[tokio::test]
    async fn test_lock_contention_fails_after_retries() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let held = task(&config, "held", &[], SourceType::Transient);
        let lock_path = config.lock_path(held.source_type, &held.id);
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        std::fs::write(&lock_path, b"").unwrap();
        let plan = plan_of(vec![held], "held");

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        let err = run_plan(Scheduler::new(), &config, &plan, Arc::clone(&builder), reporter)
            .await
            .unwrap_err();

        assert!(matches!(err, EsyError::LockContention { .. }));
        assert!(builder.events().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_build() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let t = task(&config, "pkg", &[], SourceType::Transient);
        let lock_path = config.lock_path(t.source_type, &t.id);
        let plan = plan_of(vec![t], "pkg");

        let builder = Arc::new(FakeBuilder::default());
        let reporter = Arc::new(RecordingReporter::default());

        run_plan(Scheduler::new(), &config, &plan, builder, reporter).await.unwrap();

        assert!(!lock_path.exists());
    }
}
