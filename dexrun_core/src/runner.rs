use crate::architecture::Architecture;
use crate::config::{DexrunConfig, RunConfig};
use crate::device::Device;
use crate::executor::{Executor, ExecutorError, InterpreterBackend, OptimizingBackend};
use crate::listener::Listener;
use crate::result::ExecutionResult;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("At least one executor is required")]
    NoExecutors,

    #[error("Failed to write expected output to {path:?}: {source}")]
    ExpectedOutput {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How a program fared across all executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    HostVerificationFailed,
    TargetVerificationFailed,
    Timeouts,
    Divergence {
        /// The golden executor disagreed with itself on a rerun.
        self_divergent: bool,
        /// Exactly two outputs, each produced by a single, different
        /// architecture.
        architecture_split: bool,
    },
    Success,
}

/// Executors that produced the same output for a program.
pub struct OutputGroup<'a> {
    output: String,
    executors: Vec<&'a Executor>,
}

impl<'a> OutputGroup<'a> {
    pub fn new(output: String, executors: Vec<&'a Executor>) -> Self {
        Self { output, executors }
    }

    /// The shared output, one line per captured line.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }

    pub fn executors(&self) -> &[&'a Executor] {
        &self.executors
    }

    pub fn executor_names(&self) -> Vec<&str> {
        self.executors.iter().map(|e| e.name()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub skip_host_verify: bool,
    pub dump_output: bool,
    pub divergence_retry: u32,
    pub bisection_search: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for RunnerSettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            skip_host_verify: run.skip_host_verify,
            dump_output: run.dump_output,
            divergence_retry: run.divergence_retry,
            bisection_search: run.bisection_search,
        }
    }
}

/// Executors grouped by output, as indices into the runner's executors.
struct Grouping {
    key: String,
    output: String,
    members: Vec<usize>,
}

fn group_by_output(executors: &[Executor]) -> Vec<Grouping> {
    let mut groupings: Vec<Grouping> = Vec::new();
    for (idx, executor) in executors.iter().enumerate() {
        let Some(result) = executor.result() else {
            continue;
        };
        let key = result.flattened_output();
        match groupings.iter_mut().find(|g| g.key == key) {
            Some(grouping) => grouping.members.push(idx),
            None => groupings.push(Grouping {
                key,
                output: result.flattened_output_with_newlines(),
                members: vec![idx],
            }),
        }
    }
    groupings
}

fn output_groups<'a>(executors: &'a [Executor], groupings: &[Grouping]) -> Vec<OutputGroup<'a>> {
    groupings
        .iter()
        .map(|g| {
            OutputGroup::new(
                g.output.clone(),
                g.members.iter().map(|&i| &executors[i]).collect(),
            )
        })
        .collect()
}

fn is_architecture_split(executors: &[Executor], groupings: &[Grouping]) -> bool {
    if groupings.len() != 2 {
        return false;
    }
    let mut architectures: Vec<Architecture> = Vec::with_capacity(2);
    for grouping in groupings {
        let first = executors[grouping.members[0]].architecture();
        if grouping
            .members
            .iter()
            .any(|&i| executors[i].architecture() != first)
        {
            return false;
        }
        architectures.push(first);
    }
    architectures[0] != architectures[1]
}

/// Which group's output is taken as correct, and which executors get bisected.
#[derive(Debug, PartialEq, Eq)]
struct BisectionPlan {
    reference: usize,
    targets: Vec<usize>,
}

/// Only a two-way divergence is bisected. The reference is the group holding
/// a non-bisectable executor, or failing that the golden executor's group;
/// the bisectable executors of the other group are searched.
fn plan_bisection(executors: &[Executor], groupings: &[Grouping]) -> Option<BisectionPlan> {
    if groupings.len() != 2 {
        return None;
    }
    let reference = groupings
        .iter()
        .position(|g| g.members.iter().any(|&i| !executors[i].is_bisectable()))
        .or_else(|| groupings.iter().position(|g| g.members.contains(&0)))?;
    let targets: Vec<usize> = groupings[1 - reference]
        .members
        .iter()
        .copied()
        .filter(|&i| executors[i].is_bisectable())
        .collect();
    if targets.is_empty() {
        return None;
    }
    Some(BisectionPlan { reference, targets })
}

/// Program output as the program itself printed it, without the trailing
/// return code line.
fn expected_output_text(result: &ExecutionResult) -> String {
    let lines = result.output();
    let lines = match lines.split_last() {
        Some((last, rest)) if last.starts_with("RETURN CODE: ") => rest,
        _ => lines,
    };
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Runs every program on all executors and compares what they printed.
///
/// The first executor is the golden executor: it verifies programs on the
/// host, gets rerun to detect self-divergence, and is the one that tells the
/// device a program is no longer needed.
pub struct DifferentialRunner {
    executors: Vec<Executor>,
    settings: RunnerSettings,
}

impl DifferentialRunner {
    pub fn new(executors: Vec<Executor>, settings: RunnerSettings) -> Result<Self, RunnerError> {
        if executors.is_empty() {
            return Err(RunnerError::NoExecutors);
        }
        Ok(Self {
            executors,
            settings,
        })
    }

    /// One executor per enabled backend for every enabled architecture,
    /// optimizing before interpreter, 64-bit before 32-bit.
    pub fn from_config(config: &DexrunConfig, device: Rc<Device>) -> Result<Self, RunnerError> {
        let executor_settings = config.executor_settings();
        let architectures = config.effective_architectures();
        let mut executors = Vec::new();
        for architecture in Architecture::ALL {
            if !architectures.contains(&architecture) {
                continue;
            }
            if config.executors.optimizing {
                executors.push(Executor::new(
                    Box::new(OptimizingBackend),
                    architecture,
                    Rc::clone(&device),
                    &executor_settings,
                )?);
            }
            if config.executors.interpreter {
                executors.push(Executor::new(
                    Box::new(InterpreterBackend),
                    architecture,
                    Rc::clone(&device),
                    &executor_settings,
                )?);
            }
        }
        for executor in &executors {
            log::info!(
                "Executor: {} (timeout {}s)",
                executor.name(),
                executor.timeout_secs()
            );
        }
        Self::new(executors, RunnerSettings::from(&config.run))
    }

    pub fn executors(&self) -> &[Executor] {
        &self.executors
    }

    pub fn golden(&self) -> &Executor {
        &self.executors[0]
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Runs one program and reports the outcome to `listener`.
    ///
    /// An `Err` means the tool itself cannot go on (a failed push, a process
    /// that cannot be spawned); everything about the program goes into the
    /// returned verdict.
    pub fn run_program(
        &mut self,
        program: &str,
        listener: &mut dyn Listener,
    ) -> Result<Verdict, RunnerError> {
        listener.handle_program_started(program);
        let verdict = self.execute_and_analyse(program, listener);
        self.executors[0].finished_with_program_on_device();
        verdict
    }

    fn execute_and_analyse(
        &mut self,
        program: &str,
        listener: &mut dyn Listener,
    ) -> Result<Verdict, RunnerError> {
        let on_host = self.executors[0].device().is_host();
        if !self.settings.skip_host_verify && !on_host {
            if !self.executors[0].verify_on_host(program, listener)? {
                return Ok(Verdict::HostVerificationFailed);
            }
            listener.handle_successful_host_verification();
        }

        for executor in &mut self.executors {
            executor.reset();
            executor.prepare_program_for_execution(program)?;
            executor.execute(program)?;
            if !executor.did_target_verify() {
                log::debug!("{} rejected {program}", executor.name());
                listener.handle_failed_target_verification();
                return Ok(Verdict::TargetVerificationFailed);
            }
        }

        listener.handle_successfully_executed_program(program);
        self.analyse_results(program, listener)
    }

    fn analyse_results(
        &mut self,
        program: &str,
        listener: &mut dyn Listener,
    ) -> Result<Verdict, RunnerError> {
        let (timed_out, completed): (Vec<&Executor>, Vec<&Executor>) = self
            .executors
            .iter()
            .partition(|e| e.result().is_some_and(ExecutionResult::is_timeout));
        if !timed_out.is_empty() {
            listener.handle_timeouts(&timed_out, &completed);
            return Ok(Verdict::Timeouts);
        }

        if self.settings.dump_output {
            for executor in &self.executors {
                if let Some(result) = executor.result() {
                    listener.handle_dump_output(&result.flattened_output_with_newlines(), executor);
                }
            }
        }

        let groupings = group_by_output(&self.executors);
        let groups = output_groups(&self.executors, &groupings);
        if groupings.len() <= 1 {
            listener.handle_success(&groups);
            return Ok(Verdict::Success);
        }
        listener.handle_divergences(&groups);
        drop(groups);

        if self.golden_is_self_divergent(program)? {
            listener.handle_self_divergence();
            return Ok(Verdict::Divergence {
                self_divergent: true,
                architecture_split: false,
            });
        }

        let architecture_split = is_architecture_split(&self.executors, &groupings);
        if architecture_split {
            listener.handle_architecture_split();
        }

        if self.settings.bisection_search {
            if let Some(plan) = plan_bisection(&self.executors, &groupings) {
                self.run_bisection(program, &groupings, &plan, listener)?;
            }
        }

        Ok(Verdict::Divergence {
            self_divergent: false,
            architecture_split,
        })
    }

    /// Reruns the golden executor and reports whether its output changed
    /// between runs.
    fn golden_is_self_divergent(&mut self, program: &str) -> Result<bool, RunnerError> {
        let runs = self.settings.divergence_retry + 1;
        let golden = &mut self.executors[0];
        let mut seen: Option<String> = None;
        for _ in 0..runs {
            golden.reset();
            let output = golden.execute(program)?.flattened_output();
            match &seen {
                None => seen = Some(output),
                Some(previous) if *previous != output => return Ok(true),
                Some(_) => {}
            }
        }
        Ok(false)
    }

    fn run_bisection(
        &mut self,
        program: &str,
        groupings: &[Grouping],
        plan: &BisectionPlan,
        listener: &mut dyn Listener,
    ) -> Result<(), RunnerError> {
        let reference = &self.executors[groupings[plan.reference].members[0]];
        let Some(reference_result) = reference.result() else {
            return Ok(());
        };
        let expected_file = format!("{program}_expected_output");
        std::fs::write(&expected_file, expected_output_text(reference_result)).map_err(
            |source| RunnerError::ExpectedOutput {
                path: PathBuf::from(&expected_file),
                source,
            },
        )?;

        for &idx in &plan.targets {
            let executor = &mut self.executors[idx];
            let log_file = format!("{program}_{}_bisection.log", file_safe(executor.name()));
            log::info!("Running bisection search for {}", executor.name());
            let result = executor.run_bisection_search(program, &expected_file, &log_file)?;
            listener.handle_bisection_search(&self.executors[idx], &result);
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        for executor in &mut self.executors {
            executor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_output_drops_return_code_trailer() {
        let result = ExecutionResult::captured(0, vec!["a".into(), "b".into()], vec![]);
        assert_eq!(expected_output_text(&result), "a\nb\n");
        let bare = ExecutionResult::uncaptured(0);
        assert_eq!(expected_output_text(&bare), "\n");
    }

    #[test]
    fn file_safe_names() {
        assert_eq!(file_safe("ARM64 Optimizing Backend"), "ARM64_Optimizing_Backend");
        assert_eq!(file_safe("x86-64 Interpreter"), "x86_64_Interpreter");
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::executor::{Backend, ExecutorSettings};
        use crate::listener::ConsoleListener;
        use crate::test_support::{HostFixture, ScriptBackend, write_script};

        /// Records every event as a short string.
        #[derive(Default)]
        struct Events(Vec<String>);

        impl Listener for Events {
            fn handle_program_started(&mut self, program: &str) {
                self.0.push(format!("started {program}"));
            }
            fn handle_failed_target_verification(&mut self) {
                self.0.push("target verification failed".into());
            }
            fn handle_successfully_executed_program(&mut self, _program: &str) {
                self.0.push("executed".into());
            }
            fn handle_timeouts(&mut self, timed_out: &[&Executor], did_not_time_out: &[&Executor]) {
                self.0.push(format!(
                    "timeouts {} / {}",
                    timed_out.len(),
                    did_not_time_out.len()
                ));
            }
            fn handle_divergences(&mut self, groups: &[OutputGroup<'_>]) {
                let names: Vec<String> =
                    groups.iter().map(|g| g.executor_names().join("+")).collect();
                self.0.push(format!("divergence {}", names.join(" | ")));
            }
            fn handle_self_divergence(&mut self) {
                self.0.push("self divergence".into());
            }
            fn handle_architecture_split(&mut self) {
                self.0.push("architecture split".into());
            }
            fn handle_success(&mut self, groups: &[OutputGroup<'_>]) {
                self.0.push(format!("success {}", groups[0].executors().len()));
            }
            fn handle_dump_output(&mut self, output: &str, executor: &Executor) {
                self.0.push(format!("dump {}: {}", executor.name(), output.trim_end()));
            }
            fn handle_bisection_search(&mut self, executor: &Executor, result: &ExecutionResult) {
                self.0.push(format!(
                    "bisection {}: {}",
                    executor.name(),
                    result.output().join(",")
                ));
            }
        }

        struct Harness {
            fixture: HostFixture,
            device: Rc<Device>,
        }

        impl Harness {
            fn new() -> Self {
                let fixture = HostFixture::new();
                let device = Rc::new(fixture.device());
                Self { fixture, device }
            }

            fn executor(&self, backend: ScriptBackend, architecture: Architecture) -> Executor {
                self.executor_with(backend, architecture, &ExecutorSettings::default())
            }

            fn executor_with(
                &self,
                backend: ScriptBackend,
                architecture: Architecture,
                settings: &ExecutorSettings,
            ) -> Executor {
                Executor::with_test_location(
                    Box::new(backend) as Box<dyn Backend>,
                    architecture,
                    Rc::clone(&self.device),
                    settings,
                    self.fixture.root.path().to_string_lossy().into_owned(),
                )
                .unwrap()
            }

            fn runner(&self, executors: Vec<Executor>, settings: RunnerSettings) -> DifferentialRunner {
                DifferentialRunner::new(executors, settings).unwrap()
            }

            fn counter_script(&self) -> String {
                let counter = self.fixture.root.path().join("golden-runs");
                format!(
                    "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; echo run $n",
                    c = counter.display()
                )
            }
        }

        fn quick_settings() -> RunnerSettings {
            RunnerSettings {
                divergence_retry: 2,
                ..Default::default()
            }
        }

        #[test]
        fn agreeing_executors_succeed() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::labelled("A", "echo 42"), Architecture::X86),
                    harness.executor(ScriptBackend::labelled("B", "echo 42"), Architecture::X86_64),
                ],
                quick_settings(),
            );
            let mut events = Events::default();
            assert_eq!(runner.run_program("p.dex", &mut events).unwrap(), Verdict::Success);
            assert_eq!(events.0, vec!["started p.dex", "executed", "success 2"]);
        }

        #[test]
        fn divergence_along_architectures_is_a_split() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::labelled("A", "echo 1"), Architecture::Arm64),
                    harness.executor(ScriptBackend::labelled("B", "echo 1"), Architecture::Arm64),
                    harness.executor(ScriptBackend::labelled("A", "echo 2"), Architecture::Arm),
                    harness.executor(ScriptBackend::labelled("B", "echo 2"), Architecture::Arm),
                ],
                quick_settings(),
            );
            let mut events = Events::default();
            let verdict = runner.run_program("p.dex", &mut events).unwrap();
            assert_eq!(
                verdict,
                Verdict::Divergence {
                    self_divergent: false,
                    architecture_split: true
                }
            );
            assert_eq!(
                events.0,
                vec![
                    "started p.dex",
                    "executed",
                    "divergence ARM64 A+ARM64 B | ARM A+ARM B",
                    "architecture split",
                ]
            );
        }

        #[test]
        fn divergence_within_an_architecture_is_not_a_split() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::labelled("A", "echo 1"), Architecture::X86),
                    harness.executor(ScriptBackend::labelled("B", "echo 2"), Architecture::X86),
                    harness.executor(ScriptBackend::labelled("C", "echo 2"), Architecture::X86_64),
                ],
                quick_settings(),
            );
            let mut events = Events::default();
            let verdict = runner.run_program("p.dex", &mut events).unwrap();
            assert_eq!(
                verdict,
                Verdict::Divergence {
                    self_divergent: false,
                    architecture_split: false
                }
            );
            assert!(!events.0.contains(&"architecture split".to_string()));
        }

        #[test]
        fn three_outputs_are_never_a_split() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::new("echo 1"), Architecture::Arm64),
                    harness.executor(ScriptBackend::new("echo 2"), Architecture::Arm),
                    harness.executor(ScriptBackend::new("echo 3"), Architecture::X86),
                ],
                quick_settings(),
            );
            let verdict = runner.run_program("p.dex", &mut Events::default()).unwrap();
            assert_eq!(
                verdict,
                Verdict::Divergence {
                    self_divergent: false,
                    architecture_split: false
                }
            );
        }

        #[test]
        fn unstable_golden_executor_is_self_divergent() {
            let harness = Harness::new();
            let golden = harness.counter_script();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::labelled("Golden", &golden), Architecture::Arm64),
                    harness.executor(ScriptBackend::labelled("Other", "echo run 1"), Architecture::Arm),
                    harness.executor(ScriptBackend::labelled("Third", "echo run 1"), Architecture::Arm),
                ],
                quick_settings(),
            );
            let mut events = Events::default();
            let verdict = runner.run_program("p.dex", &mut events).unwrap();
            // The first pass agrees; the divergence only shows on the next program.
            assert_eq!(verdict, Verdict::Success);

            let verdict = runner.run_program("p.dex", &mut events).unwrap();
            assert_eq!(
                verdict,
                Verdict::Divergence {
                    self_divergent: true,
                    architecture_split: false
                }
            );
            assert_eq!(events.0.last().map(String::as_str), Some("self divergence"));
        }

        #[test]
        fn stable_golden_runs_retry_plus_one_times() {
            let harness = Harness::new();
            let counter = harness.fixture.root.path().join("golden-runs");
            let golden = format!(
                "n=$(cat {c} 2>/dev/null || echo 0); echo $((n+1)) > {c}; echo stable",
                c = counter.display()
            );
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::new(&golden), Architecture::X86),
                    harness.executor(ScriptBackend::new("echo other"), Architecture::X86),
                ],
                RunnerSettings {
                    divergence_retry: 3,
                    ..Default::default()
                },
            );
            runner.run_program("p.dex", &mut Events::default()).unwrap();
            let runs = std::fs::read_to_string(&counter).unwrap();
            assert_eq!(runs.trim(), "5", "one regular run plus retry + 1 reruns");
        }

        #[test]
        fn target_verification_failure_stops_the_run() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::new("echo ok"), Architecture::X86),
                    harness.executor(
                        ScriptBackend::new("echo java.lang.VerifyError: bad >&2"),
                        Architecture::X86,
                    ),
                    harness.executor(ScriptBackend::new("echo ok"), Architecture::X86),
                ],
                quick_settings(),
            );
            let mut events = Events::default();
            let verdict = runner.run_program("p.dex", &mut events).unwrap();
            assert_eq!(verdict, Verdict::TargetVerificationFailed);
            assert_eq!(events.0, vec!["started p.dex", "target verification failed"]);
            assert!(runner.executors()[2].result().is_none());
        }

        #[test]
        fn timeouts_skip_divergence_analysis() {
            let harness = Harness::new();
            let short = ExecutorSettings {
                short_timeouts: true,
                ..Default::default()
            };
            let mut runner = harness.runner(
                vec![
                    harness.executor_with(ScriptBackend::new("exec sleep 30"), Architecture::X86, &short),
                    harness.executor_with(ScriptBackend::new("echo done"), Architecture::X86, &short),
                ],
                quick_settings(),
            );
            let mut events = Events::default();
            let verdict = runner.run_program("p.dex", &mut events).unwrap();
            assert_eq!(verdict, Verdict::Timeouts);
            assert_eq!(events.0.last().map(String::as_str), Some("timeouts 1 / 1"));
        }

        #[test]
        fn dump_output_reports_every_executor() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::labelled("A", "echo hi"), Architecture::X86),
                    harness.executor(ScriptBackend::labelled("B", "echo hi"), Architecture::X86),
                ],
                RunnerSettings {
                    dump_output: true,
                    ..quick_settings()
                },
            );
            let mut events = Events::default();
            runner.run_program("p.dex", &mut events).unwrap();
            assert!(events.0.contains(&"dump x86 A: hi\nRETURN CODE: 0".to_string()));
            assert!(events.0.contains(&"dump x86 B: hi\nRETURN CODE: 0".to_string()));
        }

        #[test]
        fn console_listener_counts_outcomes() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::new("echo 1"), Architecture::X86),
                    harness.executor(ScriptBackend::new("echo 1"), Architecture::X86),
                ],
                quick_settings(),
            );
            let mut console = ConsoleListener::new(true);
            runner.run_program("a.dex", &mut console).unwrap();
            runner.run_program("b.dex", &mut console).unwrap();
            console.handle_summary().unwrap();
            assert_eq!(console.counts().programs, 2);
            assert_eq!(console.counts().executed, 2);
            assert_eq!(console.counts().successes, 2);
            assert_eq!(console.counts().divergences, 0);
        }

        #[test]
        fn bisection_plan_picks_reference_and_targets() {
            let harness = Harness::new();
            let executors = vec![
                harness.executor(ScriptBackend::new("echo wrong").bisectable(), Architecture::Arm64),
                harness.executor(ScriptBackend::new("echo right"), Architecture::Arm64),
                harness.executor(ScriptBackend::new("echo wrong").bisectable(), Architecture::Arm),
            ];
            let mut runner = harness.runner(executors, quick_settings());
            runner.run_program("p.dex", &mut Events::default()).unwrap();

            let groupings = group_by_output(runner.executors());
            assert_eq!(groupings.len(), 2);
            assert_eq!(
                plan_bisection(runner.executors(), &groupings),
                Some(BisectionPlan {
                    reference: 1,
                    targets: vec![0, 2]
                })
            );
        }

        #[test]
        fn bisection_plan_needs_a_bisectable_target() {
            let harness = Harness::new();
            let mut runner = harness.runner(
                vec![
                    harness.executor(ScriptBackend::new("echo 1"), Architecture::X86),
                    harness.executor(ScriptBackend::new("echo 2"), Architecture::X86),
                ],
                quick_settings(),
            );
            runner.run_program("p.dex", &mut Events::default()).unwrap();
            let groupings = group_by_output(runner.executors());
            assert_eq!(plan_bisection(runner.executors(), &groupings), None);
        }

        #[test]
        fn bisection_search_runs_against_reference_output() {
            let harness = Harness::new();
            let root = harness.fixture.root.path();
            let recorded_args = root.join("bisect-args");
            let script = write_script(
                root,
                "bisect.sh",
                &format!(
                    "for arg in \"$@\"; do echo \"$arg\"; done > '{}'\necho searching\n",
                    recorded_args.display()
                ),
            );
            let settings = ExecutorSettings {
                bisection_script: script.to_string_lossy().into_owned(),
                ..Default::default()
            };
            let executors = vec![
                harness.executor_with(
                    ScriptBackend::labelled("Ref", "echo right"),
                    Architecture::X86,
                    &settings,
                ),
                harness.executor_with(
                    ScriptBackend::labelled("Opt", "false").bisectable(),
                    Architecture::X86,
                    &settings,
                ),
            ];
            let mut runner = harness.runner(
                executors,
                RunnerSettings {
                    bisection_search: true,
                    ..quick_settings()
                },
            );
            let program = root.join("p.dex").to_string_lossy().into_owned();
            let mut events = Events::default();
            assert_eq!(
                runner.run_program(&program, &mut events).unwrap(),
                Verdict::Divergence {
                    self_divergent: false,
                    architecture_split: false
                }
            );

            let expected_file = format!("{program}_expected_output");
            assert_eq!(std::fs::read_to_string(&expected_file).unwrap(), "right\n");
            assert_eq!(
                std::fs::read_to_string(&recorded_args)
                    .unwrap()
                    .lines()
                    .collect::<Vec<_>>(),
                vec![
                    "--raw-cmd".to_string(),
                    "sh -c false".to_string(),
                    format!("--expected-output={expected_file}"),
                    format!("--logfile={program}_x86_Opt_bisection.log"),
                    "--timeout=10".to_string(),
                ]
            );
            assert!(events.0.contains(&"divergence x86 Ref | x86 Opt".to_string()));
            assert_eq!(
                events.0.last().map(String::as_str),
                Some("bisection x86 Opt: searching,RETURN CODE: 0")
            );
        }

        #[test]
        fn empty_executor_list_is_rejected() {
            assert!(matches!(
                DifferentialRunner::new(Vec::new(), RunnerSettings::default()),
                Err(RunnerError::NoExecutors)
            ));
        }

        #[test]
        fn from_config_orders_executors() {
            let harness = Harness::new();
            let mut config = DexrunConfig::default();
            config.device.host = true;
            config.executors.interpreter = true;
            config.executors.optimizing = true;
            config.executors.architectures =
                [Architecture::X86_64].into_iter().collect();
            let runner = DifferentialRunner::from_config(&config, Rc::clone(&harness.device)).unwrap();
            let names: Vec<&str> = runner.executors().iter().map(|e| e.name()).collect();
            assert_eq!(
                names,
                vec![
                    "x86-64 Optimizing Backend",
                    "x86-64 Interpreter",
                    "x86 Optimizing Backend",
                    "x86 Interpreter",
                ]
            );
            assert_eq!(runner.golden().name(), "x86-64 Optimizing Backend");
            assert_eq!(runner.settings().divergence_retry, 10);
        }
    }
}
