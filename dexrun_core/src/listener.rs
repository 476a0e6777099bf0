use crate::executor::Executor;
use crate::result::ExecutionResult;
use crate::runner::OutputGroup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A `Listener` is told about every per-program outcome of a differential run.
///
/// Per-program failures (a crashing verifier, a timeout, diverging outputs)
/// are never errors: they are reported here and the run moves on to the
/// next program. Every method defaults to doing nothing, so implementations
/// only override the events they care about.
pub trait Listener {
    /// A new program is about to be verified and executed.
    fn handle_program_started(&mut self, _program: &str) {}

    fn handle_successful_host_verification(&mut self) {}

    /// The host-side compiler aborted while verifying the program.
    fn handle_host_verification_sigabort(&mut self, _result: &ExecutionResult) {}

    /// The host-side compiler rejected the program.
    fn handle_failed_host_verification(&mut self, _result: &ExecutionResult) {}

    /// One line of verifier output, with its log prefix stripped. Only sent
    /// when verification dumping is enabled.
    fn handle_dump_verify(&mut self, _line: &str) {}

    /// A backend on the target refused to run the program.
    fn handle_failed_target_verification(&mut self) {}

    /// Every backend ran the program; its results are about to be compared.
    fn handle_successfully_executed_program(&mut self, _program: &str) {}

    fn handle_timeouts(&mut self, _timed_out: &[&Executor], _did_not_time_out: &[&Executor]) {}

    /// The backends disagreed. Each group holds one distinct output and the
    /// executors that produced it.
    fn handle_divergences(&mut self, _groups: &[OutputGroup<'_>]) {}

    /// The golden executor disagreed with itself across repeated runs.
    fn handle_self_divergence(&mut self) {}

    /// The divergence lines up exactly with two architectures.
    fn handle_architecture_split(&mut self) {}

    fn handle_success(&mut self, _groups: &[OutputGroup<'_>]) {}

    fn handle_dump_output(&mut self, _output: &str, _executor: &Executor) {}

    fn handle_bisection_search(&mut self, _executor: &Executor, _result: &ExecutionResult) {}

    /// Called once when the session ends.
    fn handle_summary(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Tallies of the outcomes a [`ConsoleListener`] has seen.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub programs: u64,
    pub host_verified: u64,
    pub host_verification_failures: u64,
    pub host_verification_sigaborts: u64,
    pub target_verification_failures: u64,
    pub executed: u64,
    pub timeouts: u64,
    pub divergences: u64,
    pub self_divergences: u64,
    pub architecture_splits: u64,
    pub successes: u64,
    pub bisections: u64,
}

/// Reports progress through the `log` facade and prints a summary at the end.
#[derive(Debug, Default)]
pub struct ConsoleListener {
    counts: OutcomeCounts,
    quiet: bool,
}

impl ConsoleListener {
    pub fn new(quiet: bool) -> Self {
        Self {
            counts: OutcomeCounts::default(),
            quiet,
        }
    }

    pub fn counts(&self) -> &OutcomeCounts {
        &self.counts
    }
}

impl Listener for ConsoleListener {
    fn handle_program_started(&mut self, program: &str) {
        self.counts.programs += 1;
        if !self.quiet {
            log::info!("[{}] Running {program}", self.counts.programs);
        }
    }

    fn handle_successful_host_verification(&mut self) {
        self.counts.host_verified += 1;
    }

    fn handle_host_verification_sigabort(&mut self, result: &ExecutionResult) {
        self.counts.host_verification_sigaborts += 1;
        log::warn!(
            "Host verification aborted (return code {})",
            result.return_value()
        );
    }

    fn handle_failed_host_verification(&mut self, _result: &ExecutionResult) {
        self.counts.host_verification_failures += 1;
        log::warn!("Program failed host verification");
    }

    fn handle_dump_verify(&mut self, line: &str) {
        log::info!("verify: {line}");
    }

    fn handle_failed_target_verification(&mut self) {
        self.counts.target_verification_failures += 1;
        log::warn!("Program failed verification on the target");
    }

    fn handle_successfully_executed_program(&mut self, _program: &str) {
        self.counts.executed += 1;
    }

    fn handle_timeouts(&mut self, timed_out: &[&Executor], _did_not_time_out: &[&Executor]) {
        self.counts.timeouts += 1;
        let names: Vec<&str> = timed_out.iter().map(|e| e.name()).collect();
        log::warn!("Timed out: {}", names.join(", "));
    }

    fn handle_divergences(&mut self, groups: &[OutputGroup<'_>]) {
        self.counts.divergences += 1;
        log::warn!("Divergence across {} distinct outputs", groups.len());
        for group in groups {
            log::warn!("  {}", group.executor_names().join(", "));
        }
    }

    fn handle_self_divergence(&mut self) {
        self.counts.self_divergences += 1;
        log::warn!("Golden executor is self-divergent, ignoring divergence");
    }

    fn handle_architecture_split(&mut self) {
        self.counts.architecture_splits += 1;
        log::warn!("Divergence is an architecture split");
    }

    fn handle_success(&mut self, _groups: &[OutputGroup<'_>]) {
        self.counts.successes += 1;
    }

    fn handle_dump_output(&mut self, output: &str, executor: &Executor) {
        log::info!("Output of {}:\n{output}", executor.name());
    }

    fn handle_bisection_search(&mut self, executor: &Executor, result: &ExecutionResult) {
        self.counts.bisections += 1;
        log::info!(
            "Bisection search for {} finished with return code {}",
            executor.name(),
            result.return_value()
        );
    }

    fn handle_summary(&mut self) -> Result<(), anyhow::Error> {
        let c = &self.counts;
        log::info!(
            "Programs: {}, Executed: {}, Successes: {}, Divergences: {} (self-divergent: {}, architecture splits: {}), Timeouts: {}",
            c.programs,
            c.executed,
            c.successes,
            c.divergences,
            c.self_divergences,
            c.architecture_splits,
            c.timeouts
        );
        log::info!(
            "Host verification: {} passed, {} failed, {} aborted; target verification failures: {}",
            c.host_verified,
            c.host_verification_failures,
            c.host_verification_sigaborts,
            c.target_verification_failures
        );
        Ok(())
    }
}

/// Appends a plain-text report of every notable outcome to a file.
pub struct ReportListener {
    path: PathBuf,
    writer: BufWriter<File>,
    current_program: String,
}

impl ReportListener {
    pub fn create(path: &Path) -> Result<Self, anyhow::Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open report file {:?}: {}", path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            current_program: String::new(),
        })
    }

    fn line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.writer, "{text}") {
            log::error!("Failed to write report file {:?}: {}", self.path, e);
        }
    }

    fn lines(&mut self, prefix: &str, lines: &[String]) {
        for line in lines {
            self.line(&format!("{prefix}{line}"));
        }
    }
}

impl Listener for ReportListener {
    fn handle_program_started(&mut self, program: &str) {
        self.current_program = program.to_string();
        self.line(&format!("=== {program}"));
    }

    fn handle_host_verification_sigabort(&mut self, result: &ExecutionResult) {
        self.line("HOST VERIFICATION SIGABORT");
        self.lines("  stderr: ", result.error());
    }

    fn handle_failed_host_verification(&mut self, result: &ExecutionResult) {
        self.line("HOST VERIFICATION FAILED");
        self.lines("  stdout: ", result.output());
        self.lines("  stderr: ", result.error());
    }

    fn handle_dump_verify(&mut self, line: &str) {
        self.line(&format!("  verify: {line}"));
    }

    fn handle_failed_target_verification(&mut self) {
        self.line("TARGET VERIFICATION FAILED");
    }

    fn handle_timeouts(&mut self, timed_out: &[&Executor], did_not_time_out: &[&Executor]) {
        self.line("TIMEOUTS");
        for executor in timed_out {
            self.line(&format!("  timed out: {}", executor.name()));
        }
        for executor in did_not_time_out {
            self.line(&format!("  completed: {}", executor.name()));
        }
    }

    fn handle_divergences(&mut self, groups: &[OutputGroup<'_>]) {
        self.line(&format!("DIVERGENCE in {}", self.current_program));
        for (idx, group) in groups.iter().enumerate() {
            self.line(&format!(
                "  output {idx} from: {}",
                group.executor_names().join(", ")
            ));
            for line in group.output_lines() {
                self.line(&format!("    {line}"));
            }
        }
    }

    fn handle_self_divergence(&mut self) {
        self.line("  (self-divergent)");
    }

    fn handle_architecture_split(&mut self) {
        self.line("  (architecture split)");
    }

    fn handle_success(&mut self, _groups: &[OutputGroup<'_>]) {
        self.line("SUCCESS");
    }

    fn handle_dump_output(&mut self, output: &str, executor: &Executor) {
        self.line(&format!("OUTPUT of {}:", executor.name()));
        for line in output.lines() {
            self.line(&format!("  {line}"));
        }
    }

    fn handle_bisection_search(&mut self, executor: &Executor, result: &ExecutionResult) {
        self.line(&format!("BISECTION SEARCH for {}", executor.name()));
        self.lines("  ", result.output());
    }

    fn handle_summary(&mut self) -> Result<(), anyhow::Error> {
        self.writer
            .flush()
            .map_err(|e| anyhow::anyhow!("Failed to flush report file {:?}: {}", self.path, e))
    }
}

/// One divergent program remembered by [`UniqueProgramTracker`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UniqueProgramRecord {
    /// Path of the first program seen with this content.
    pub program: String,
    /// Executor names per output group, each group sorted, groups sorted.
    pub signature: Vec<Vec<String>>,
    /// How many times a program with this content diverged.
    pub occurrences: u64,
}

/// Remembers divergent programs by the MD5 of their contents, so repeated
/// finds of the same program are not reported as new. The table is kept in a
/// JSON file between sessions.
pub struct UniqueProgramTracker {
    db_path: PathBuf,
    records: BTreeMap<String, UniqueProgramRecord>,
    current_program: Option<String>,
    new_this_session: u64,
}

impl UniqueProgramTracker {
    /// Opens the database at `db_path`, starting empty if it does not exist.
    pub fn open(db_path: &Path) -> Result<Self, anyhow::Error> {
        let records = if db_path.exists() {
            let content = fs::read_to_string(db_path).map_err(|e| {
                anyhow::anyhow!("Failed to read unique program database {:?}: {}", db_path, e)
            })?;
            serde_json::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse unique program database {:?}: {}", db_path, e)
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            db_path: db_path.to_path_buf(),
            records,
            current_program: None,
            new_this_session: 0,
        })
    }

    pub fn records(&self) -> &BTreeMap<String, UniqueProgramRecord> {
        &self.records
    }

    pub fn new_this_session(&self) -> u64 {
        self.new_this_session
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        let content = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.db_path, content).map_err(|e| {
            anyhow::anyhow!(
                "Failed to write unique program database {:?}: {}",
                self.db_path,
                e
            )
        })
    }
}

fn divergence_signature(groups: &[OutputGroup<'_>]) -> Vec<Vec<String>> {
    let mut signature: Vec<Vec<String>> = groups
        .iter()
        .map(|group| {
            let mut names: Vec<String> = group
                .executor_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            names.sort();
            names
        })
        .collect();
    signature.sort();
    signature
}

impl Listener for UniqueProgramTracker {
    fn handle_program_started(&mut self, program: &str) {
        self.current_program = Some(program.to_string());
    }

    fn handle_divergences(&mut self, groups: &[OutputGroup<'_>]) {
        let Some(program) = self.current_program.clone() else {
            return;
        };
        let contents = match fs::read(&program) {
            Ok(contents) => contents,
            Err(e) => {
                log::error!("Cannot hash divergent program {program}: {e}");
                return;
            }
        };
        let hash = format!("{:x}", md5::compute(&contents));
        match self.records.get_mut(&hash) {
            Some(record) => {
                record.occurrences += 1;
                log::info!("{program} is a repeat of {}", record.program);
            }
            None => {
                self.new_this_session += 1;
                self.records.insert(
                    hash,
                    UniqueProgramRecord {
                        program,
                        signature: divergence_signature(groups),
                        occurrences: 1,
                    },
                );
            }
        }
    }

    fn handle_summary(&mut self) -> Result<(), anyhow::Error> {
        log::info!(
            "Unique divergent programs: {} new, {} known",
            self.new_this_session,
            self.records.len()
        );
        self.save()
    }
}

/// Forwards every event to each of its listeners, in order.
#[derive(Default)]
pub struct MultiplexListener {
    listeners: Vec<Box<dyn Listener>>,
}

impl MultiplexListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl Listener for MultiplexListener {
    fn handle_program_started(&mut self, program: &str) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_program_started(program));
    }

    fn handle_successful_host_verification(&mut self) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_successful_host_verification());
    }

    fn handle_host_verification_sigabort(&mut self, result: &ExecutionResult) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_host_verification_sigabort(result));
    }

    fn handle_failed_host_verification(&mut self, result: &ExecutionResult) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_failed_host_verification(result));
    }

    fn handle_dump_verify(&mut self, line: &str) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_dump_verify(line));
    }

    fn handle_failed_target_verification(&mut self) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_failed_target_verification());
    }

    fn handle_successfully_executed_program(&mut self, program: &str) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_successfully_executed_program(program));
    }

    fn handle_timeouts(&mut self, timed_out: &[&Executor], did_not_time_out: &[&Executor]) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_timeouts(timed_out, did_not_time_out));
    }

    fn handle_divergences(&mut self, groups: &[OutputGroup<'_>]) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_divergences(groups));
    }

    fn handle_self_divergence(&mut self) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_self_divergence());
    }

    fn handle_architecture_split(&mut self) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_architecture_split());
    }

    fn handle_success(&mut self, groups: &[OutputGroup<'_>]) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_success(groups));
    }

    fn handle_dump_output(&mut self, output: &str, executor: &Executor) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_dump_output(output, executor));
    }

    fn handle_bisection_search(&mut self, executor: &Executor, result: &ExecutionResult) {
        self.listeners
            .iter_mut()
            .for_each(|l| l.handle_bisection_search(executor, result));
    }

    /// Every listener gets its summary call; the first failure is returned.
    fn handle_summary(&mut self) -> Result<(), anyhow::Error> {
        let mut first_error = None;
        for listener in self.listeners.iter_mut() {
            if let Err(e) = listener.handle_summary() {
                log::error!("Listener summary failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn groups(outputs: &[&str]) -> Vec<OutputGroup<'static>> {
        outputs
            .iter()
            .map(|o| OutputGroup::new(o.to_string(), Vec::new()))
            .collect()
    }

    #[test]
    fn console_listener_tallies_events() {
        let mut console = ConsoleListener::new(false);
        console.handle_program_started("a.dex");
        console.handle_successful_host_verification();
        console.handle_successfully_executed_program("a.dex");
        console.handle_divergences(&groups(&["1\n", "2\n"]));
        console.handle_architecture_split();
        console.handle_program_started("b.dex");
        console.handle_failed_host_verification(&ExecutionResult::uncaptured(1));
        console.handle_host_verification_sigabort(&ExecutionResult::uncaptured(134));
        console.handle_summary().unwrap();

        let counts = console.counts();
        assert_eq!(counts.programs, 2);
        assert_eq!(counts.host_verified, 1);
        assert_eq!(counts.executed, 1);
        assert_eq!(counts.divergences, 1);
        assert_eq!(counts.architecture_splits, 1);
        assert_eq!(counts.host_verification_failures, 1);
        assert_eq!(counts.host_verification_sigaborts, 1);
        assert_eq!(counts.successes, 0);
    }

    #[test]
    fn report_listener_appends_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log");

        let mut report = ReportListener::create(&path).unwrap();
        report.handle_program_started("a.dex");
        report.handle_divergences(&groups(&["one\n", "two\nthree\n"]));
        report.handle_self_divergence();
        report.handle_summary().unwrap();
        drop(report);

        let mut report = ReportListener::create(&path).unwrap();
        report.handle_program_started("b.dex");
        report.handle_failed_host_verification(&ExecutionResult::captured(
            1,
            vec![],
            vec!["Verification error in Main".to_string()],
        ));
        report.handle_summary().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "=== a.dex",
                "DIVERGENCE in a.dex",
                "  output 0 from: ",
                "    one",
                "  output 1 from: ",
                "    two",
                "    three",
                "  (self-divergent)",
                "=== b.dex",
                "HOST VERIFICATION FAILED",
                "  stdout: RETURN CODE: 1",
                "  stderr: Verification error in Main",
            ]
        );
    }

    #[test]
    fn unique_tracker_counts_repeats_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("unique_progs.db");
        let first = dir.path().join("first.dex");
        let copy = dir.path().join("copy.dex");
        let other = dir.path().join("other.dex");
        fs::write(&first, b"dex\n035\0same").unwrap();
        fs::write(&copy, b"dex\n035\0same").unwrap();
        fs::write(&other, b"dex\n035\0different").unwrap();

        let mut tracker = UniqueProgramTracker::open(&db).unwrap();
        for program in [&first, &copy, &other] {
            tracker.handle_program_started(program.to_str().unwrap());
            tracker.handle_divergences(&groups(&["a\n", "b\n"]));
        }
        assert_eq!(tracker.new_this_session(), 2);
        assert_eq!(tracker.records().len(), 2);
        let hash = format!("{:x}", md5::compute(b"dex\n035\0same"));
        let record = &tracker.records()[&hash];
        assert_eq!(record.occurrences, 2);
        assert_eq!(record.program, first.to_str().unwrap());
        tracker.handle_summary().unwrap();

        let mut reopened = UniqueProgramTracker::open(&db).unwrap();
        assert_eq!(reopened.records().len(), 2);
        reopened.handle_program_started(copy.to_str().unwrap());
        reopened.handle_divergences(&groups(&["a\n", "b\n"]));
        assert_eq!(reopened.new_this_session(), 0);
        assert_eq!(reopened.records()[&hash].occurrences, 3);
    }

    #[test]
    fn unique_tracker_ignores_unreadable_programs() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = UniqueProgramTracker::open(&dir.path().join("db")).unwrap();
        tracker.handle_program_started("/nonexistent/p.dex");
        tracker.handle_divergences(&groups(&["a\n", "b\n"]));
        assert!(tracker.records().is_empty());
    }

    #[test]
    fn corrupt_unique_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        fs::write(&db, "not json").unwrap();
        let err = UniqueProgramTracker::open(&db).err().unwrap();
        assert!(err.to_string().contains("Failed to parse unique program database"));
    }

    struct Shared(Rc<RefCell<Vec<String>>>, &'static str);

    impl Listener for Shared {
        fn handle_program_started(&mut self, program: &str) {
            self.0.borrow_mut().push(format!("{} {program}", self.1));
        }
        fn handle_summary(&mut self) -> Result<(), anyhow::Error> {
            if self.1 == "failing" {
                anyhow::bail!("summary failed");
            }
            self.0.borrow_mut().push(format!("{} summary", self.1));
            Ok(())
        }
    }

    #[test]
    fn multiplex_forwards_in_order_and_reports_first_failure() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut multiplex = MultiplexListener::new();
        assert!(multiplex.is_empty());
        multiplex.add(Box::new(Shared(Rc::clone(&seen), "first")));
        multiplex.add(Box::new(Shared(Rc::clone(&seen), "failing")));
        multiplex.add(Box::new(Shared(Rc::clone(&seen), "last")));
        assert_eq!(multiplex.len(), 3);

        multiplex.handle_program_started("p.dex");
        let err = multiplex.handle_summary().unwrap_err();
        assert_eq!(err.to_string(), "summary failed");
        assert_eq!(
            *seen.borrow(),
            vec![
                "first p.dex",
                "failing p.dex",
                "last p.dex",
                "first summary",
                "last summary",
            ]
        );
    }
}
