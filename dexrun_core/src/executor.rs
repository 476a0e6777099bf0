use crate::architecture::Architecture;
use crate::device::{Device, DeviceError, OutputCapture};
use crate::listener::Listener;
use crate::result::ExecutionResult;
use crate::stream::StreamError;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

/// Timeout applied to every executor when short timeouts are requested.
pub const SHORT_TIMEOUT_SECS: u64 = 2;

pub const DEFAULT_EXECUTE_DIR: &str = "/data/art-test";
pub const DEFAULT_EXECUTE_CLASS: &str = "Main";
pub const DEFAULT_BISECTION_SCRIPT: &str = "bisection_search.py";

/// Core image used when the device has no boot image installed.
const NO_BOOT_IMAGE_PATH: &str = "/data/art-test/core.art";

/// Substrings in a host compiler's stderr that mean the program was rejected.
const HOST_VERIFICATION_FAILURES: [&str; 2] = ["Verification error", "Failure to verify dex file"];

/// Substrings in a run's output that mean the target VM rejected the program.
const TARGET_VERIFICATION_FAILURES: [&str; 2] = ["VerifyError", "Verification failed on class"];

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Bisection search was requested for a backend that does not support it.
    #[error("Executor '{0}' does not support bisection search")]
    NotBisectable(String),

    #[error("Cannot determine the current directory: {0}")]
    CurrentDir(std::io::Error),

    #[error("Failed to create a scratch directory for host verification: {0}")]
    Scratch(std::io::Error),
}

/// What a backend needs to know to build its command line.
pub struct CommandContext<'a> {
    pub architecture: Architecture,
    pub device: &'a Device,
    pub test_location: &'a str,
    pub execute_class: &'a str,
}

impl CommandContext<'_> {
    /// `-cp <location>/<program> <class>`
    fn classpath_and_class(&self, program_name: &str) -> String {
        format!(
            "-cp {}/{program_name} {}",
            self.test_location, self.execute_class
        )
    }

    fn boot_image_flags(&self) -> &'static str {
        if self.device.no_boot_image_available() {
            "-Ximage:/data/art-test/core.art -Xnorelocate "
        } else {
            ""
        }
    }
}

/// The backend-specific half of an executor: how to invoke the VM.
pub trait Backend {
    /// Suffix of the executor name, e.g. "Interpreter".
    fn label(&self) -> &'static str;

    fn default_timeout_secs(&self) -> u64;

    /// Whether compiled code from a previous run must be discarded first.
    fn needs_clean_code_cache(&self) -> bool;

    fn is_bisectable(&self) -> bool;

    /// `program_name` is a bare file name inside `ctx.test_location`.
    fn construct_command(&self, ctx: &CommandContext<'_>, program_name: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterBackend;

impl Backend for InterpreterBackend {
    fn label(&self) -> &'static str {
        "Interpreter"
    }

    fn default_timeout_secs(&self) -> u64 {
        30
    }

    fn needs_clean_code_cache(&self) -> bool {
        false
    }

    fn is_bisectable(&self) -> bool {
        false
    }

    fn construct_command(&self, ctx: &CommandContext<'_>, program_name: &str) -> String {
        format!(
            "{} -Xint {}{}",
            ctx.architecture.vm_binary(),
            ctx.boot_image_flags(),
            ctx.classpath_and_class(program_name)
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizingBackend;

impl Backend for OptimizingBackend {
    fn label(&self) -> &'static str {
        "Optimizing Backend"
    }

    fn default_timeout_secs(&self) -> u64 {
        5
    }

    fn needs_clean_code_cache(&self) -> bool {
        true
    }

    fn is_bisectable(&self) -> bool {
        true
    }

    fn construct_command(&self, ctx: &CommandContext<'_>, program_name: &str) -> String {
        format!(
            "{} -Xcompiler-option --compiler-backend=Optimizing {}{}",
            ctx.architecture.vm_binary(),
            ctx.boot_image_flags(),
            ctx.classpath_and_class(program_name)
        )
    }
}

/// Settings shared by every executor of a session.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub execute_class: String,
    /// Directory programs are pushed to on a remote device.
    pub execute_dir: String,
    /// Custom runtime root on the target; empty for the default.
    pub android_root: String,
    pub short_timeouts: bool,
    pub dump_verify: bool,
    /// Bisection search tool, looked up on `PATH` unless it is a path.
    pub bisection_script: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            execute_class: DEFAULT_EXECUTE_CLASS.to_string(),
            execute_dir: DEFAULT_EXECUTE_DIR.to_string(),
            android_root: String::new(),
            short_timeouts: false,
            dump_verify: false,
            bisection_script: DEFAULT_BISECTION_SCRIPT.to_string(),
        }
    }
}

/// Runs programs with one backend on one architecture.
///
/// An executor keeps its two stream consumers for its whole life and reuses
/// them for every run, so it must not run two programs at once. After
/// [`execute`](Executor::execute) the result is kept until
/// [`reset`](Executor::reset).
pub struct Executor {
    name: String,
    timeout_secs: u64,
    architecture: Architecture,
    device: Rc<Device>,
    backend: Box<dyn Backend>,
    execute_class: String,
    android_root: String,
    dump_verify: bool,
    bisection_script: String,
    test_location: String,
    capture: OutputCapture,
    result: Option<ExecutionResult>,
}

impl Executor {
    pub fn new(
        backend: Box<dyn Backend>,
        architecture: Architecture,
        device: Rc<Device>,
        settings: &ExecutorSettings,
    ) -> Result<Self, ExecutorError> {
        let test_location = if device.is_host() {
            std::env::current_dir()
                .map_err(ExecutorError::CurrentDir)?
                .to_string_lossy()
                .into_owned()
        } else {
            settings.execute_dir.clone()
        };
        Self::with_test_location(backend, architecture, device, settings, test_location)
    }

    /// Like [`Executor::new`], but with an explicit program location instead
    /// of the current directory or the execute directory.
    pub fn with_test_location(
        backend: Box<dyn Backend>,
        architecture: Architecture,
        device: Rc<Device>,
        settings: &ExecutorSettings,
        test_location: String,
    ) -> Result<Self, ExecutorError> {
        let timeout_secs = if settings.short_timeouts {
            SHORT_TIMEOUT_SECS
        } else {
            backend.default_timeout_secs()
        };
        let mut capture = OutputCapture::new();
        capture.start()?;
        Ok(Self {
            name: format!("{} {}", architecture.display_name(), backend.label()),
            timeout_secs,
            architecture,
            device,
            backend,
            execute_class: settings.execute_class.clone(),
            android_root: settings.android_root.trim().to_string(),
            dump_verify: settings.dump_verify,
            bisection_script: settings.bisection_script.clone(),
            test_location,
            capture,
            result: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn test_location(&self) -> &str {
        &self.test_location
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn needs_clean_code_cache(&self) -> bool {
        self.backend.needs_clean_code_cache()
    }

    pub fn is_bisectable(&self) -> bool {
        self.backend.is_bisectable()
    }

    /// The result of the last [`execute`](Executor::execute), if not reset since.
    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    pub fn reset(&mut self) {
        self.result = None;
    }

    /// Splits a local program path into the directory the VM finds it in
    /// and its file name.
    ///
    /// A remote device always has the program under the test location,
    /// since that is where it is pushed. On the host the program is run in
    /// place, relative to the test location unless the path is absolute.
    fn program_location(&self, program: &str) -> (String, String) {
        let path = Path::new(program);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        match parent {
            Some(parent) if self.device.is_host() => (
                Path::new(&self.test_location)
                    .join(parent)
                    .to_string_lossy()
                    .into_owned(),
                file_name,
            ),
            _ => (self.test_location.clone(), file_name),
        }
    }

    /// The backend's VM invocation for `program`, without any wrapper.
    pub fn construct_command(&self, program: &str) -> String {
        let (location, file_name) = self.program_location(program);
        let ctx = CommandContext {
            architecture: self.architecture,
            device: &self.device,
            test_location: &location,
            execute_class: &self.execute_class,
        };
        self.backend.construct_command(&ctx, &file_name)
    }

    /// Prepends the timeout wrapper and the device's shell prefix, then runs
    /// the command with output capture.
    fn execute_command_with_timeout(&mut self, command: &str) -> Result<ExecutionResult, ExecutorError> {
        let full = format!(
            "{}timeout {} {command}",
            self.device.execution_shell_prefix(),
            self.timeout_secs
        );
        Ok(self.device.execute_command(&full, Some(&mut self.capture))?)
    }

    fn runtime_environment_prefix(&self) -> String {
        if self.android_root.is_empty() {
            return String::new();
        }
        let root = &self.android_root;
        format!("env PATH={root}/bin ANDROID_ROOT={root} LD_LIBRARY_PATH={root}/lib:{root}/lib64 ")
    }

    /// Runs the program on the device and keeps the result.
    pub fn execute(&mut self, program: &str) -> Result<&ExecutionResult, ExecutorError> {
        let command = format!(
            "{}{}",
            self.runtime_environment_prefix(),
            self.construct_command(program)
        );
        let result = self.execute_command_with_timeout(&command)?;
        log::debug!("{} returned {}", self.name, result.return_value());
        Ok(self.result.insert(result))
    }

    fn host_verification_command(&self, program: &str, oat_file: &str) -> String {
        let boot_image = if self.device.no_boot_image_available() {
            NO_BOOT_IMAGE_PATH
        } else {
            "/system/framework/boot.art"
        };
        format!(
            "{host_out}/bin/dex2oat --instruction-set={arch} --instruction-set-features=default \
             --boot-image={product_out}{boot_image} --oat-file={oat_file} \
             --android-root={host_out} --runtime-arg -classpath \
             --runtime-arg {program} --dex-file={program} \
             --compiler-filter=quicken --runtime-arg -Xnorelocate",
            arch = self.architecture,
            product_out = self.device.android_product_out(),
            host_out = self.device.android_host_out(),
        )
    }

    /// Compiles the program on the host with a conservative filter to catch
    /// programs the target would reject before spending a full run on them.
    ///
    /// Returns `Ok(false)` when the compiler aborted or reported a
    /// verification failure; the listener hears about which one.
    pub fn verify_on_host(
        &mut self,
        program: &str,
        listener: &mut dyn Listener,
    ) -> Result<bool, ExecutorError> {
        // Dropping the directory removes output.oat on every return path.
        let scratch = tempfile::Builder::new()
            .prefix("dexrun-verify")
            .tempdir()
            .map_err(ExecutorError::Scratch)?;
        let oat_file = scratch.path().join("output.oat");
        let command = self.host_verification_command(program, &oat_file.to_string_lossy());
        let result = self.device.execute_command(&command, Some(&mut self.capture))?;

        if result.is_sigabort() {
            listener.handle_host_verification_sigabort(&result);
            return Ok(false);
        }

        let mut verified = true;
        for line in result.error() {
            if HOST_VERIFICATION_FAILURES.iter().any(|marker| line.contains(marker)) {
                verified = false;
            }
            if self.dump_verify {
                listener.handle_dump_verify(strip_log_prefix(line));
            }
        }
        if !verified {
            listener.handle_failed_host_verification(&result);
        }
        Ok(verified)
    }

    /// Pushes the program if the device is remote, then discards cached
    /// compiled code if this backend must compile from scratch.
    pub fn prepare_program_for_execution(&mut self, program: &str) -> Result<(), ExecutorError> {
        if !self.device.is_host() {
            self.device
                .push_program_to_device(program, &self.test_location)?;
        }
        if self.needs_clean_code_cache() {
            let (location, file_name) = self.program_location(program);
            self.device
                .clean_code_cache(self.architecture, &location, &file_name)?;
        }
        Ok(())
    }

    fn bisection_search_command(
        &self,
        program: &str,
        expected_output_file: &str,
        log_file: &str,
    ) -> String {
        let mut command = format!(
            "{} --raw-cmd '{}' --expected-output={expected_output_file} --logfile={log_file}",
            self.bisection_script,
            self.construct_command(program)
        );
        if !self.device.is_host() {
            command.push_str(" --device");
            if self.device.is_using_specific_device() {
                command.push_str(&format!(" --specific-device={}", self.device.name()));
            }
        }
        if self.device.no_boot_image_available() {
            command.push_str(" --no-image");
        }
        command.push_str(&format!(" --timeout={}", self.timeout_secs));
        command
    }

    /// Hands the program to the external bisection search script, which
    /// looks for the smallest set of compiler passes that reproduces a wrong
    /// output.
    pub fn run_bisection_search(
        &mut self,
        program: &str,
        expected_output_file: &str,
        log_file: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        if !self.is_bisectable() {
            return Err(ExecutorError::NotBisectable(self.name.clone()));
        }
        let command = self.bisection_search_command(program, expected_output_file, log_file);
        Ok(self.device.execute_command(&command, Some(&mut self.capture))?)
    }

    /// False when the last run's output shows the target VM rejected the
    /// program outright. True when nothing has run yet.
    pub fn did_target_verify(&self) -> bool {
        let Some(result) = &self.result else {
            return true;
        };
        !result
            .output()
            .iter()
            .chain(result.error())
            .any(|line| TARGET_VERIFICATION_FAILURES.iter().any(|m| line.contains(m)))
    }

    pub fn finished_with_program_on_device(&self) {
        self.device.reset_program_pushed();
    }

    pub fn shutdown(&mut self) {
        self.capture.shutdown();
    }
}

/// Strips the `file.cc:123] ` style prefix ART puts on its log lines.
pub fn strip_log_prefix(line: &str) -> &str {
    let mut search_end = line.len();
    while let Some(bracket) = line[..search_end].rfind("] ") {
        let before = &line[..bracket];
        let digits = before.len() - before.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if digits > 0 {
            let head = &before[..before.len() - digits];
            if head.ends_with("cc:") || head.ends_with("h:") {
                return &line[bracket + 2..];
            }
        }
        search_end = bracket;
    }
    line
}
