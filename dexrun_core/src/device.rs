use crate::architecture::Architecture;
use crate::result::ExecutionResult;
use crate::stream::{StreamConsumer, StreamError};
use std::cell::Cell;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

pub const ENV_PRODUCT_OUT: &str = "ANDROID_PRODUCT_OUT";
pub const ENV_HOST_OUT: &str = "ANDROID_HOST_OUT";
pub const ENV_DATA: &str = "ANDROID_DATA";

pub const DEFAULT_BRIDGE: &str = "adb";

/// Name reported for the local machine.
pub const HOST_DEVICE_NAME: &str = "[HostDevice]";

/// Errors raised by a [`Device`].
///
/// Everything except `Stream` means the environment cannot support any
/// further execution, and the tool is expected to stop.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A required environment variable is not set.
    #[error("Cannot run a program if ${0} is not set")]
    MissingEnvVar(&'static str),

    /// Host execution was requested but the host core image is missing.
    #[error("Host core image not found at {0:?}. Did you forget to build it?")]
    MissingBootImage(PathBuf),

    /// The bridge tool could not be run or reported a failure.
    #[error("Problem executing '{bridge}', is it in your $PATH? ({reason})")]
    BridgeUnavailable { bridge: String, reason: String },

    /// The bridge tool could not reach the requested device.
    #[error("Couldn't connect to device: {0}")]
    DeviceNotFound(String),

    /// Transferring a program to the device failed.
    #[error("Failed to push program, command was: {command} (return code {return_value})")]
    PushFailed { command: String, return_value: i32 },

    /// An operation that only makes sense for a remote device was attempted on the host.
    #[error("Operation '{0}' is only valid for a remote device")]
    NotRemote(&'static str),

    #[error("Refusing to execute an empty command")]
    EmptyCommand,

    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Failed waiting for command '{command}': {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },

    #[error("Output capture failed: {0}")]
    Stream(#[from] StreamError),
}

/// Where commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    Host,
    /// A device reached through the bridge tool; `serial` is what gets passed
    /// to `-s`, or `None` for the bridge's default device.
    Remote { serial: Option<String> },
}

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub target: DeviceTarget,
    pub no_boot_image: bool,
    pub bridge: String,
    /// Architecture whose core image is required for host execution.
    pub host_architecture: Architecture,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            target: DeviceTarget::Remote { serial: None },
            no_boot_image: false,
            bridge: DEFAULT_BRIDGE.to_string(),
            host_architecture: Architecture::X86,
        }
    }
}

impl DeviceOptions {
    pub fn host() -> Self {
        Self {
            target: DeviceTarget::Host,
            ..Default::default()
        }
    }

    pub fn remote(serial: Option<String>) -> Self {
        Self {
            target: DeviceTarget::Remote { serial },
            ..Default::default()
        }
    }
}

/// The pair of consumers an executor lends to [`Device::execute_command`]
/// when it wants the output of a run.
pub struct OutputCapture {
    pub stdout: StreamConsumer,
    pub stderr: StreamConsumer,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self {
            stdout: StreamConsumer::new("stdout"),
            stderr: StreamConsumer::new("stderr"),
        }
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        self.stdout.start()?;
        self.stderr.start()
    }

    /// Waits for both streams to drain. The second stream is finished even
    /// when the first fails, so neither consumer is left mid-stream.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        let stdout = self.stdout.process_finished();
        let stderr = self.stderr.process_finished();
        stdout.and(stderr)
    }

    pub fn shutdown(&mut self) {
        self.stdout.shutdown();
        self.stderr.shutdown();
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// One execution target: the host machine, or a device behind the bridge.
#[derive(Debug)]
pub struct Device {
    is_host: bool,
    name: String,
    using_specific_device: bool,
    no_boot_image: bool,
    bridge: String,
    android_host_out: String,
    android_product_out: String,
    android_data: Option<String>,
    program_pushed: Cell<bool>,
}

impl Device {
    /// Builds a device from the process environment.
    pub fn new(options: DeviceOptions) -> Result<Self, DeviceError> {
        Self::with_env(options, |key| std::env::var(key).ok())
    }

    /// Builds a device, reading environment variables through `lookup`.
    ///
    /// Every precondition is checked here, before anything else runs: the
    /// product/host out directories, and then either `ANDROID_DATA` plus the
    /// host core image, or the bridge tool and its connection to the device.
    pub fn with_env<F>(options: DeviceOptions, lookup: F) -> Result<Self, DeviceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &'static str| lookup(key).ok_or(DeviceError::MissingEnvVar(key));
        let android_product_out = require(ENV_PRODUCT_OUT)?;
        let android_host_out = require(ENV_HOST_OUT)?;

        let (is_host, name, using_specific_device) = match &options.target {
            DeviceTarget::Host => (true, HOST_DEVICE_NAME.to_string(), false),
            DeviceTarget::Remote { serial: Some(serial) } => (false, serial.clone(), true),
            DeviceTarget::Remote { serial: None } => (false, String::new(), false),
        };

        let android_data = if is_host {
            let data = require(ENV_DATA)?;
            let core_image = host_core_image_path(&android_host_out, options.host_architecture);
            if !core_image.exists() {
                return Err(DeviceError::MissingBootImage(core_image));
            }
            Some(data)
        } else {
            None
        };

        let device = Self {
            is_host,
            name,
            using_specific_device,
            no_boot_image: options.no_boot_image,
            bridge: options.bridge,
            android_host_out,
            android_product_out,
            android_data,
            program_pushed: Cell::new(false),
        };

        if !device.is_host {
            device.check_bridge()?;
        }
        Ok(device)
    }

    fn check_bridge(&self) -> Result<(), DeviceError> {
        let status = Command::new(&self.bridge)
            .arg("devices")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| DeviceError::BridgeUnavailable {
                bridge: self.bridge.clone(),
                reason: e.to_string(),
            })?;
        if !status.success() {
            return Err(DeviceError::BridgeUnavailable {
                bridge: self.bridge.clone(),
                reason: format!("'{} devices' exited with {status}", self.bridge),
            });
        }

        let mut capture = OutputCapture::new();
        capture.start()?;
        let command = format!("{}true", self.execution_shell_prefix());
        let result = self.execute_command(&command, Some(&mut capture));
        capture.shutdown();
        if result?.flattened_all().contains("device not found") {
            return Err(DeviceError::DeviceNotFound(self.name.clone()));
        }
        Ok(())
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_using_specific_device(&self) -> bool {
        self.using_specific_device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn no_boot_image_available(&self) -> bool {
        self.no_boot_image
    }

    pub fn android_host_out(&self) -> &str {
        &self.android_host_out
    }

    pub fn android_product_out(&self) -> &str {
        &self.android_product_out
    }

    /// Runs `command` and waits for it.
    ///
    /// The command is tokenized with [`split_command`] and spawned directly,
    /// not through a shell. With `capture`, both streams are drained by the
    /// given consumers and the result carries the lines plus the
    /// `RETURN CODE` trailer; without it, the streams are discarded.
    pub fn execute_command(
        &self,
        command: &str,
        capture: Option<&mut OutputCapture>,
    ) -> Result<ExecutionResult, DeviceError> {
        log::debug!("Executing: {command}");

        let args = split_command(command);
        let (program, rest) = args.split_first().ok_or(DeviceError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.env("ANDROID_ROOT", &self.android_host_out);
        if let Some(data) = &self.android_data {
            cmd.env("ANDROID_DATA", data);
        }
        cmd.stdin(Stdio::null());
        if capture.is_some() {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|source| DeviceError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let mut capture = match capture {
            Some(capture) => {
                if let Err(e) = attach_streams(&mut child, capture) {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = capture.finish();
                    return Err(e.into());
                }
                Some(capture)
            }
            None => None,
        };

        // The consumers keep both pipes drained, so this cannot block on a
        // full pipe.
        let waited = child.wait();
        if waited.is_err() {
            let _ = child.kill();
        }
        let finished = match capture.as_mut() {
            Some(capture) => capture.finish(),
            None => Ok(()),
        };
        let status = waited.map_err(|source| DeviceError::Wait {
            command: command.to_string(),
            source,
        })?;
        finished?;
        let return_value = exit_code(status);
        log::info!("Return value: {return_value}");

        match capture {
            Some(capture) => {
                Ok(ExecutionResult::captured(
                    return_value,
                    capture.stdout.get_output(),
                    capture.stderr.get_output(),
                ))
            }
            None => Ok(ExecutionResult::uncaptured(return_value)),
        }
    }

    /// Prefix that makes a command run on this device. Empty on the host.
    pub fn execution_shell_prefix(&self) -> String {
        if self.is_host {
            String::new()
        } else {
            self.bridge_prefix("shell")
        }
    }

    /// Prefix that copies files to this device. Empty on the host.
    pub fn execution_push_prefix(&self) -> String {
        if self.is_host {
            String::new()
        } else {
            self.bridge_prefix("push")
        }
    }

    fn bridge_prefix(&self, subcommand: &str) -> String {
        if self.using_specific_device {
            format!("{} -s {} {subcommand} ", self.bridge, self.name)
        } else {
            format!("{} {subcommand} ", self.bridge)
        }
    }

    fn cache_location(&self, architecture: Architecture) -> String {
        match &self.android_data {
            Some(data) if self.is_host => format!("{data}/dalvik-cache/{architecture}/"),
            _ => format!("/data/dalvik-cache/{architecture}/"),
        }
    }

    /// Location of the compiled-code cache entry for a program.
    pub fn code_cache_path(
        &self,
        architecture: Architecture,
        test_location: &str,
        program_name: &str,
    ) -> String {
        format!(
            "{}{}",
            self.cache_location(architecture),
            oat_file_name(test_location, program_name)
        )
    }

    /// Removes any compiled code cached for the program so the next run
    /// compiles it afresh.
    pub fn clean_code_cache(
        &self,
        architecture: Architecture,
        test_location: &str,
        program_name: &str,
    ) -> Result<(), DeviceError> {
        let command = format!(
            "{}rm -f {}",
            self.execution_shell_prefix(),
            self.code_cache_path(architecture, test_location, program_name)
        );
        self.execute_command(&command, None)?;
        Ok(())
    }

    /// Copies the program to `test_location` on the device, once per program.
    pub fn push_program_to_device(
        &self,
        program_name: &str,
        test_location: &str,
    ) -> Result<(), DeviceError> {
        if self.is_host {
            return Err(DeviceError::NotRemote("push_program_to_device"));
        }
        if self.program_pushed.get() {
            return Ok(());
        }
        let command = format!(
            "{}{program_name} {test_location}",
            self.execution_push_prefix()
        );
        let result = self.execute_command(&command, None)?;
        if result.return_value() != 0 {
            return Err(DeviceError::PushFailed {
                command,
                return_value: result.return_value(),
            });
        }
        self.program_pushed.set(true);
        Ok(())
    }

    pub fn is_program_pushed(&self) -> bool {
        self.program_pushed.get()
    }

    pub fn reset_program_pushed(&self) {
        self.program_pushed.set(false);
    }
}

fn attach_streams(
    child: &mut std::process::Child,
    capture: &mut OutputCapture,
) -> Result<(), StreamError> {
    if let Some(stdout) = child.stdout.take() {
        capture.stdout.give_stream_and_start_consuming(stdout)?;
    }
    if let Some(stderr) = child.stderr.take() {
        capture.stderr.give_stream_and_start_consuming(stderr)?;
    }
    Ok(())
}

fn host_core_image_path(android_host_out: &str, architecture: Architecture) -> PathBuf {
    PathBuf::from(android_host_out)
        .join("framework")
        .join(architecture.as_str())
        .join("core.art")
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Converts a program location into its dalvik-cache file name, e.g.
/// `/data/art-test` + `foo.dex` becomes `data@art-test@foo.dex`.
pub fn oat_file_name(test_location: &str, program_name: &str) -> String {
    let location = test_location.replace('/', "@");
    let location = location.strip_prefix('@').unwrap_or(&location);
    format!("{location}@{program_name}")
}

/// Splits a command line on whitespace, keeping single-quoted runs together.
///
/// Quotes are removed: `adb shell 'echo a b'` gives `["adb", "shell", "echo a b"]`.
/// A quoted run glued to unquoted text joins the same argument, `''` is an
/// empty argument, and an unterminated quote runs to the end of the input.
/// There is no escaping.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}
