use dexrun_core::architecture::Architecture;
use dexrun_core::config::{DexrunConfig, default_report_file};
use dexrun_core::device::Device;
use dexrun_core::listener::{
    ConsoleListener, Listener, MultiplexListener, ReportListener, UniqueProgramTracker,
};
use dexrun_core::runner::DifferentialRunner;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runs DEX programs on several ART backends and compares their output", long_about = None)]
struct Cli {
    /// Program files to run. A directory stands for every file in it.
    #[clap(required = true)]
    programs: Vec<PathBuf>,

    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Execute on the host instead of a device.
    #[clap(long, conflicts_with = "device")]
    host: bool,
    /// Serial of the device to use, as passed to `adb -s`.
    #[clap(long)]
    device: Option<String>,
    #[clap(long)]
    execute_dir: Option<String>,
    #[clap(long)]
    android_root: Option<String>,
    #[clap(long)]
    no_boot_image: bool,
    #[clap(long)]
    skip_host_verify: bool,
    #[clap(long)]
    execute_class: Option<String>,

    #[clap(long)]
    interpreter: bool,
    #[clap(long)]
    optimizing: bool,
    #[clap(long)]
    arm: bool,
    #[clap(long)]
    arm64: bool,
    /// Both ARM and ARM64.
    #[clap(long)]
    allarm: bool,
    #[clap(long)]
    x86: bool,
    #[clap(long = "x86-64")]
    x86_64: bool,
    #[clap(long)]
    mips: bool,
    #[clap(long)]
    mips64: bool,

    #[clap(long)]
    dump_output: bool,
    #[clap(long)]
    dump_verify: bool,
    #[clap(long)]
    short_timeouts: bool,
    #[clap(long)]
    divergence_retry: Option<u32>,
    #[clap(long)]
    bisection_search: bool,
    #[clap(long)]
    bisection_script: Option<String>,
    /// Append a report to this file (default: report.log).
    #[clap(long, num_args = 0..=1, require_equals = true, default_missing_value = "report.log")]
    report: Option<PathBuf>,
    /// Track unique divergent programs across sessions.
    #[clap(long)]
    report_unique: bool,
    #[clap(long)]
    unique_db: Option<PathBuf>,
    #[clap(short, long)]
    quiet: bool,

    /// Log filter, e.g. "info" or "dexrun_core=debug". Defaults to RUST_LOG,
    /// then "info".
    #[clap(long)]
    log: Option<String>,
}

impl Cli {
    fn selected_architectures(&self) -> Vec<Architecture> {
        [
            (self.arm64 || self.allarm, Architecture::Arm64),
            (self.arm || self.allarm, Architecture::Arm),
            (self.x86_64, Architecture::X86_64),
            (self.x86, Architecture::X86),
            (self.mips64, Architecture::Mips64),
            (self.mips, Architecture::Mips),
        ]
        .into_iter()
        .filter_map(|(selected, arch)| selected.then_some(arch))
        .collect()
    }

    /// Flags win over the config file; boolean flags can only switch things on.
    fn apply_overrides(&self, config: &mut DexrunConfig) {
        let device = &mut config.device;
        device.host |= self.host;
        if let Some(serial) = &self.device {
            device.serial = Some(serial.clone());
        }
        if let Some(dir) = &self.execute_dir {
            device.execute_dir = dir.clone();
        }
        if let Some(root) = &self.android_root {
            device.android_root = Some(root.clone());
        }
        device.no_boot_image |= self.no_boot_image;

        let executors = &mut config.executors;
        executors.interpreter |= self.interpreter;
        executors.optimizing |= self.optimizing;
        executors.architectures.extend(self.selected_architectures());
        if let Some(class) = &self.execute_class {
            executors.execute_class = class.clone();
        }
        executors.short_timeouts |= self.short_timeouts;

        let run = &mut config.run;
        run.skip_host_verify |= self.skip_host_verify;
        run.dump_output |= self.dump_output;
        run.dump_verify |= self.dump_verify;
        if let Some(retry) = self.divergence_retry {
            run.divergence_retry = retry;
        }
        run.bisection_search |= self.bisection_search;
        if let Some(script) = &self.bisection_script {
            run.bisection_script = script.clone();
        }
        if let Some(report) = &self.report {
            run.report_file = Some(report.clone());
        }
        run.report_unique |= self.report_unique;
        if let Some(db) = &self.unique_db {
            run.unique_db = db.clone();
        }
        run.quiet |= self.quiet;
    }
}

fn load_config(cli: &Cli) -> Result<DexrunConfig, anyhow::Error> {
    match &cli.config {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            DexrunConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("dexrun.toml");
            if default_config_path.exists() {
                log::info!("Loading default configuration: {default_config_path:?}");
                DexrunConfig::load_from_file(&default_config_path)
            } else {
                log::debug!("No config file found, using built-in defaults");
                Ok(DexrunConfig::default())
            }
        }
    }
}

/// Replaces each directory argument with the files directly inside it,
/// sorted by name. Other arguments are kept as given.
fn expand_programs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, anyhow::Error> {
    let mut programs = Vec::new();
    for path in paths {
        if !path.is_dir() {
            programs.push(path.clone());
            continue;
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("Failed to read program directory {path:?}"))?
        {
            let entry = entry.with_context(|| format!("Failed to read program directory {path:?}"))?;
            if entry.file_type().is_ok_and(|t| t.is_file()) {
                found.push(entry.path());
            }
        }
        found.sort();
        if found.is_empty() {
            log::warn!("No programs in {path:?}");
        }
        for program in &found {
            log::info!("Adding {}", program.display());
        }
        programs.extend(found);
    }
    Ok(programs)
}

fn build_listener(config: &DexrunConfig) -> Result<MultiplexListener, anyhow::Error> {
    let mut listener = MultiplexListener::new();
    listener.add(Box::new(ConsoleListener::new(config.run.quiet)));
    if let Some(report) = &config.run.report_file {
        let path = if report.as_os_str().is_empty() {
            default_report_file()
        } else {
            report.clone()
        };
        listener.add(Box::new(ReportListener::create(&path)?));
    }
    if config.run.report_unique {
        listener.add(Box::new(UniqueProgramTracker::open(&config.run.unique_db)?));
    }
    Ok(listener)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut logger = match &cli.log {
        Some(filters) => {
            let mut builder = env_logger::Builder::new();
            builder.parse_filters(filters);
            builder
        }
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")),
    };
    logger.format_timestamp(None).init();

    let mut config = load_config(&cli)?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid options")?;
    log::debug!("Effective configuration: {config:#?}");

    let device = Rc::new(
        Device::new(config.device_options()).context("Cannot set up the execution device")?,
    );
    let programs = expand_programs(&cli.programs)?;
    let mut runner = DifferentialRunner::from_config(&config, device)?;
    let mut listener = build_listener(&config)?;

    let start_time = Instant::now();
    let mut outcome = Ok(());
    for program in &programs {
        let name = program.to_string_lossy();
        match runner.run_program(&name, &mut listener) {
            Ok(verdict) => log::debug!("{name}: {verdict:?}"),
            Err(e) => {
                outcome = Err(anyhow::Error::new(e).context(format!("Aborted while running {name}")));
                break;
            }
        }
    }
    runner.shutdown();

    log::info!(
        "Ran {} program(s) in {:.2?}",
        programs.len(),
        start_time.elapsed()
    );
    listener.handle_summary()?;
    outcome
}
