pub mod architecture;
pub mod config;
pub mod device;
pub mod executor;
pub mod listener;
pub mod result;
pub mod runner;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use architecture::Architecture;
pub use config::{ConfigError, DexrunConfig};
pub use device::{Device, DeviceError, DeviceOptions, DeviceTarget};
pub use executor::{Backend, Executor, ExecutorError, InterpreterBackend, OptimizingBackend};
pub use listener::{
    ConsoleListener, Listener, MultiplexListener, ReportListener, UniqueProgramTracker,
};
pub use result::ExecutionResult;
pub use runner::{DifferentialRunner, OutputGroup, RunnerError, RunnerSettings, Verdict};
pub use stream::{StreamConsumer, StreamError};
