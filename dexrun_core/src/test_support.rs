//! Fixtures shared by the tests. The subprocess fixtures need a `/bin/sh`
//! and are unix-only.

use std::collections::HashMap;

pub fn env_with(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(unix)]
pub use self::process::*;

#[cfg(unix)]
mod process {
    use super::env_with;
    use crate::device::{Device, DeviceOptions, ENV_DATA, ENV_HOST_OUT, ENV_PRODUCT_OUT};
    use crate::executor::{Backend, CommandContext};
    use std::collections::HashMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable `/bin/sh` script.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A fake Android build tree with a host core image, for host-mode devices.
    pub struct HostFixture {
        pub root: tempfile::TempDir,
        pub env: HashMap<String, String>,
    }

    impl HostFixture {
        pub fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let host_out = root.path().join("host");
            fs::create_dir_all(host_out.join("framework/x86")).unwrap();
            fs::write(host_out.join("framework/x86/core.art"), b"").unwrap();
            let data = root.path().join("data");
            fs::create_dir_all(&data).unwrap();
            let env = env_with(&[
                (ENV_PRODUCT_OUT, root.path().join("product").to_str().unwrap()),
                (ENV_HOST_OUT, host_out.to_str().unwrap()),
                (ENV_DATA, data.to_str().unwrap()),
            ]);
            Self { root, env }
        }

        pub fn device(&self) -> Device {
            self.device_with(DeviceOptions::host())
        }

        pub fn device_with(&self, options: DeviceOptions) -> Device {
            Device::with_env(options, |k| self.env.get(k).cloned()).expect("host fixture device")
        }

        /// A runtime root whose `bin/` holds the given scripts.
        pub fn runtime_root(&self, scripts: &[(&str, &str)]) -> PathBuf {
            let root = self.root.path().join("runtime");
            let bin = root.join("bin");
            fs::create_dir_all(&bin).unwrap();
            for (name, body) in scripts {
                write_script(&bin, name, body);
            }
            root
        }
    }

    /// A stand-in bridge tool that logs its arguments, runs `shell` commands
    /// locally and exits with `push_exit` for `push`. Returns the script and its
    /// log file.
    pub fn fake_bridge(dir: &Path, push_exit: i32) -> (PathBuf, PathBuf) {
        let log = dir.join("bridge.log");
        let body = format!(
            r#"echo "$@" >> '{log}'
    if [ "$1" = "-s" ]; then shift 2; fi
    case "$1" in
      devices) exit 0 ;;
      push) exit {push_exit} ;;
      shell) shift; exec "$@" ;;
    esac
    exit 1
    "#,
            log = log.display()
        );
        (write_script(dir, "fake-adb", &body), log)
    }

    pub fn remote_device(bridge: &Path, serial: Option<&str>, no_boot_image: bool) -> Device {
        let env = env_with(&[(ENV_PRODUCT_OUT, "/out/product"), (ENV_HOST_OUT, "/out/host")]);
        let options = DeviceOptions {
            bridge: bridge.to_str().unwrap().to_string(),
            no_boot_image,
            ..DeviceOptions::remote(serial.map(str::to_string))
        };
        Device::with_env(options, |k| env.get(k).cloned()).expect("fake bridge device")
    }

    /// Lines of the bridge log that mention `word`.
    pub fn logged_calls(log: &Path, word: &str) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .filter(|line| line.split_whitespace().any(|w| w == word))
            .map(str::to_string)
            .collect()
    }

    /// A backend that runs a shell snippet in place of a VM.
    pub struct ScriptBackend {
        label: &'static str,
        script: String,
        bisectable: bool,
    }

    impl ScriptBackend {
        pub fn new(script: &str) -> Self {
            Self {
                label: "Script",
                script: script.to_string(),
                bisectable: false,
            }
        }

        pub fn labelled(label: &'static str, script: &str) -> Self {
            Self {
                label,
                ..Self::new(script)
            }
        }

        pub fn bisectable(mut self) -> Self {
            self.bisectable = true;
            self
        }
    }

    impl Backend for ScriptBackend {
        fn label(&self) -> &'static str {
            self.label
        }

        fn default_timeout_secs(&self) -> u64 {
            10
        }

        fn needs_clean_code_cache(&self) -> bool {
            false
        }

        fn is_bisectable(&self) -> bool {
            self.bisectable
        }

        fn construct_command(&self, _ctx: &CommandContext<'_>, _program_name: &str) -> String {
            format!("sh -c '{}'", self.script)
        }
    }
}
