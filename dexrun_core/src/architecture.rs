use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Instruction set an executor targets.
///
/// The canonical string (`as_str`) is what ART tools expect on their command
/// lines and what the dalvik-cache uses as a directory name.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Arm,
    Arm64,
    X86,
    #[serde(rename = "x86_64", alias = "x86-64")]
    X86_64,
    Mips,
    Mips64,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown architecture '{0}'")]
pub struct UnknownArchitecture(pub String);

impl Architecture {
    /// Every architecture, in the order executors are created for them.
    pub const ALL: [Architecture; 6] = [
        Architecture::Arm64,
        Architecture::Arm,
        Architecture::X86_64,
        Architecture::X86,
        Architecture::Mips64,
        Architecture::Mips,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Mips => "mips",
            Architecture::Mips64 => "mips64",
        }
    }

    /// Human-readable prefix used in executor names, e.g. "ARM64 Interpreter".
    pub fn display_name(&self) -> &'static str {
        match self {
            Architecture::Arm => "ARM",
            Architecture::Arm64 => "ARM64",
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86-64",
            Architecture::Mips => "MIPS",
            Architecture::Mips64 => "MIPS64",
        }
    }

    pub fn is_64_bit(&self) -> bool {
        matches!(
            self,
            Architecture::Arm64 | Architecture::X86_64 | Architecture::Mips64
        )
    }

    /// The dalvikvm launcher matching this architecture's word size.
    pub fn vm_binary(&self) -> &'static str {
        if self.is_64_bit() {
            "dalvikvm64"
        } else {
            "dalvikvm32"
        }
    }

    pub fn is_arm(&self) -> bool {
        matches!(self, Architecture::Arm | Architecture::Arm64)
    }

    pub fn is_x86(&self) -> bool {
        matches!(self, Architecture::X86 | Architecture::X86_64)
    }

    pub fn is_mips(&self) -> bool {
        matches!(self, Architecture::Mips | Architecture::Mips64)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = UnknownArchitecture;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arm" => Ok(Architecture::Arm),
            "arm64" => Ok(Architecture::Arm64),
            "x86" => Ok(Architecture::X86),
            "x86_64" | "x86-64" => Ok(Architecture::X86_64),
            "mips" => Ok(Architecture::Mips),
            "mips64" => Ok(Architecture::Mips64),
            _ => Err(UnknownArchitecture(s.to_string())),
        }
    }
}
