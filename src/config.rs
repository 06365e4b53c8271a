// This module holds engine configuration. EngineOptions bundles the knobs that shape
// translation (basic block length, the order of memory and callback hooks at one position,
// the size of each exec block's code region), the switch for running calls into
// uninstrumented code natively, and the target CPU description. TargetSpec
// names a CPU model and a list of feature attributes; it is validated against a known list
// and can be checked against the running host. Options can be overridden from the
// environment with REWIRE_MAX_BLOCK_INSTS and REWIRE_CODE_PAGES.

//! Engine options and target selection.

use crate::core::error::ConfigError;

/// Order of hook regions sharing one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookOrder {
    /// Memory capture runs before callbacks, so pre callbacks see the access.
    #[default]
    MemoryAccessFirst,
    CallbackFirst,
}

const KNOWN_CPUS: &[&str] = &[
    "generic",
    "x86-64",
    "x86-64-v2",
    "x86-64-v3",
    "x86-64-v4",
    "nehalem",
    "sandybridge",
    "haswell",
    "skylake",
    "znver1",
    "znver2",
    "znver3",
];

const KNOWN_FEATURES: &[&str] = &[
    "sse", "sse2", "sse3", "ssse3", "sse4.1", "sse4.2", "popcnt", "avx", "avx2", "fma", "bmi1",
    "bmi2", "lzcnt", "aes", "pclmulqdq",
];

/// CPU model and feature attributes of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub cpu: String,
    pub features: Vec<String>,
}

impl TargetSpec {
    /// Feature names may carry a leading `+`.
    pub fn new(cpu: &str, features: &[&str]) -> Self {
        Self {
            cpu: cpu.to_string(),
            features: features
                .iter()
                .map(|f| f.trim_start_matches('+').to_string())
                .collect(),
        }
    }

    /// Baseline x86-64 target.
    pub fn host() -> Self {
        Self::new("x86-64", &["sse2"])
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_CPUS.contains(&self.cpu.as_str()) {
            return Err(ConfigError::UnknownCpu(self.cpu.clone()));
        }
        for feature in &self.features {
            if !KNOWN_FEATURES.contains(&feature.as_str()) {
                return Err(ConfigError::UnknownFeature(feature.clone()));
            }
        }
        Ok(())
    }

    /// Whether every requested feature is available on the running CPU.
    pub fn supported_by_host(&self) -> bool {
        self.features.iter().all(|f| host_has_feature(f))
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::host()
    }
}

#[cfg(target_arch = "x86_64")]
fn host_has_feature(name: &str) -> bool {
    match name {
        "sse" => std::arch::is_x86_feature_detected!("sse"),
        "sse2" => std::arch::is_x86_feature_detected!("sse2"),
        "sse3" => std::arch::is_x86_feature_detected!("sse3"),
        "ssse3" => std::arch::is_x86_feature_detected!("ssse3"),
        "sse4.1" => std::arch::is_x86_feature_detected!("sse4.1"),
        "sse4.2" => std::arch::is_x86_feature_detected!("sse4.2"),
        "popcnt" => std::arch::is_x86_feature_detected!("popcnt"),
        "avx" => std::arch::is_x86_feature_detected!("avx"),
        "avx2" => std::arch::is_x86_feature_detected!("avx2"),
        "fma" => std::arch::is_x86_feature_detected!("fma"),
        "bmi1" => std::arch::is_x86_feature_detected!("bmi1"),
        "bmi2" => std::arch::is_x86_feature_detected!("bmi2"),
        "lzcnt" => std::arch::is_x86_feature_detected!("lzcnt"),
        "aes" => std::arch::is_x86_feature_detected!("aes"),
        "pclmulqdq" => std::arch::is_x86_feature_detected!("pclmulqdq"),
        _ => false,
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn host_has_feature(_name: &str) -> bool {
    false
}

/// Options for [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Longest basic block translated at once.
    pub max_block_insts: usize,
    pub hook_order: HookOrder,
    /// Pages of code per exec block.
    pub code_pages: usize,
    /// Run calls into uninstrumented code natively instead of failing.
    pub exec_broker: bool,
    pub target: TargetSpec,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_block_insts: 64,
            hook_order: HookOrder::default(),
            code_pages: 4,
            exec_broker: true,
            target: TargetSpec::default(),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_block_insts(mut self, n: usize) -> Self {
        self.max_block_insts = n;
        self
    }

    pub fn with_hook_order(mut self, order: HookOrder) -> Self {
        self.hook_order = order;
        self
    }

    pub fn with_code_pages(mut self, pages: usize) -> Self {
        self.code_pages = pages;
        self
    }

    pub fn with_exec_broker(mut self, enabled: bool) -> Self {
        self.exec_broker = enabled;
        self
    }

    pub fn with_target(mut self, target: TargetSpec) -> Self {
        self.target = target;
        self
    }

    /// Defaults overridden by `REWIRE_MAX_BLOCK_INSTS` and `REWIRE_CODE_PAGES`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(n) = env_usize("REWIRE_MAX_BLOCK_INSTS")? {
            options.max_block_insts = n;
        }
        if let Some(n) = env_usize("REWIRE_CODE_PAGES")? {
            options.code_pages = n;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_block_insts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_block_insts",
                value: "0".to_string(),
            });
        }
        if !(1..=256).contains(&self.code_pages) {
            return Err(ConfigError::InvalidValue {
                name: "code_pages",
                value: self.code_pages.to_string(),
            });
        }
        self.target.validate()
    }
}

fn env_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => Err(ConfigError::InvalidValue { name, value }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.max_block_insts, 64);
        assert_eq!(options.hook_order, HookOrder::MemoryAccessFirst);
        assert!(options.exec_broker);
        assert_eq!(options.target.cpu, "x86-64");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let options = EngineOptions::new()
            .with_max_block_insts(8)
            .with_hook_order(HookOrder::CallbackFirst)
            .with_code_pages(2)
            .with_exec_broker(false);
        assert!(!options.exec_broker);
        assert_eq!(options.max_block_insts, 8);
        assert_eq!(options.hook_order, HookOrder::CallbackFirst);
        assert_eq!(options.code_pages, 2);
    }

    #[test]
    fn test_invalid_options() {
        let zero = EngineOptions::new().with_max_block_insts(0);
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::InvalidValue {
                name: "max_block_insts",
                ..
            })
        ));
        assert!(EngineOptions::new().with_code_pages(0).validate().is_err());
    }

    #[test]
    fn test_target_validation() {
        assert!(TargetSpec::new("haswell", &["+avx2", "bmi2"]).validate().is_ok());
        assert_eq!(
            TargetSpec::new("pentium9", &[]).validate(),
            Err(ConfigError::UnknownCpu("pentium9".to_string()))
        );
        assert_eq!(
            TargetSpec::new("x86-64", &["+warp"]).validate(),
            Err(ConfigError::UnknownFeature("warp".to_string()))
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_host_baseline() {
        assert!(TargetSpec::host().supported_by_host());
    }
}
