// BPF support detection
//
// Decided once at controller start. The controller never re-checks.

use std::fs;

use serde::{Deserialize, Serialize};

/// cgroup skb accounting with socket cookies needs 4.9+
const MIN_KERNEL_VERSION: (u32, u32) = (4, 9);

/// Lowest platform API level shipping the kernel programs
pub const MIN_PLATFORM_API_LEVEL: u32 = 28;

/// How the controller picks between BPF and the legacy qtaguid facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BpfMode {
    /// Use BPF when the kernel is new enough
    #[default]
    Auto,
    /// Use BPF without checking the kernel
    Force,
    /// Never touch BPF
    Legacy,
}

impl BpfMode {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "force" | "bpf" => Self::Force,
            "legacy" | "qtaguid" => Self::Legacy,
            _ => Self::Auto, // default to auto
        }
    }

    /// CLI arg wins over TRAFFICD_BPF_MODE, which wins over the config file
    pub fn from_env_and_arg(arg: Option<&str>, configured: BpfMode) -> Self {
        if let Some(mode) = arg {
            return Self::parse(mode);
        }

        if let Ok(mode) = std::env::var("TRAFFICD_BPF_MODE") {
            return Self::parse(&mode);
        }

        configured
    }
}

/// Major and minor version out of a `/proc/version` line
pub fn parse_kernel_version(version_str: &str) -> Option<(u32, u32)> {
    let tokens: Vec<&str> = version_str.split_whitespace().collect();

    let version_part = tokens
        .iter()
        .position(|&t| t.eq_ignore_ascii_case("version"))
        .and_then(|i| tokens.get(i + 1))?;

    let mut parts = version_part.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;

    Some((major, minor))
}

/// Whether BPF accounting should be used, given the running kernel's
/// `/proc/version` line and the platform API level, if known
pub fn bpf_supported(proc_version: &str, platform_api_level: Option<u32>) -> bool {
    let Some(version) = parse_kernel_version(proc_version) else {
        log::warn!("Could not parse kernel version from {:?}", proc_version.trim());
        return false;
    };

    if version < MIN_KERNEL_VERSION {
        log::info!(
            "Kernel version {}.{} is too old for BPF accounting (need {}.{}+)",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1
        );
        return false;
    }

    if let Some(level) = platform_api_level {
        if level < MIN_PLATFORM_API_LEVEL {
            log::info!(
                "Platform API level {} is below {}, using legacy accounting",
                level,
                MIN_PLATFORM_API_LEVEL
            );
            return false;
        }
    }

    true
}

/// Resolves `mode` into the controller's one-time BPF flag
pub fn detect(mode: BpfMode, platform_api_level: Option<u32>) -> bool {
    match mode {
        BpfMode::Force => {
            log::warn!("BPF accounting forced on, skipping kernel checks");
            true
        }
        BpfMode::Legacy => false,
        BpfMode::Auto => match fs::read_to_string("/proc/version") {
            Ok(contents) => bpf_supported(&contents, platform_api_level),
            Err(e) => {
                log::warn!("Failed to read /proc/version: {}", e);
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version_standard() {
        let v = "Linux version 5.15.0-91-generic (buildd@lcy02-amd64-060)";
        assert_eq!(parse_kernel_version(v), Some((5, 15)));
    }

    #[test]
    fn test_parse_kernel_version_android() {
        let v = "Linux version 4.9.112-g1f2e3d4 (android-build@abfarm) #1 SMP PREEMPT";
        assert_eq!(parse_kernel_version(v), Some((4, 9)));
    }

    #[test]
    fn test_parse_kernel_version_garbage() {
        assert_eq!(parse_kernel_version("not a version line"), None);
        assert_eq!(parse_kernel_version("Linux version x.y"), None);
    }

    #[test]
    fn test_kernel_floor() {
        assert!(!bpf_supported("Linux version 4.4.0-generic", None));
        assert!(bpf_supported("Linux version 4.9.0-generic", None));
        assert!(bpf_supported("Linux version 6.1.0-generic", None));
    }

    #[test]
    fn test_api_level_floor() {
        let v = "Linux version 4.14.0";
        assert!(!bpf_supported(v, Some(27)));
        assert!(bpf_supported(v, Some(28)));
        assert!(bpf_supported(v, None));
    }

    #[test]
    fn test_explicit_modes_skip_detection() {
        assert!(detect(BpfMode::Force, Some(1)));
        assert!(!detect(BpfMode::Legacy, None));
    }

    #[test]
    fn test_mode_precedence() {
        assert_eq!(
            BpfMode::from_env_and_arg(Some("legacy"), BpfMode::Force),
            BpfMode::Legacy
        );
        assert_eq!(BpfMode::parse("FORCE"), BpfMode::Force);
        assert_eq!(BpfMode::parse("whatever"), BpfMode::Auto);
    }
}
