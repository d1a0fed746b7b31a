//! Security Policy File - 보안 정책 (`security.toml`)
//!
//! 실행 설정과 달리 정책 파일이 없으면 치명적 에러다.
//!
//! ```toml
//! [security]
//! security_level = "high"
//!
//! [network]
//! allow = false
//!
//! [filesystem]
//! allow_exec_in_scratch = false
//! scratch_size_mb = 64
//!
//! [capabilities]
//! drop_all = true
//! keep = []
//!
//! [hardening]
//! no_new_privileges = true
//! seccomp = true
//! apparmor = false
//!
//! [validator]
//! max_submission_kb = 1024
//! max_file_kb = 512
//! max_file_mode = "0755"
//! extra_blocked_patterns = ["ctypes"]
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// 보안 정책 파일명
pub const POLICY_FILE: &str = "security.toml";

// ============================================================================
// Security Level
// ============================================================================

/// 검증 엄격도
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    #[default]
    High,
    Maximum,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Maximum => "maximum",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "maximum" | "max" => Ok(Self::Maximum),
            other => Err(Error::Config(format!("unknown security level '{}'", other))),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub security_level: SecurityLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub allow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemSection {
    pub allow_exec_in_scratch: bool,
    pub scratch_size_mb: u64,
}

impl Default for FilesystemSection {
    fn default() -> Self {
        Self {
            allow_exec_in_scratch: false,
            scratch_size_mb: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesSection {
    pub drop_all: bool,
    pub keep: Vec<String>,
}

impl Default for CapabilitiesSection {
    fn default() -> Self {
        Self {
            drop_all: true,
            keep: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardeningSection {
    pub no_new_privileges: bool,
    pub seccomp: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor: bool,
    pub apparmor_profile: Option<String>,
    /// 격리 기능(cgroup, network namespace)이 없으면 실행을 거부
    pub strict_isolation: bool,
}

impl Default for HardeningSection {
    fn default() -> Self {
        Self {
            no_new_privileges: true,
            seccomp: true,
            seccomp_profile: None,
            apparmor: false,
            apparmor_profile: None,
            strict_isolation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub max_submission_kb: u64,
    pub max_file_kb: u64,
    /// 8진수 문자열 (예: "0755")
    pub max_file_mode: String,
    pub extra_blocked_patterns: Vec<String>,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            max_submission_kb: 1024,
            max_file_kb: 512,
            max_file_mode: "0755".to_string(),
            extra_blocked_patterns: Vec::new(),
        }
    }
}

// ============================================================================
// Policy File
// ============================================================================

/// 보안 정책 파일 전체
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub security: SecuritySection,
    pub network: NetworkSection,
    pub filesystem: FilesystemSection,
    pub capabilities: CapabilitiesSection,
    pub hardening: HardeningSection,
    pub validator: ValidatorSection,
}

impl PolicyFile {
    /// 파일에서 로드 (없으면 `PolicyMissing`)
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::PolicyMissing(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let policy = Self::parse(&content)?;
        debug!(path = %path.display(), level = %policy.level(), "Loaded security policy");
        Ok(policy)
    }

    /// TOML 파싱 + 검증
    pub fn parse(content: &str) -> Result<Self> {
        let policy: PolicyFile = toml::from_str(content)?;
        policy.validate()?;
        Ok(policy)
    }

    /// 값 검증 (잘못된 사용자 패턴은 무시하지 않고 에러)
    pub fn validate(&self) -> Result<()> {
        self.max_file_mode()?;

        for pattern in &self.validator.extra_blocked_patterns {
            Regex::new(pattern).map_err(|e| {
                Error::Config(format!("invalid blocked pattern '{}': {}", pattern, e))
            })?;
        }

        if self.filesystem.scratch_size_mb == 0 {
            return Err(Error::Config("scratch_size_mb must be positive".into()));
        }
        if self.validator.max_file_kb == 0 || self.validator.max_submission_kb == 0 {
            return Err(Error::Config("validator size ceilings must be positive".into()));
        }
        Ok(())
    }

    pub fn level(&self) -> SecurityLevel {
        self.security.security_level
    }

    /// 허용되는 최대 파일 권한 비트
    pub fn max_file_mode(&self) -> Result<u32> {
        let raw = self.validator.max_file_mode.trim();
        let digits = raw.strip_prefix("0o").unwrap_or(raw);
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| Error::Config(format!("invalid max_file_mode '{}'", raw)))
    }

    pub fn scratch_bytes(&self) -> u64 {
        self.filesystem.scratch_size_mb * 1024 * 1024
    }

    /// 실행기 관점의 정책
    pub fn sandbox(&self) -> SandboxPolicy {
        SandboxPolicy {
            allow_network: self.network.allow,
            drop_all_capabilities: self.capabilities.drop_all,
            keep_capabilities: self.capabilities.keep.clone(),
            no_new_privileges: self.hardening.no_new_privileges,
            seccomp: self.hardening.seccomp,
            seccomp_profile: self.hardening.seccomp_profile.clone(),
            apparmor: self.hardening.apparmor,
            apparmor_profile: self.hardening.apparmor_profile.clone(),
            allow_exec_in_scratch: self.filesystem.allow_exec_in_scratch,
            strict_isolation: self.hardening.strict_isolation,
        }
    }
}

// ============================================================================
// Sandbox Policy
// ============================================================================

/// 격리 프로파일 (실행기가 적용)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxPolicy {
    pub allow_network: bool,
    pub drop_all_capabilities: bool,
    pub keep_capabilities: Vec<String>,
    pub no_new_privileges: bool,
    pub seccomp: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor: bool,
    pub apparmor_profile: Option<String>,
    pub allow_exec_in_scratch: bool,
    pub strict_isolation: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        PolicyFile::default().sandbox()
    }
}

impl SandboxPolicy {
    /// 최대 격리
    pub fn strict() -> Self {
        Self {
            strict_isolation: true,
            ..Self::default()
        }
    }

    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn keep_capability(mut self, cap: impl Into<String>) -> Self {
        self.keep_capabilities.push(cap.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(SecurityLevel::Low < SecurityLevel::Medium);
        assert!(SecurityLevel::High < SecurityLevel::Maximum);
        assert_eq!("MAX".parse::<SecurityLevel>().unwrap(), SecurityLevel::Maximum);
        assert!("paranoid".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn test_parse_full_policy() {
        let policy = PolicyFile::parse(
            r#"
            [security]
            security_level = "maximum"

            [network]
            allow = false

            [filesystem]
            scratch_size_mb = 16

            [capabilities]
            drop_all = true
            keep = ["CAP_SETUID"]

            [hardening]
            seccomp = false
            strict_isolation = true

            [validator]
            max_file_mode = "0644"
            extra_blocked_patterns = ["ctypes", "mmap\\("]
            "#,
        )
        .unwrap();

        assert_eq!(policy.level(), SecurityLevel::Maximum);
        assert_eq!(policy.scratch_bytes(), 16 * 1024 * 1024);
        assert_eq!(policy.max_file_mode().unwrap(), 0o644);

        let sandbox = policy.sandbox();
        assert!(!sandbox.allow_network);
        assert!(!sandbox.seccomp);
        assert!(sandbox.no_new_privileges);
        assert!(sandbox.strict_isolation);
        assert_eq!(sandbox.keep_capabilities, vec!["CAP_SETUID".to_string()]);
    }

    #[test]
    fn test_empty_policy_uses_defaults() {
        let policy = PolicyFile::parse("").unwrap();
        assert_eq!(policy.level(), SecurityLevel::High);
        assert_eq!(policy.max_file_mode().unwrap(), 0o755);
    }

    #[test]
    fn test_invalid_user_pattern_is_error() {
        let err = PolicyFile::parse(
            r#"
            [validator]
            extra_blocked_patterns = ["(unclosed"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_mode_is_error() {
        let err = PolicyFile::parse(
            r#"
            [validator]
            max_file_mode = "rwx"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = PolicyFile::load(&dir.path().join(POLICY_FILE)).unwrap_err();
        assert!(matches!(err, Error::PolicyMissing(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_level_is_error() {
        assert!(PolicyFile::parse("[security]\nsecurity_level = \"extreme\"").is_err());
    }
}
