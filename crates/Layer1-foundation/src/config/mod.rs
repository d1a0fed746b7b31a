//! Config - 실행 설정과 보안 정책
//!
//! - `run.rs` - 토너먼트 실행 설정 (`tournament.toml`)
//! - `policy.rs` - 보안 정책 (`security.toml`)
//! - `limits.rs` - 실행당 리소스 제한

mod limits;
mod policy;
mod run;

pub use limits::{format_bytes, parse_memory_string, ResourceLimits};
pub use policy::{
    CapabilitiesSection, FilesystemSection, HardeningSection, NetworkSection, PolicyFile,
    SandboxPolicy, SecurityLevel, SecuritySection, ValidatorSection, POLICY_FILE,
};
pub use run::{RunConfig, RUN_CONFIG_FILE};
