//! # arena-foundation
//!
//! Foundation layer for Arena:
//! - Error: 인프라 에러 타입 (배치 중단 여부 판단 포함)
//! - Config: 실행 설정 (`tournament.toml`), 보안 정책 (`security.toml`), 리소스 제한
//! - Language: 지원 언어별 규칙 (엔트리 포인트, 컴파일/실행 명령)

pub mod config;
pub mod error;
pub mod language;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    // Limits
    format_bytes,
    parse_memory_string,
    ResourceLimits,
    // Policy
    PolicyFile,
    SandboxPolicy,
    SecurityLevel,
    POLICY_FILE,
    // Run
    RunConfig,
    RUN_CONFIG_FILE,
};

// ============================================================================
// Language (언어)
// ============================================================================
pub use language::{LanguageVariant, NATIVE_BINARY};
