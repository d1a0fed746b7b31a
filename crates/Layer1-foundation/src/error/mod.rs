//! Error types for Arena
//!
//! 인프라 에러만 여기서 다룬다. 제출물 단위의 실패(거부, 컴파일 실패, 타임아웃 등)는
//! 에러가 아니라 결과(outcome)로 기록된다.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Arena 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security policy not found: {0}")]
    PolicyMissing(String),

    #[error("Dataset not found: {0}")]
    DatasetMissing(String),

    // ========================================================================
    // 격리/실행 관련
    // ========================================================================
    #[error("Isolation unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Spawn failed: {program} - {message}")]
    Spawn { program: String, message: String },

    // ========================================================================
    // 제출물 관련
    // ========================================================================
    #[error("Submission error: {0}")]
    Submission(String),

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 배치 전체를 중단해야 하는 에러인지 확인
    ///
    /// 배치 시작 전 준비 단계(설정, 정책, 데이터셋, 격리 프리미티브)의 실패만 해당한다.
    /// 실행 중 한 제출물에서 난 I/O, spawn, sandbox 에러는 그 제출물의 결과로 기록된다.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::PolicyMissing(_)
                | Error::DatasetMissing(_)
                | Error::IsolationUnavailable(_)
                | Error::Pattern(_)
                | Error::Toml(_)
        )
    }

    /// Spawn 에러 생성 헬퍼
    pub fn spawn(program: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Spawn {
            program: program.into(),
            message: message.to_string(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
