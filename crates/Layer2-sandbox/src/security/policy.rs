//! Security Policy - 검증기가 사용하는 컴파일된 정책

use arena_foundation::{PolicyFile, Result, SecurityLevel};

use super::patterns::{builtin_patterns, BlockedPattern, PatternCategory};

/// 검증 정책
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// 엄격도
    pub level: SecurityLevel,
    /// 차단 패턴 (내장 + 사용자 정의)
    pub patterns: Vec<BlockedPattern>,
    /// 제출물 전체 크기 상한 (bytes)
    pub max_submission_bytes: u64,
    /// 파일당 크기 상한 (bytes)
    pub max_file_bytes: u64,
    /// 허용 최대 권한 비트
    pub max_file_mode: u32,
}

impl SecurityPolicy {
    /// 기본 정책 (high)
    pub fn new() -> Result<Self> {
        Self::from_file(&PolicyFile::default())
    }

    /// 정책 파일에서 생성 (사용자 패턴은 모든 수준에서 적용)
    pub fn from_file(file: &PolicyFile) -> Result<Self> {
        let mut patterns = builtin_patterns()?;
        for pattern in &file.validator.extra_blocked_patterns {
            patterns.push(BlockedPattern::new(
                pattern.clone(),
                PatternCategory::Custom,
                SecurityLevel::Low,
                pattern,
            )?);
        }

        Ok(Self {
            level: file.level(),
            patterns,
            max_submission_bytes: file.validator.max_submission_kb * 1024,
            max_file_bytes: file.validator.max_file_kb * 1024,
            max_file_mode: file.max_file_mode()?,
        })
    }

    pub fn with_level(mut self, level: SecurityLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_max_submission_bytes(mut self, bytes: u64) -> Self {
        self.max_submission_bytes = bytes;
        self
    }

    pub fn with_pattern(mut self, pattern: BlockedPattern) -> Self {
        self.patterns.push(pattern);
        self
    }
}
