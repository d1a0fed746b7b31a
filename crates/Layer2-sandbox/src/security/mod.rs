//! Security - 제출물 정적 검증
//!
//! ## 검증 항목
//! - 차단 패턴 (프로세스 생성, 네트워크, 샌드박스 밖 파일 접근, 동적 코드 로딩, 네이티브 탈출)
//! - 언어별 구조 요구사항 (엔트리 포인트 정확히 하나)
//! - 크기 상한 (파일별, 전체)
//! - 권한 비트 (setuid/setgid/sticky, 최대 모드)
//!
//! ## 사용 예시
//! ```rust,ignore
//! let validator = SecurityValidator::new(SecurityPolicy::from_file(&policy_file)?);
//!
//! match validator.validate(&submission) {
//!     ValidationOutcome::Pass(validated) => { /* execute */ }
//!     ValidationOutcome::Rejected(violations) => { /* record */ }
//! }
//! ```

mod patterns;
mod policy;
mod validator;

pub use patterns::{builtin_patterns, BlockedPattern, PatternCategory};
pub use policy::SecurityPolicy;
pub use validator::{
    validate_with, SecurityValidator, ValidatedSubmission, ValidationOutcome, Violation,
    ViolationKind,
};
