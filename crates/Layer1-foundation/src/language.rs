//! Language Variants - 지원 언어별 규칙
//!
//! 확장자, 엔트리 포인트 감지, 컴파일/실행 명령, 컨테이너 이미지.
//! 명령 경로는 모두 실행 컨텍스트의 작업 디렉토리 기준 상대 경로다
//! (`src/` 소스, `build/` 빌드 산출물).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use crate::Error;

/// 빌드 산출물 바이너리 경로
pub const NATIVE_BINARY: &str = "build/solution";

/// 제출물 언어
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageVariant {
    Python,
    Java,
    Cpp,
    Go,
}

impl LanguageVariant {
    /// 탐색 순서 (도착 순서 결정)
    pub const ALL: [LanguageVariant; 4] = [Self::Python, Self::Java, Self::Cpp, Self::Go];

    /// `submissions/<dir>/` 디렉토리 이름
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::Go => "go",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Python => "Python",
            Self::Java => "Java",
            Self::Cpp => "C++",
            Self::Go => "Go",
        }
    }

    /// 소스 파일 확장자
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["py"],
            Self::Java => &["java"],
            Self::Cpp => &["cpp", "cc", "cxx", "hpp", "h"],
            Self::Go => &["go"],
        }
    }

    /// 컴파일 대상 확장자 (헤더 제외)
    fn compile_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Cpp => &["cpp", "cc", "cxx"],
            other => other.extensions(),
        }
    }

    pub fn is_source(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions().contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// 한 줄 주석 접두사
    pub fn comment_prefix(&self) -> &'static str {
        match self {
            Self::Python => "#",
            _ => "//",
        }
    }

    pub fn needs_compile(&self) -> bool {
        !matches!(self, Self::Python)
    }

    /// 엔트리 포인트 선언 형태 (진단 메시지용)
    pub fn entry_point_hint(&self) -> &'static str {
        match self {
            Self::Python => "if __name__ == \"__main__\":",
            Self::Java => "public static void main(String[] args)",
            Self::Cpp => "int main(...)",
            Self::Go => "func main() in package main",
        }
    }

    fn entry_regex(&self) -> &'static Regex {
        static PYTHON: OnceLock<Regex> = OnceLock::new();
        static JAVA: OnceLock<Regex> = OnceLock::new();
        static CPP: OnceLock<Regex> = OnceLock::new();
        static GO: OnceLock<Regex> = OnceLock::new();

        let (cell, pattern) = match self {
            Self::Python => (&PYTHON, r#"^\s*if\s+__name__\s*==\s*["']__main__["']\s*:"#),
            Self::Java => (
                &JAVA,
                r"\bpublic\s+static\s+(final\s+)?void\s+main\s*\(\s*(final\s+)?String",
            ),
            Self::Cpp => (&CPP, r"^\s*(int|auto)\s+main\s*\("),
            Self::Go => (&GO, r"^\s*func\s+main\s*\(\s*\)"),
        };
        cell.get_or_init(|| Regex::new(pattern).expect("static entry point pattern"))
    }

    fn go_package_main() -> &'static Regex {
        static PACKAGE: OnceLock<Regex> = OnceLock::new();
        PACKAGE.get_or_init(|| Regex::new(r"^\s*package\s+main\b").expect("static package pattern"))
    }

    /// 소스 텍스트 안의 엔트리 포인트 개수 (주석 줄 제외)
    pub fn count_entry_points(&self, source: &str) -> usize {
        let prefix = self.comment_prefix();
        let code_lines = || {
            source
                .lines()
                .filter(move |line| !line.trim_start().starts_with(prefix))
        };

        if matches!(self, Self::Go) && !code_lines().any(|l| Self::go_package_main().is_match(l)) {
            return 0;
        }

        let regex = self.entry_regex();
        code_lines().filter(|line| regex.is_match(line)).count()
    }

    /// 컴파일 명령 (인터프리터 언어는 None)
    ///
    /// `sources`는 작업 디렉토리 기준 상대 경로 (`src/...`).
    pub fn compile_command(&self, sources: &[String]) -> Option<Vec<String>> {
        let units: Vec<String> = sources
            .iter()
            .filter(|s| {
                Path::new(s.as_str())
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| self.compile_extensions().contains(&e))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut argv: Vec<String> = match self {
            Self::Python => return None,
            Self::Java => vec!["javac".into(), "-d".into(), "build".into()],
            Self::Cpp => vec![
                "g++".into(),
                "-std=c++20".into(),
                "-O2".into(),
                "-o".into(),
                NATIVE_BINARY.into(),
            ],
            Self::Go => vec!["go".into(), "build".into(), "-o".into(), NATIVE_BINARY.into()],
        };
        argv.extend(units);
        Some(argv)
    }

    /// 실행 명령
    ///
    /// `entry`는 엔트리 포인트 파일의 상대 경로 (`src/...`), `memory_mb`는 JVM 힙 계산용.
    pub fn run_command(&self, entry: &str, memory_mb: u64) -> Vec<String> {
        match self {
            Self::Python => vec!["python3".into(), entry.into()],
            Self::Java => {
                let class = Path::new(entry)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("Solution")
                    .to_string();
                // 힙은 메모리 상한의 3/4 (JVM 자체 오버헤드 여유)
                let heap = (memory_mb * 3 / 4).max(16);
                vec![
                    "java".into(),
                    format!("-Xmx{}m", heap),
                    "-cp".into(),
                    "build".into(),
                    class,
                ]
            }
            Self::Cpp | Self::Go => vec![format!("./{}", NATIVE_BINARY)],
        }
    }

    /// 컨테이너 격리 시 기본 이미지
    pub fn default_image(&self) -> &'static str {
        match self {
            Self::Python => "python:3.12-slim",
            Self::Java => "eclipse-temurin:21",
            Self::Cpp => "gcc:13",
            Self::Go => "golang:1.22",
        }
    }
}

impl fmt::Display for LanguageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for LanguageVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "java" => Ok(Self::Java),
            "cpp" | "c++" | "cxx" => Ok(Self::Cpp),
            "go" | "golang" => Ok(Self::Go),
            other => Err(Error::InvalidInput(format!("unsupported language '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language() {
        assert_eq!("C++".parse::<LanguageVariant>().unwrap(), LanguageVariant::Cpp);
        assert_eq!("golang".parse::<LanguageVariant>().unwrap(), LanguageVariant::Go);
        assert!("rust".parse::<LanguageVariant>().is_err());
    }

    #[test]
    fn test_python_entry_point() {
        let src = "import sys\n\ndef main():\n    pass\n\nif __name__ == '__main__':\n    main()\n";
        assert_eq!(LanguageVariant::Python.count_entry_points(src), 1);

        let commented = "# if __name__ == \"__main__\":\nprint(1)\n";
        assert_eq!(LanguageVariant::Python.count_entry_points(commented), 0);
    }

    #[test]
    fn test_java_entry_point() {
        let src = "public class Solution {\n    public static void main(String[] args) {\n    }\n}\n";
        assert_eq!(LanguageVariant::Java.count_entry_points(src), 1);
    }

    #[test]
    fn test_cpp_entry_point() {
        let src = "#include <cstdio>\nint main(int argc, char** argv) {\n    return 0;\n}\n";
        assert_eq!(LanguageVariant::Cpp.count_entry_points(src), 1);
        assert_eq!(LanguageVariant::Cpp.count_entry_points("int helper() {}\n"), 0);
    }

    #[test]
    fn test_go_entry_requires_package_main() {
        let ok = "package main\n\nfunc main() {\n}\n";
        assert_eq!(LanguageVariant::Go.count_entry_points(ok), 1);

        let lib = "package stats\n\nfunc main() {\n}\n";
        assert_eq!(LanguageVariant::Go.count_entry_points(lib), 0);
    }

    #[test]
    fn test_compile_command_filters_headers() {
        let sources = vec!["src/solution.cpp".to_string(), "src/util.hpp".to_string()];
        let argv = LanguageVariant::Cpp.compile_command(&sources).unwrap();
        assert_eq!(argv[0], "g++");
        assert!(argv.contains(&"src/solution.cpp".to_string()));
        assert!(!argv.contains(&"src/util.hpp".to_string()));
        assert!(LanguageVariant::Python.compile_command(&sources).is_none());
    }

    #[test]
    fn test_run_commands() {
        assert_eq!(
            LanguageVariant::Python.run_command("src/solution.py", 2048),
            vec!["python3", "src/solution.py"]
        );
        assert_eq!(
            LanguageVariant::Java.run_command("src/Solution.java", 2048),
            vec!["java", "-Xmx1536m", "-cp", "build", "Solution"]
        );
        assert_eq!(
            LanguageVariant::Go.run_command("src/main.go", 2048),
            vec!["./build/solution"]
        );
    }
}
