//! Built-in blocked patterns
//!
//! 각 패턴은 최소 적용 수준을 가진다. 설정된 수준이 패턴 수준 이상일 때만 검사한다.
//!
//! | Category     | Level   |
//! |--------------|---------|
//! | ProcessSpawn | low     |
//! | Network      | low     |
//! | Filesystem   | medium  |
//! | DynamicCode  | high    |
//! | Unsafe       | maximum |

use arena_foundation::{LanguageVariant, Result, SecurityLevel};
use regex::Regex;
use serde::Serialize;
use std::fmt;

use LanguageVariant::{Cpp, Go, Java, Python};

/// 패턴 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    ProcessSpawn,
    Network,
    Filesystem,
    DynamicCode,
    Unsafe,
    Custom,
}

impl PatternCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ProcessSpawn => "process spawn",
            Self::Network => "network access",
            Self::Filesystem => "filesystem escape",
            Self::DynamicCode => "dynamic code loading",
            Self::Unsafe => "native escape hatch",
            Self::Custom => "policy pattern",
        }
    }
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// 차단 패턴 하나
#[derive(Debug, Clone)]
pub struct BlockedPattern {
    pub name: String,
    pub category: PatternCategory,
    pub level: SecurityLevel,
    /// None이면 모든 언어에 적용
    pub languages: Option<Vec<LanguageVariant>>,
    regex: Regex,
}

impl BlockedPattern {
    pub fn new(
        name: impl Into<String>,
        category: PatternCategory,
        level: SecurityLevel,
        pattern: &str,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            category,
            level,
            languages: None,
            regex: Regex::new(pattern)?,
        })
    }

    /// 특정 언어로 제한
    pub fn for_languages(mut self, languages: &[LanguageVariant]) -> Self {
        self.languages = Some(languages.to_vec());
        self
    }

    pub fn applies_to(&self, language: LanguageVariant, level: SecurityLevel) -> bool {
        level >= self.level
            && self
                .languages
                .as_ref()
                .map(|langs| langs.contains(&language))
                .unwrap_or(true)
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

type Entry = (
    &'static str,
    PatternCategory,
    SecurityLevel,
    &'static [LanguageVariant],
    &'static str,
);

const ANY: &[LanguageVariant] = &[];

const BUILTIN: &[Entry] = &[
    // ========================================================================
    // Process spawn
    // ========================================================================
    ("subprocess", PatternCategory::ProcessSpawn, SecurityLevel::Low, &[Python], r"\bsubprocess\b"),
    (
        "os.system/popen/exec",
        PatternCategory::ProcessSpawn,
        SecurityLevel::Low,
        &[Python],
        r"\bos\.(system|popen|exec\w*|spawn\w*|fork\w*|posix_spawn\w*)\s*\(",
    ),
    ("pty.spawn", PatternCategory::ProcessSpawn, SecurityLevel::Low, &[Python], r"\bpty\.spawn\b"),
    (
        "Runtime.exec",
        PatternCategory::ProcessSpawn,
        SecurityLevel::Low,
        &[Java],
        r"Runtime\s*\.\s*getRuntime\s*\(\s*\)\s*\.\s*exec\b",
    ),
    ("ProcessBuilder", PatternCategory::ProcessSpawn, SecurityLevel::Low, &[Java], r"\bProcessBuilder\b"),
    (
        "system/fork/exec",
        PatternCategory::ProcessSpawn,
        SecurityLevel::Low,
        &[Cpp],
        r"\b(system|popen|fork|vfork|execl|execlp|execle|execv|execvp|execvpe|execve|posix_spawnp?)\s*\(",
    ),
    ("os/exec", PatternCategory::ProcessSpawn, SecurityLevel::Low, &[Go], r#""os/exec""#),
    (
        "syscall.Exec",
        PatternCategory::ProcessSpawn,
        SecurityLevel::Low,
        &[Go],
        r"\bsyscall\.(Exec|ForkExec|StartProcess)\b",
    ),
    ("os.StartProcess", PatternCategory::ProcessSpawn, SecurityLevel::Low, &[Go], r"\bos\.StartProcess\b"),
    // ========================================================================
    // Network
    // ========================================================================
    (
        "network module",
        PatternCategory::Network,
        SecurityLevel::Low,
        &[Python],
        concat!(
            r"(^|;)\s*(from\s+|import\s+([\w.]+(\s+as\s+\w+)?\s*,\s*)*)",
            r"(socket|socketserver|ssl|urllib\w*|http|requests|httpx|aiohttp|ftplib|smtplib|telnetlib)\b",
        ),
    ),
    (
        "network module",
        PatternCategory::Network,
        SecurityLevel::Low,
        &[Python],
        r#"\b(__import__|import_module)\s*\(\s*['"](socket|socketserver|ssl|urllib\w*|http|requests|httpx|aiohttp|ftplib|smtplib|telnetlib)\b"#,
    ),
    ("java.net", PatternCategory::Network, SecurityLevel::Low, &[Java], r"\bjava\.net\b"),
    (
        "socket channel",
        PatternCategory::Network,
        SecurityLevel::Low,
        &[Java],
        r"\b(SocketChannel|ServerSocketChannel|DatagramChannel)\b",
    ),
    (
        "socket headers",
        PatternCategory::Network,
        SecurityLevel::Low,
        &[Cpp],
        r"#\s*include\s*<(sys/socket|netinet/[\w.]+|arpa/inet|netdb|sys/un)(\.h)?>",
    ),
    ("net package", PatternCategory::Network, SecurityLevel::Low, &[Go], r#""net(/[\w/]+)?""#),
    ("/dev/tcp", PatternCategory::Network, SecurityLevel::Low, ANY, r"/dev/(tcp|udp)/"),
    // ========================================================================
    // Filesystem outside the sandbox
    // ========================================================================
    (
        "absolute system path",
        PatternCategory::Filesystem,
        SecurityLevel::Medium,
        ANY,
        r#"["'`](/etc|/proc|/sys|/dev|/root|/home|/boot|/var|/usr|/bin|/sbin|/lib)(/|["'`])"#,
    ),
    ("parent traversal", PatternCategory::Filesystem, SecurityLevel::Medium, ANY, r"\.\./"),
    (
        "destructive fs call",
        PatternCategory::Filesystem,
        SecurityLevel::Medium,
        &[Python],
        r"\b(shutil\.rmtree|os\.(remove|unlink|rmdir|removedirs|chmod|chown|chroot|symlink|link))\s*\(",
    ),
    (
        "destructive fs call",
        PatternCategory::Filesystem,
        SecurityLevel::Medium,
        &[Cpp],
        r"\b(unlink|rmdir|chmod|chown|chroot|symlink|remove_all)\s*\(",
    ),
    (
        "destructive fs call",
        PatternCategory::Filesystem,
        SecurityLevel::Medium,
        &[Go],
        r"\bos\.(Remove|RemoveAll|Chmod|Chown|Symlink|Link)\s*\(",
    ),
    (
        "destructive fs call",
        PatternCategory::Filesystem,
        SecurityLevel::Medium,
        &[Java],
        r"\bFiles\s*\.\s*(delete|deleteIfExists|setPosixFilePermissions|createSymbolicLink)\s*\(",
    ),
    // ========================================================================
    // Dynamic code loading
    // ========================================================================
    (
        "eval/exec",
        PatternCategory::DynamicCode,
        SecurityLevel::High,
        &[Python],
        r"(^|[^.\w])(eval|exec|compile)\s*\(",
    ),
    (
        "__import__/importlib",
        PatternCategory::DynamicCode,
        SecurityLevel::High,
        &[Python],
        r"\b(__import__\s*\(|importlib\b)",
    ),
    ("ctypes/cffi", PatternCategory::DynamicCode, SecurityLevel::High, &[Python], r"\b(ctypes|cffi)\b"),
    (
        "reflection loading",
        PatternCategory::DynamicCode,
        SecurityLevel::High,
        &[Java],
        r"\b(Class\s*\.\s*forName|URLClassLoader|defineClass|setAccessible)\b",
    ),
    ("script engine", PatternCategory::DynamicCode, SecurityLevel::High, &[Java], r"\bjavax\.script\b"),
    (
        "native library",
        PatternCategory::DynamicCode,
        SecurityLevel::High,
        &[Java],
        r"\bSystem\s*\.\s*(loadLibrary|load)\s*\(",
    ),
    ("dlopen", PatternCategory::DynamicCode, SecurityLevel::High, &[Cpp], r"\b(dlopen|dlsym|dlmopen)\s*\("),
    ("plugin", PatternCategory::DynamicCode, SecurityLevel::High, &[Go], r#""plugin""#),
    // ========================================================================
    // Unsafe / native escape hatches
    // ========================================================================
    ("sun.misc.Unsafe", PatternCategory::Unsafe, SecurityLevel::Maximum, &[Java], r"\bsun\.misc\.Unsafe\b"),
    ("native method", PatternCategory::Unsafe, SecurityLevel::Maximum, &[Java], r"\bnative\s+[\w<>\[\]]+\s+\w+\s*\("),
    (
        "inline asm",
        PatternCategory::Unsafe,
        SecurityLevel::Maximum,
        &[Cpp],
        r"\b(asm|__asm__|__asm)\b",
    ),
    (
        "raw syscall",
        PatternCategory::Unsafe,
        SecurityLevel::Maximum,
        &[Cpp],
        r"\b(syscall|ptrace|mprotect|prctl)\s*\(",
    ),
    ("unsafe/syscall", PatternCategory::Unsafe, SecurityLevel::Maximum, &[Go], r#""(unsafe|syscall)""#),
    ("cgo", PatternCategory::Unsafe, SecurityLevel::Maximum, &[Go], r#"^\s*import\s+"C""#),
];

/// 내장 차단 패턴 세트
pub fn builtin_patterns() -> Result<Vec<BlockedPattern>> {
    BUILTIN
        .iter()
        .map(|(name, category, level, languages, pattern)| {
            let blocked = BlockedPattern::new(*name, *category, *level, pattern)?;
            Ok(if languages.is_empty() {
                blocked
            } else {
                blocked.for_languages(languages)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(language: LanguageVariant, level: SecurityLevel, line: &str) -> Vec<String> {
        builtin_patterns()
            .unwrap()
            .into_iter()
            .filter(|p| p.applies_to(language, level) && p.is_match(line))
            .map(|p| p.name)
            .collect()
    }

    #[test]
    fn test_builtin_patterns_compile() {
        assert!(builtin_patterns().unwrap().len() > 20);
    }

    #[test]
    fn test_process_spawn() {
        assert_eq!(
            find(Python, SecurityLevel::Low, "import subprocess"),
            vec!["subprocess"]
        );
        assert!(!find(Java, SecurityLevel::Low, "Runtime.getRuntime().exec(cmd);").is_empty());
        assert!(!find(Cpp, SecurityLevel::Low, "  system(\"ls\");").is_empty());
        assert!(!find(Go, SecurityLevel::Low, "import \"os/exec\"").is_empty());
    }

    #[test]
    fn test_python_network_imports() {
        for line in [
            "import socket",
            "import os, socket",
            "import os.path as p, urllib.request",
            "import sys; import socket",
            "from http.client import HTTPConnection",
            "s = __import__(\"socket\")",
            "m = importlib.import_module('requests')",
        ] {
            assert!(
                find(Python, SecurityLevel::Low, line).contains(&"network module".to_string()),
                "not flagged: {}",
                line
            );
        }

        for line in [
            "import sockets_util",
            "import mypkg.http",
            "import os, sys",
            "x = 'import socket later'",
        ] {
            assert!(
                !find(Python, SecurityLevel::Low, line).contains(&"network module".to_string()),
                "flagged: {}",
                line
            );
        }
    }

    #[test]
    fn test_no_false_positive_on_common_code() {
        assert!(find(Python, SecurityLevel::Maximum, "pattern = re.compile(r'x')").is_empty());
        assert!(find(Cpp, SecurityLevel::Maximum, "std::filesystem::path p(\"data\");").is_empty());
        assert!(find(Python, SecurityLevel::Maximum, "with open('data/measurements.txt') as f:")
            .is_empty());
        assert!(find(Go, SecurityLevel::Maximum, "import \"bufio\"").is_empty());
    }

    #[test]
    fn test_level_gating() {
        let line = "eval(input())";
        assert!(find(Python, SecurityLevel::Medium, line).is_empty());
        assert_eq!(find(Python, SecurityLevel::High, line), vec!["eval/exec"]);

        let asm = "asm volatile(\"nop\");";
        assert!(find(Cpp, SecurityLevel::High, asm).is_empty());
        assert!(!find(Cpp, SecurityLevel::Maximum, asm).is_empty());
    }

    #[test]
    fn test_language_scoping() {
        assert!(find(Java, SecurityLevel::Maximum, "import subprocess").is_empty());
        assert!(!find(Java, SecurityLevel::Medium, "new File(\"/etc/passwd\")").is_empty());
    }
}
