//! Subcommand implementations

use anyhow::{bail, Context};
use arena_foundation::{LanguageVariant, PolicyFile, RunConfig, SecurityLevel};
use arena_sandbox::{
    discover, validate_with, ContainerProvider, IsolationProvider, OutputValidator,
    ProcessProvider, ReferenceStats, SecurityPolicy, Submission, ValidationOutcome,
};
use arena_tournament::{BatchOrchestrator, RunMetadata, TournamentReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ProviderKind;

/// `arena run` 옵션
#[derive(Debug)]
pub struct RunOptions {
    pub config: PathBuf,
    pub policy: PathBuf,
    pub submissions: PathBuf,
    pub output: Option<PathBuf>,
    pub provider: ProviderKind,
    pub runtime: String,
    pub images: Vec<String>,
    pub jobs: Option<usize>,
    pub iterations: Option<u32>,
    pub verify: bool,
}

/// 전체 배치 실행
///
/// 반환값은 프로세스 종료 코드 성공 여부
pub async fn run_batch(opts: RunOptions) -> anyhow::Result<bool> {
    let mut config = RunConfig::load(&opts.config);
    if let Some(jobs) = opts.jobs {
        config = config.with_max_concurrency(jobs);
    }
    if let Some(iterations) = opts.iterations {
        config = config.with_iterations(iterations);
    }
    if opts.verify {
        config.verify_results = true;
    }
    config.sanitize();

    let policy = PolicyFile::load(&opts.policy)
        .with_context(|| format!("loading security policy {}", opts.policy.display()))?;

    let provider = build_provider(&opts, &config)?;
    let orchestrator = BatchOrchestrator::new(provider, &config, &policy)?;

    let submissions = discover(&opts.submissions).with_context(|| {
        format!("discovering submissions in {}", opts.submissions.display())
    })?;
    if submissions.is_empty() {
        warn!(root = %opts.submissions.display(), "No submissions found");
    }

    let metadata = RunMetadata::start(&orchestrator);
    info!(
        run = %metadata.short_id(),
        provider = orchestrator.provider_name(),
        pool = orchestrator.pool_size(),
        "Tournament starting"
    );

    let results = tokio::select! {
        results = orchestrator.run(submissions) => results?,
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted, remaining executions were aborted");
        }
    };

    let report = TournamentReport::build(metadata.finish(), &results);
    let path = opts.output.unwrap_or_else(default_report_path);
    report
        .write_json(&path)
        .await
        .with_context(|| format!("writing report {}", path.display()))?;

    println!("{}", report.summary());
    println!("Report: {}", path.display());
    Ok(true)
}

fn build_provider(
    opts: &RunOptions,
    config: &RunConfig,
) -> anyhow::Result<Arc<dyn IsolationProvider>> {
    let work_root = config.work_root();
    let provider: Arc<dyn IsolationProvider> = match opts.provider {
        ProviderKind::Process => Arc::new(ProcessProvider::new(work_root)),
        ProviderKind::Container => {
            let mut provider = ContainerProvider::new(work_root).with_runtime(&opts.runtime);
            for spec in &opts.images {
                let (language, image) = parse_image_override(spec)?;
                provider = provider.with_image(language, image);
            }
            Arc::new(provider)
        }
    };
    Ok(provider)
}

/// `python=python:3.12-slim` 형식
fn parse_image_override(spec: &str) -> anyhow::Result<(LanguageVariant, String)> {
    let Some((language, image)) = spec.split_once('=') else {
        bail!("image override '{}' must be LANG=IMAGE", spec);
    };
    let image = image.trim();
    if image.is_empty() {
        bail!("image override '{}' has an empty image", spec);
    }
    Ok((language.parse()?, image.to_string()))
}

fn default_report_path() -> PathBuf {
    PathBuf::from("results").join(format!(
        "results_{}.json",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ))
}

/// 보안 검증만 수행
pub fn validate(
    path: &Path,
    language: LanguageVariant,
    policy: Option<&Path>,
    level: Option<SecurityLevel>,
    json: bool,
) -> anyhow::Result<bool> {
    let file = match policy {
        Some(path) => PolicyFile::load(path)
            .with_context(|| format!("loading security policy {}", path.display()))?,
        None => PolicyFile::default(),
    };
    let mut policy = SecurityPolicy::from_file(&file)?;
    if let Some(level) = level {
        policy = policy.with_level(level);
    }

    let submission = Submission::from_path(path, language)
        .with_context(|| format!("reading submission {}", path.display()))?;
    let outcome = validate_with(&submission, &policy);

    if json {
        let value = serde_json::json!({
            "participant": submission.participant,
            "language": submission.language,
            "level": policy.level,
            "passed": outcome.is_pass(),
            "violations": outcome.violations(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match &outcome {
            ValidationOutcome::Pass(validated) => {
                println!(
                    "✓ {} passed validation (level {}, entry {})",
                    submission.label(),
                    policy.level,
                    validated.entry().display()
                );
            }
            ValidationOutcome::Rejected(violations) => {
                println!("✗ {} rejected (level {})", submission.label(), policy.level);
                for violation in violations {
                    println!("  - {}", violation);
                }
            }
        }
    }

    Ok(outcome.is_pass())
}

/// 출력 파일 형식 검사 (선택적으로 정확도 비교)
pub fn check_output(
    file: &Path,
    threshold: f64,
    dataset: Option<&Path>,
    json: bool,
) -> anyhow::Result<bool> {
    let output =
        std::fs::read(file).with_context(|| format!("reading output {}", file.display()))?;
    let validator = OutputValidator::new(threshold);

    let report = match dataset {
        Some(dataset) => {
            let reference = ReferenceStats::from_path(dataset)
                .with_context(|| format!("reading dataset {}", dataset.display()))?;
            validator.validate_against(&output, &reference)
        }
        None => validator.validate(&output),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let marker = if report.passed { "✓" } else { "✗" };
        println!("{} {}", marker, report.summary());
        for warning in &report.warnings {
            println!("  ! {}", warning);
        }
        if report.suppressed_warnings > 0 {
            println!("  ... {} more warnings", report.suppressed_warnings);
        }
    }

    Ok(report.passed)
}

/// 데이터셋 기준 레코드 출력
pub fn reference(dataset: &Path) -> anyhow::Result<bool> {
    let reference = ReferenceStats::from_path(dataset)
        .with_context(|| format!("reading dataset {}", dataset.display()))?;

    for record in reference.to_records() {
        println!("{}", record);
    }
    if reference.malformed() > 0 {
        warn!(malformed = reference.malformed(), "Skipped malformed dataset lines");
    }
    info!(
        stations = reference.station_count(),
        measurements = reference.measurements(),
        "Reference computed"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_override() {
        let (language, image) = parse_image_override("python=python:3.12-slim").unwrap();
        assert_eq!(language, LanguageVariant::Python);
        assert_eq!(image, "python:3.12-slim");

        assert!(parse_image_override("python").is_err());
        assert!(parse_image_override("python=").is_err());
        assert!(parse_image_override("cobol=cobol:latest").is_err());
    }

    #[test]
    fn test_default_report_path() {
        let path = default_report_path();
        assert!(path.starts_with("results"));
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("results_"));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn test_validate_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("ok.py");
        std::fs::write(&ok, "if __name__ == \"__main__\":\n    print('hi')\n").unwrap();
        let bad = dir.path().join("bad.py");
        std::fs::write(&bad, "import socket\n\nif __name__ == \"__main__\":\n    pass\n").unwrap();

        assert!(validate(&ok, LanguageVariant::Python, None, None, true).unwrap());
        assert!(!validate(&bad, LanguageVariant::Python, None, None, false).unwrap());
    }

    #[test]
    fn test_check_output_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "Abha=-23.0/18.0/59.2\nBaku=-1.0/2.0/3.0\n").unwrap();
        let bad = dir.path().join("bad.txt");
        std::fs::write(&bad, "hello\nworld\n").unwrap();

        assert!(check_output(&good, 0.8, None, false).unwrap());
        assert!(!check_output(&bad, 0.8, None, true).unwrap());
    }
}
