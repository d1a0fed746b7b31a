//! Arena CLI - Main entry point

mod cli;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_foundation::{LanguageVariant, SecurityLevel, POLICY_FILE, RUN_CONFIG_FILE};

/// Arena - sandboxed execution and ranking of challenge submissions
#[derive(Parser, Debug)]
#[command(name = "arena")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

/// 격리 프리미티브 선택
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// 컨테이너 런타임 CLI (docker, podman)
    Container,
    /// 프로세스 그룹 + cgroup v2 + 네트워크 namespace
    ///
    /// 파일시스템과 PID 공간, uid는 호스트와 공유한다. 신뢰된 로컬 실행 전용
    Process,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate, execute and rank every submission
    Run {
        /// Run configuration
        #[arg(short, long, default_value = RUN_CONFIG_FILE)]
        config: PathBuf,

        /// Security policy (required to exist)
        #[arg(short, long, default_value = POLICY_FILE)]
        policy: PathBuf,

        /// Submissions root (`<root>/<language>/...`)
        #[arg(short, long, default_value = "submissions")]
        submissions: PathBuf,

        /// Report path (default: results/results_<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Isolation primitive
        #[arg(long, value_enum, default_value_t = ProviderKind::Container)]
        provider: ProviderKind,

        /// Container runtime binary
        #[arg(long, default_value = "docker")]
        runtime: String,

        /// Container image override, e.g. `python=python:3.12-slim`
        #[arg(long = "image", value_name = "LANG=IMAGE")]
        images: Vec<String>,

        /// Cap on concurrent executions
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Executions per submission
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Compare output with reference statistics of the dataset
        #[arg(long)]
        verify: bool,
    },

    /// Run only the security validator on one submission
    Validate {
        /// Source file or submission directory
        path: PathBuf,

        /// Language variant (python, java, cpp, go)
        #[arg(short, long)]
        language: LanguageVariant,

        /// Security policy (built-in defaults when absent)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Override the policy's strictness level
        #[arg(long)]
        level: Option<SecurityLevel>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a captured output file against the record format
    CheckOutput {
        /// Output file
        file: PathBuf,

        /// Acceptance threshold (0.0 - 1.0)
        #[arg(short, long, default_value_t = 0.80)]
        threshold: f64,

        /// Dataset for correctness verification
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print reference records computed from a dataset
    Reference {
        /// Dataset (`station=temperature` per line)
        dataset: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let passed = match args.command {
        Command::Run {
            config,
            policy,
            submissions,
            output,
            provider,
            runtime,
            images,
            jobs,
            iterations,
            verify,
        } => {
            cli::run_batch(cli::RunOptions {
                config,
                policy,
                submissions,
                output,
                provider,
                runtime,
                images,
                jobs,
                iterations,
                verify,
            })
            .await
        }
        Command::Validate {
            path,
            language,
            policy,
            level,
            json,
        } => cli::validate(&path, language, policy.as_deref(), level, json),
        Command::CheckOutput {
            file,
            threshold,
            dataset,
            json,
        } => cli::check_output(&file, threshold, dataset.as_deref(), json),
        Command::Reference { dataset } => cli::reference(&dataset),
    }?;

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
