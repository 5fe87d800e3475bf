use std::path::PathBuf;
use std::process::ExitCode;

use agent_fuzz::{Config, HarnessGenerator, Project};
use clap::{Parser, ValueEnum};
use eyre::Result;

#[derive(Debug, Clone, ValueEnum)]
enum Language {
    /// C/C++ with clang and libFuzzer
    Cpp,
}

/// Agentic fuzz-harness generation for native libraries.
#[derive(Parser, Debug)]
#[command(name = "agent-fuzz", version, about, long_about = None)]
struct Cli {
    /// Target language of the project.
    #[arg(long, value_enum, default_value = "cpp")]
    language: Language,
    /// Workspace directory for state, harnesses and logs.
    #[arg(long)]
    workdir: PathBuf,
    /// Project configuration file, YAML format.
    #[arg(long)]
    config: PathBuf,
    /// Resume from `state/latest.json` if it exists.
    #[arg(long, default_value = "false")]
    resume: bool,
    /// Seed for every stochastic choice of the run.
    #[arg(long, default_value = "1024")]
    seed: u64,
    /// Restrict the API universe to the compilable subset before the run.
    #[arg(long, default_value = "false")]
    precheck: bool,
    /// Worker count for the parallel coverage collection.
    #[arg(long)]
    batch_size: Option<usize>,
}

fn run(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.workdir)?;
    agent_fuzz::init_logger(Some(&cli.workdir), "info")?;

    let config = Config::load_from_yaml(&cli.config)?;
    let Language::Cpp = cli.language;
    let project = Project::new(config, &cli.workdir.join("tags"));

    let apis = match cli.precheck {
        true => project.precheck(&cli.workdir, Some(&cli.workdir.join("precheck.log")))?,
        false => project.listup_apis()?,
    };
    let types = project.listup_types()?;
    log::info!(
        "target {}: {} APIs, {} types",
        project.config.name,
        apis.len(),
        types.len()
    );

    let mut generator = HarnessGenerator::new(
        &project.config,
        &cli.workdir,
        &project.compiler,
        &project.parser,
        project.tags.as_ref(),
        apis,
        types,
        cli.resume,
    )?
    .with_seed(cli.seed);
    if let Some(batch_size) = cli.batch_size {
        generator = generator.with_batch_size(batch_size);
    }
    generator.run()
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("harness generation failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
