//! TileOpt Command Line Interface
//!
//! Usage:
//!   tileopt [OPTIONS] <graph.json>
//!   tileopt --help
//!
//! Examples:
//!   tileopt chain.json                         # Search merges with defaults
//!   tileopt --target=npu.json chain.json       # Custom memory hierarchy
//!   tileopt --preset=quick --emit=json chain.json
//!   tileopt --no-merge --emit=buffers chain.json

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, info};
use std::fs;
use std::path::PathBuf;
use tileopt::buffer::{DdrBufferScheduler, Module};
use tileopt::config::SchedulerConfig;
use tileopt::graph::DataflowGraph;
use tileopt::mcts::GraphSolution;
use tileopt::solver::{SearchBudget, SolverBackend};
use tileopt::target::TargetOptions;

/// TileOpt - tile scheduling for neural-network kernels
#[derive(Parser, Debug)]
#[command(name = "tileopt")]
#[command(author = "TileOpt Contributors")]
#[command(version)]
#[command(about = "Tile sizing, fusion and buffer placement for tensor dataflow graphs", long_about = None)]
struct Cli {
    /// Dataflow graph (JSON)
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Target options (JSON); defaults to a 3-level L1/L2/DDR hierarchy
    #[arg(short, long, value_name = "FILE")]
    target: Option<PathBuf>,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Configuration preset
    #[arg(long, default_value = "default")]
    preset: Preset,

    /// Search iterations
    #[arg(long)]
    iterations: Option<usize>,

    /// Solver node budget per tree
    #[arg(long)]
    solver_nodes: Option<u64>,

    /// Tree solver backend
    #[arg(long)]
    solver: Option<SolverChoice>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Write diagnostic dumps to this directory
    #[arg(long, value_name = "DIR")]
    dump_dir: Option<PathBuf>,

    /// Solve the unmerged graph only
    #[arg(long)]
    no_merge: bool,

    /// What to emit
    #[arg(long, default_value = "tree")]
    emit: EmitKind,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress warnings)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    /// Few iterations, small solver budget
    Quick,
    /// Default settings
    Default,
    /// Many iterations, large solver budget
    Thorough,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SolverChoice {
    /// Z3 optimizer
    Smt,
    /// In-crate branch and bound
    BranchAndBound,
}

impl From<SolverChoice> for SolverBackend {
    fn from(choice: SolverChoice) -> Self {
        match choice {
            SolverChoice::Smt => SolverBackend::Smt,
            SolverChoice::BranchAndBound => SolverBackend::BranchAndBound,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitKind {
    /// Indented solved trees
    Tree,
    /// Solved trees as JSON
    Json,
    /// Outer-memory buffer offsets as JSON
    Buffers,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    info!("TileOpt v{}", tileopt::VERSION);
    debug!("Input file: {:?}", cli.input);

    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read graph file: {:?}", cli.input))?;
    let graph = DataflowGraph::from_json(&text).with_context(|| "Failed to load dataflow graph")?;

    let target = match &cli.target {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read target file: {:?}", path))?;
            TargetOptions::from_json(&text).with_context(|| "Failed to load target options")?
        }
        None => TargetOptions::default(),
    };

    let config = build_config(&cli);
    debug!("Scheduler config: {:?}", config);

    let name = graph.name.clone();
    let solution = if cli.no_merge {
        info!("Solving unmerged graph...");
        tileopt::solve_unmerged(graph, &target, &config)?
    } else {
        info!("Searching merges...");
        let outcome = tileopt::schedule_graph(graph, &target, &config)?;
        for mp in &outcome.merges {
            info!("merged {}", mp);
        }
        outcome.solution
    };
    if !solution.is_optimal() {
        log::warn!("solver budget exhausted on at least one tree; result may be suboptimal");
    }

    let output = emit(&cli, &config, &name, &solution)?;
    write_output(&cli.output, &output)
}

fn build_config(cli: &Cli) -> SchedulerConfig {
    let mut config = match cli.preset {
        Preset::Quick => SchedulerConfig::quick(),
        Preset::Default => SchedulerConfig::default(),
        Preset::Thorough => SchedulerConfig::thorough(),
    };

    // Override with CLI flags
    if let Some(iterations) = cli.iterations {
        config = config.search_iterations(iterations);
    }
    if let Some(nodes) = cli.solver_nodes {
        let budget = SearchBudget {
            node_limit: nodes,
            ..config.solver_budget.clone()
        };
        config = config.solver_budget(budget);
    }
    if let Some(solver) = cli.solver {
        config = config.solver_backend(solver.into());
    }
    if let Some(seed) = cli.seed {
        config = config.seed(seed);
    }
    if let Some(dir) = &cli.dump_dir {
        config = config.dump_dir(dir);
    }
    config
}

fn emit(cli: &Cli, config: &SchedulerConfig, name: &str, solution: &GraphSolution) -> Result<String> {
    Ok(match cli.emit {
        EmitKind::Tree => solution.render(),
        EmitKind::Json => serde_json::to_string_pretty(solution)?,
        EmitKind::Buffers => {
            let mut module = Module {
                functions: vec![solution.to_function(name, "default")],
            };
            DdrBufferScheduler::new(config.alignment).run(&mut module)?;
            serde_json::to_string_pretty(&module)?
        }
    })
}

fn write_output(path: &Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(p) => {
            fs::write(p, content)
                .with_context(|| format!("Failed to write output file: {:?}", p))?;
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}
