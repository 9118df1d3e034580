use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use vantage::{
    Engine, EngineConfig, EnvId, MergeAttributes, NodeResult, Program, Value, WriteMode, WritePosition,
};

#[derive(Parser)]
#[command(name = "vantage")]
#[command(about = "Run compiled constraint programs on the incremental engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compiled program and print its outputs as JSON
    Run {
        /// Path to the program (JSON)
        program: PathBuf,
        /// Engine configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Scripted writes (JSON array), each followed by a change cycle
        #[arg(long)]
        writes: Option<PathBuf>,
        /// Maximum change cycles per step
        #[arg(long, default_value = "16")]
        cycles: usize,
        /// Print per-node timings to stderr
        #[arg(long)]
        profile: bool,
    },
    /// Dump the node tree behind an output
    Explain {
        /// Path to the program (JSON)
        program: PathBuf,
        /// Output to explain (all outputs if omitted)
        #[arg(long)]
        output: Option<String>,
        /// Print indented text instead of JSON
        #[arg(long)]
        text: bool,
    },
    /// Validate a program without running it
    Check {
        /// Path to the program (JSON)
        program: PathBuf,
    },
}

/// One entry of a `--writes` script.
#[derive(Debug, Deserialize)]
struct ScriptedWrite {
    /// Function node id of a `state` node
    node: u32,
    value: NodeResult,
    #[serde(default)]
    mode: WriteMode,
    #[serde(default)]
    attributes: Option<MergeAttributes>,
    #[serde(default)]
    positions: Option<Vec<WritePosition>>,
}

fn main() -> Result<()> {
    // warnings by default, RUST_LOG overrides
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            program,
            config,
            writes,
            cycles,
            profile,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => EngineConfig::default(),
            };
            config.profile |= profile;
            run(&program, config, writes.as_deref(), cycles)?;
        }
        Commands::Explain { program, output, text } => {
            explain(&program, output.as_deref(), text)?;
        }
        Commands::Check { program } => {
            let program = load_program(&program)?;
            let nodes = program.nodes.len();
            let graph = vantage::FunctionGraph::new(program)?;
            println!(
                "ok: {} function nodes, {} outputs",
                nodes,
                graph.outputs().len()
            );
        }
    }

    Ok(())
}

fn load_program(path: &Path) -> Result<Program> {
    let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Program::from_json(&source).with_context(|| format!("parsing {}", path.display()))
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&source).with_context(|| format!("parsing {}", path.display()))
}

fn run(program: &Path, config: EngineConfig, writes: Option<&Path>, cycles: usize) -> Result<()> {
    let profile = config.profile;
    let mut engine = Engine::new(load_program(program)?, config)?;
    engine.observe_all_outputs()?;

    let mut reports = engine.run_until_stable(cycles);

    if let Some(path) = writes {
        let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let script: Vec<ScriptedWrite> =
            serde_json::from_str(&source).with_context(|| format!("parsing {}", path.display()))?;
        for write in script {
            let node = engine.node_for(write.node, EnvId::ROOT)?;
            let changed = engine.write(
                node,
                write.value,
                write.mode,
                write.attributes,
                write.positions.as_deref(),
            )?;
            log::info!("write to function node {}: changed={}", write.node, changed);
            reports.extend(engine.run_until_stable(cycles));
        }
    }

    let mut outputs = serde_json::Map::new();
    let names: Vec<(String, vantage::NodeId)> = engine
        .observed_outputs()
        .map(|(name, id)| (name.to_string(), id))
        .collect();
    for (name, id) in names {
        let values = engine.read(id)?;
        outputs.insert(name, values_to_json(&values));
    }

    let report = json!({
        "outputs": outputs,
        "cycles": reports,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if profile {
        for (id, entry) in engine.profile().hottest().into_iter().take(20) {
            eprintln!(
                "{} evals={} eval={:?} inform={:?}",
                id, entry.evaluations, entry.eval_time, entry.inform_time
            );
        }
    }
    Ok(())
}

fn explain(program: &Path, output: Option<&str>, text: bool) -> Result<()> {
    let mut engine = Engine::new(load_program(program)?, EngineConfig::default())?;
    engine.observe_all_outputs()?;
    engine.run_until_stable(16);

    let selected: Vec<(String, vantage::NodeId)> = engine
        .observed_outputs()
        .filter(|(name, _)| output.is_none_or(|wanted| wanted == *name))
        .map(|(name, id)| (name.to_string(), id))
        .collect();
    if let (Some(wanted), true) = (output, selected.is_empty()) {
        anyhow::bail!("no output named '{}'", wanted);
    }

    if text {
        for (name, id) in selected {
            println!("{}:", name);
            print!("{}", engine.to_full_string(id));
        }
    } else {
        let mut dump = serde_json::Map::new();
        for (name, id) in selected {
            dump.insert(name, engine.explain(id)?);
        }
        println!("{}", serde_json::to_string_pretty(&dump)?);
    }
    Ok(())
}

/// Plain JSON rendering: single elements print bare, sequences as arrays.
fn values_to_json(values: &[Value]) -> serde_json::Value {
    match values {
        [single] => value_to_json(single),
        _ => serde_json::Value::Array(values.iter().map(value_to_json).collect()),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Number(n) => json!(n),
        Value::Text(s) => json!(s.as_ref()),
        Value::Bool(b) => json!(b),
        Value::Opaque(id) => json!({ "opaque": id }),
        Value::Projector => json!("_"),
        Value::Object(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(name, os)| (name.to_string(), values_to_json(os)))
                .collect(),
        ),
    }
}
