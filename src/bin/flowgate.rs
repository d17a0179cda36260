use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use flowgate::compiler::load_definition;
use flowgate::config::EngineConfig;
use flowgate::runtime::redis_recorder::RedisStateRecorder;
use flowgate::runtime::{Engine, result_channel};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow definition once and print its result
    Run {
        /// Path to the definition file (YAML or JSON)
        #[arg(long, short)]
        file: PathBuf,

        /// Input attributes (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        /// Engine config file (YAML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Record steps and snapshots to this Redis server
        #[arg(long)]
        redis: Option<String>,
    },

    /// Compile a flow definition and report errors
    Validate {
        /// Path to the definition file (YAML or JSON)
        #[arg(long, short)]
        file: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            vars,
            config,
            redis,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_yaml_file(path)?,
                None => EngineConfig::default(),
            }
            .apply_env()?;

            let mut engine = Engine::with_defaults(config);
            if let Some(url) = redis {
                let client = redis::Client::open(url.as_str()).with_context(|| format!("Invalid Redis URL {}", url))?;
                engine = engine.with_recorder(Arc::new(RedisStateRecorder::new(client)));
            }

            let rep = load_definition(&file)?;
            let flow_uri = format!("local://{}", rep.name);
            engine.register_definition(&flow_uri, &rep)?;

            let (handler, mut results) = result_channel();
            let inputs: HashMap<_, _> = vars.into_iter().collect();
            let instance_id = engine.start(&flow_uri, inputs, handler)?;
            info!(instance_id = %instance_id, "Flow started");

            let result = results
                .next_result()
                .await
                .ok_or_else(|| anyhow!("Flow finished without a result"))?;
            let attrs = result?;
            println!("{}", serde_json::to_string_pretty(&attrs)?);
        }

        Commands::Validate { file } => {
            let engine = Engine::with_defaults(EngineConfig::default());
            let rep = load_definition(&file)?;
            let definition = engine
                .compile(&rep)
                .with_context(|| format!("Invalid definition {}", file.display()))?;
            println!(
                "{}: {} tasks, {} links, model {}",
                definition.name,
                definition.tasks.len(),
                definition.links.len(),
                definition.model_id
            );
        }
    }

    Ok(())
}
