mod demo;
mod output;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;
use workflow_engine::prelude::*;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "workflow-engine")]
#[command(about = "DAG workflow orchestration engine")]
#[command(version)]
struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    output: String,

    /// Postgres connection string; instance commands require it
    #[arg(long, env = "WORKFLOW_ENGINE_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file without running it
    Validate {
        /// Path to a YAML or JSON workflow definition
        path: PathBuf,
    },

    /// Run one of the engine's built-in demo scenarios to completion
    Demo {
        /// linear | diamond | retry | compensation | pause-resume | global-timeout
        scenario: String,
    },

    /// Inspect or control a previously started instance
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
}

#[derive(Subcommand)]
enum InstanceCommand {
    /// Print the current status and progress of an instance
    Get { instance_id: Uuid },
    /// Pause a running instance
    Pause { instance_id: Uuid },
    /// Resume a paused instance
    Resume { instance_id: Uuid },
    /// Cancel a running or paused instance
    Cancel { instance_id: Uuid },
}

fn load_definition(path: &PathBuf) -> anyhow::Result<WorkflowDefinition> {
    let raw = fs::read_to_string(path)?;
    let definition: WorkflowDefinition =
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
    definition.validate()?;
    Ok(definition)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let output = OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Validate { path } => run_validate(&path, output),
        Commands::Demo { scenario } => run_demo(&scenario, output).await,
        Commands::Instance { command } => run_instance(command, cli.database_url, output).await,
    }
}

fn run_validate(path: &PathBuf, output: OutputFormat) -> anyhow::Result<()> {
    match load_definition(path) {
        Ok(definition) => {
            if output.is_text() {
                output::print_field("name", &definition.name);
                output::print_field("steps", &definition.steps.len().to_string());
                output::print_field("mode", &format!("{:?}", definition.mode));
                println!("definition is valid");
            } else {
                output.print_value(&definition);
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("definition is invalid: {err}");
            std::process::exit(1);
        }
    }
}

async fn run_demo(scenario: &str, output: OutputFormat) -> anyhow::Result<()> {
    let demo::Scenario {
        definition,
        registry,
        input,
        pause_after_steps,
    } = demo::build(scenario)?;

    let definition_name = definition.name.clone();
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(Engine::new(EngineConfig::default(), store, registry));
    engine.register_definition(definition);

    let instance = if let Some(after) = pause_after_steps {
        run_pause_resume_demo(engine, &definition_name, input, after).await?
    } else {
        Arc::clone(&engine)
            .run_to_completion(&definition_name, input)
            .await?
    };

    if output.is_text() {
        output::print_field("instance", &instance.id.to_string());
        output::print_field("status", &instance.status.to_string());
        output::print_field("context", &serde_json::to_string(&instance.context)?);
    } else {
        output.print_value(&instance);
    }
    Ok(())
}

async fn run_pause_resume_demo(
    engine: Arc<Engine<InMemoryStore>>,
    definition_name: &str,
    input: Context,
    after_steps: usize,
) -> anyhow::Result<Instance> {
    let instance_id = Arc::clone(&engine).start(definition_name, input).await?;

    loop {
        let snapshot = engine.get_instance(instance_id).await?;
        if snapshot.progress.0 >= after_steps || snapshot.instance.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.pause(instance_id).await?;

    loop {
        let snapshot = engine.get_instance(instance_id).await?;
        if snapshot.instance.status == InstanceStatus::Paused || snapshot.instance.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Arc::clone(&engine).resume(instance_id).await?;

    loop {
        let snapshot = engine.get_instance(instance_id).await?;
        if snapshot.instance.status.is_terminal() {
            return Ok(snapshot.instance);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run_instance(
    command: InstanceCommand,
    database_url: Option<String>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let Some(database_url) = database_url else {
        anyhow::bail!(
            "instance commands require --database-url (or WORKFLOW_ENGINE_DATABASE_URL)"
        );
    };
    let pool = sqlx::PgPool::connect(&database_url).await?;
    let store = Arc::new(PostgresStore::new(pool));
    store.run_migrations().await?;
    let engine = Arc::new(Engine::new(EngineConfig::default(), store, StepRegistry::new()));

    match command {
        InstanceCommand::Get { instance_id } => {
            let snapshot = engine.get_instance(instance_id).await?;
            if output.is_text() {
                output::print_field("instance", &snapshot.instance.id.to_string());
                output::print_field("status", &snapshot.instance.status.to_string());
                output::print_field(
                    "progress",
                    &format!("{}/{}", snapshot.progress.0, snapshot.progress.1),
                );
            } else {
                output.print_value(&snapshot.instance);
            }
        }
        InstanceCommand::Pause { instance_id } => {
            engine.pause(instance_id).await?;
            println!("pause requested for {instance_id}");
        }
        InstanceCommand::Resume { instance_id } => {
            engine.resume(instance_id).await?;
            println!("resume requested for {instance_id}");
        }
        InstanceCommand::Cancel { instance_id } => {
            engine.cancel(instance_id).await?;
            println!("cancel requested for {instance_id}");
        }
    }
    Ok(())
}
