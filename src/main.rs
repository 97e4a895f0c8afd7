use clap::{Args, Parser, Subcommand};
use quantum_chat::config::{GenerationArgs, ModelArgs, ServeArgs};
use quantum_chat::{server, ModelManager, QwenLoader, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "quantum-chat")]
#[command(about = "Streaming chat server for a quantum computing assistant model")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Server options when no subcommand is given
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP chat server (default)
    Serve(ServeArgs),
    /// Load the model, answer one message on stdout and exit
    Prompt(PromptArgs),
}

#[derive(Args)]
struct PromptArgs {
    message: String,

    #[command(flatten)]
    model: ModelArgs,

    #[command(flatten)]
    generation: GenerationArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let command = match cli.command {
        Some(command) => command,
        None => Commands::Serve(cli.serve),
    };

    match command {
        Commands::Serve(args) => server::serve(args).await?,
        Commands::Prompt(args) => run_prompt(args).await?,
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quantum_chat=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
}

async fn run_prompt(args: PromptArgs) -> Result<()> {
    let generation = args.generation.to_config()?;
    let loader = Arc::new(QwenLoader::new(args.model.source(), args.model.device));
    let manager = ModelManager::new(loader, generation);

    if let Some(loading) = manager.start_loading().await {
        loading.await?;
    }
    if let Some(error) = manager.status().await.model_error {
        anyhow::bail!("Model failed to load: {}", error);
    }

    let response = manager.complete(&args.message).await?;
    println!("{}", response);
    Ok(())
}
