use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use cortex_agent::MemoryAgent;
use cortex_config::{AppConfig, telemetry};
use cortex_llm::OpenAiCompatClient;
use cortex_memory::{MemoryManager, MemoryQuery};
use cortex_tools::{CalculatorTool, CurrentTimeTool, SearchTool};

#[derive(Debug, Parser)]
#[command(name = "cortex", version, about = "A memory-augmented LLM agent")]
struct Cli {
    /// Optional TOML config file; environment variables override it.
    #[arg(long, default_value = "cortex.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat with the memory-augmented agent (default).
    Chat {
        /// User id under which memories are stored.
        #[arg(long, default_value = "default_user")]
        user: String,
    },
    /// Inspect stored memories.
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
}

#[derive(Debug, Subcommand)]
enum MemoryCommands {
    /// Per-tier counts and average importance.
    Stats,
    /// Query all tiers.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    telemetry::init_logging(&config.telemetry.log_level);
    config.validate()?;

    match cli.command.unwrap_or(Commands::Chat {
        user: "default_user".to_string(),
    }) {
        Commands::Chat { user } => chat(config, user).await,
        Commands::Memory { command } => memory_command(config, command).await,
    }
}

async fn chat(config: AppConfig, user: String) -> Result<()> {
    let model = Arc::new(OpenAiCompatClient::from_config(&config.llm)?);
    let memory = MemoryManager::from_app_config(&config)?;

    let mut agent = MemoryAgent::new(model, memory, config.agent.clone(), user);
    agent.register_tool(Arc::new(CalculatorTool));
    agent.register_tool(Arc::new(SearchTool::mock()));
    agent.register_tool(Arc::new(CurrentTimeTool));

    println!("{} ready. Type a message, or 'exit' to quit.", config.agent.name);
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = stdin.lock().lines().next() else {
            break;
        };
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        match agent.run(input).await {
            Ok(reply) => println!("{reply}"),
            Err(err) => eprintln!("turn failed: {err}"),
        }
    }
    agent.close();
    Ok(())
}

async fn memory_command(config: AppConfig, command: MemoryCommands) -> Result<()> {
    let mut memory = MemoryManager::from_app_config(&config)?;
    match command {
        MemoryCommands::Stats => {
            let stats = memory.stats();
            println!(
                "working:  {} live / {} total (avg importance {:.2})",
                stats.working.count, stats.working.total_count, stats.working.avg_importance
            );
            println!(
                "episodic: {} (avg importance {:.2})",
                stats.episodic.count, stats.episodic.avg_importance
            );
            println!(
                "semantic: {} (avg importance {:.2})",
                stats.semantic.count, stats.semantic.avg_importance
            );
        }
        MemoryCommands::Search { query, limit } => {
            let hits = memory
                .retrieve_memories(&MemoryQuery::new(&query, limit))
                .await;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!(
                    "[{}|{}|{:.2}] {}",
                    hit.item.memory_type.as_str(),
                    hit.source.as_str(),
                    hit.score,
                    hit.item.content
                );
            }
        }
    }
    memory.close();
    Ok(())
}
