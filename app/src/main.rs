use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use mediation_ai_core::providers::{ChatMessage, ProviderKind};
use mediation_ai_core::registry::NewProviderConfig;
use mediation_ai_core::{AiError, CoreConfig, MediationRequest, ModelManager};
use serde::Serialize;

const PULL_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about = "Manage AI provider credentials and clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace directory holding the database and key file
    #[arg(long, short = 'w', env = "MEDIATION_AI_WORKSPACE", global = true)]
    workspace: Option<PathBuf>,

    /// Optional JSON config file (defaults to <workspace>/config.json)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the supported provider kinds
    Providers,

    /// Manage saved provider configurations
    Configs {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Probe a provider before saving it, or re-test a saved configuration
    Test {
        /// Saved configuration to re-test
        #[arg(long, conflicts_with = "provider")]
        config_id: Option<String>,

        #[arg(long, short = 'p', required_unless_present = "config_id")]
        provider: Option<String>,

        #[arg(long, short = 'k', env = "MEDIATION_AI_API_KEY", default_value = "")]
        api_key: String,

        #[arg(long, short = 'm')]
        model: Option<String>,

        #[arg(long, short = 'e')]
        endpoint: Option<String>,
    },

    /// Show windowed usage statistics for an owner
    Usage {
        #[arg(long, short = 'o')]
        owner: String,

        #[arg(long, short = 'd', default_value_t = 30)]
        days: u32,

        /// Also print the most recent raw records
        #[arg(long)]
        recent: Option<usize>,
    },

    /// Complete one message with the owner's default provider
    Chat {
        #[arg(long, short = 'o')]
        owner: String,

        #[arg(long)]
        case_type: Option<String>,

        #[arg(long)]
        sender_role: Option<String>,

        #[arg(long)]
        system: Option<String>,

        message: String,
    },

    /// List models available on a local Ollama runtime
    Models {
        #[arg(long, short = 'e')]
        endpoint: Option<String>,
    },

    /// Download a model into a local Ollama runtime
    Pull {
        name: String,

        #[arg(long, short = 'e')]
        endpoint: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List configurations for an owner, default first
    List {
        #[arg(long, short = 'o')]
        owner: String,
    },

    /// Save a new configuration
    Add {
        #[arg(long, short = 'o')]
        owner: String,

        #[arg(long, short = 'p')]
        provider: String,

        #[arg(long, short = 'k', env = "MEDIATION_AI_API_KEY", default_value = "")]
        api_key: String,

        #[arg(long, short = 'm')]
        model: Option<String>,

        #[arg(long, short = 'e')]
        endpoint: Option<String>,

        /// Make this the owner's default configuration
        #[arg(long)]
        default: bool,

        /// Run a connection test first and refuse to save on failure
        #[arg(long)]
        verify: bool,
    },

    /// Make a configuration the owner's default
    Default { config_id: String },

    /// Keep a configuration but stop using it
    Deactivate { config_id: String },

    /// Re-enable a deactivated configuration
    Activate { config_id: String },

    /// Remove a configuration
    Delete { config_id: String },
}

fn workspace_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    if let Some(proj) = ProjectDirs::from("com", "MediationAI", "MediationAI") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("MediationAI")
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    if let Err(err) = run(cli).await {
        match err.downcast_ref::<AiError>() {
            Some(ai) => eprintln!("error [{}]: {ai}\n  {}", ai.code(), ai.explain()),
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let workspace = workspace_dir(cli.workspace);
    let config_path = cli
        .config
        .unwrap_or_else(|| workspace.join("config.json"));
    let config = CoreConfig::load(&config_path, workspace)?;
    let manager = ModelManager::init(config).context("failed to initialise the model manager")?;

    match cli.command {
        Commands::Providers => print_json(&manager.supported_providers()),
        Commands::Configs { command } => run_configs(&manager, command).await,
        Commands::Test {
            config_id,
            provider,
            api_key,
            model,
            endpoint,
        } => {
            let report = match (config_id, provider) {
                (Some(id), _) => manager.test_saved_config(&id).await?,
                (None, Some(provider)) => {
                    let kind: ProviderKind = provider.parse()?;
                    manager
                        .test_connection(kind, &api_key, model.as_deref(), endpoint.as_deref())
                        .await
                }
                (None, None) => bail!("either --config-id or --provider is required"),
            };
            print_json(&report)?;
            if !report.ok {
                std::process::exit(2);
            }
            Ok(())
        }
        Commands::Usage {
            owner,
            days,
            recent,
        } => {
            print_json(&manager.get_usage_stats(&owner, days).await?)?;
            if let Some(limit) = recent {
                print_json(&manager.recent_usage(&owner, limit).await?)?;
            }
            Ok(())
        }
        Commands::Chat {
            owner,
            case_type,
            sender_role,
            system,
            message,
        } => {
            let request = MediationRequest {
                system_prompt: system,
                case_type,
                sender_role,
                ..MediationRequest::new(vec![ChatMessage::user(message)])
            };
            print_json(&manager.complete_for_owner(&owner, request).await?)
        }
        Commands::Models { endpoint } => {
            print_json(&manager.list_local_models(endpoint.as_deref()).await?)
        }
        Commands::Pull { name, endpoint } => {
            let handle = manager.pull_local_model(endpoint.as_deref(), &name)?;
            let started = Instant::now();
            while !handle.is_finished() {
                tokio::select! {
                    _ = tokio::time::sleep(PULL_PROGRESS_INTERVAL) => {
                        log::info!(
                            "still downloading {} ({}s elapsed)",
                            handle.model(),
                            started.elapsed().as_secs()
                        );
                    }
                    _ = tokio::signal::ctrl_c() => {
                        handle.cancel();
                        break;
                    }
                }
            }
            print_json(&handle.wait().await?)
        }
    }
}

async fn run_configs(manager: &Arc<ModelManager>, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::List { owner } => print_json(&manager.list_configs(&owner).await?),
        ConfigCommands::Add {
            owner,
            provider,
            api_key,
            model,
            endpoint,
            default,
            verify,
        } => {
            let kind: ProviderKind = provider.parse()?;
            if verify {
                let report = manager
                    .test_connection(kind, &api_key, model.as_deref(), endpoint.as_deref())
                    .await;
                if !report.ok {
                    bail!("connection test failed: {}", report.message);
                }
            }
            let config_id = manager
                .save_config(NewProviderConfig {
                    owner_id: owner,
                    provider_kind: kind,
                    credential: api_key,
                    model_name: model,
                    endpoint_override: endpoint,
                    make_default: default,
                })
                .await?;
            print_json(&serde_json::json!({ "config_id": config_id }))
        }
        ConfigCommands::Default { config_id } => print_json(&manager.set_default(&config_id).await?),
        ConfigCommands::Deactivate { config_id } => {
            print_json(&manager.deactivate_config(&config_id).await?)
        }
        ConfigCommands::Activate { config_id } => {
            print_json(&manager.activate_config(&config_id).await?)
        }
        ConfigCommands::Delete { config_id } => {
            manager.delete_config(&config_id).await?;
            print_json(&serde_json::json!({ "deleted": config_id }))
        }
    }
}
