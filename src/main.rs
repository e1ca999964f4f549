use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use chatgate_core::config::{self, Config, ProviderRegistry};
use chatgate_core::fallback::FallbackOverrides;
use chatgate_core::service::{CredentialDecryptor, PlaintextDecryptor, VaultDecryptor};
use chatgate_core::types::{ChatParams, Message};
use chatgate_core::AbstractionLayer;

#[derive(Parser)]
#[command(
    name = "chatgate",
    about = "Multi-provider chat completions with caching and fallback",
    version = chatgate_core::VERSION,
)]
struct Cli {
    /// Config file (defaults to ~/.chatgate/config.json, or CHATGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one chat completion against a configured provider instance
    Chat {
        /// Provider instance id
        #[arg(short, long)]
        instance: String,
        /// Caller id (defaults to the instance owner)
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(short, long)]
        temperature: Option<f64>,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        /// Print deltas as they arrive
        #[arg(long)]
        stream: bool,
        /// Only try the primary provider
        #[arg(long)]
        no_fallback: bool,
        /// Message to send
        #[arg(required = true)]
        message: Vec<String>,
    },
    /// List configured provider instances
    Providers,
    /// Encrypt a credential for the config file (needs VAULT_MASTER_KEY)
    Encrypt {
        #[arg(short, long)]
        user: String,
        credential: String,
    },
    /// Show chatgate status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatgate=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => config::load_config(Some(path)),
        None => config::load_config_from_env(),
    };

    match cli.command {
        Commands::Chat {
            instance,
            user,
            model,
            max_tokens,
            temperature,
            system,
            stream,
            no_fallback,
            message,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(message.join(" ")));

            let mut params = ChatParams::new(instance, user.unwrap_or_default(), messages);
            params.model = model;
            params.max_tokens = max_tokens;
            params.temperature = temperature;
            if no_fallback {
                params.fallback = Some(FallbackOverrides::disabled());
            }
            cmd_chat(&cfg, params, stream).await?
        }
        Commands::Providers => cmd_providers(&cfg),
        Commands::Encrypt { user, credential } => cmd_encrypt(&user, &credential)?,
        Commands::Status => cmd_status(&cfg, cli.config.as_deref()),
    }

    Ok(())
}

// ====== Commands ======

fn decryptor() -> Arc<dyn CredentialDecryptor> {
    match VaultDecryptor::from_env() {
        Ok(vault) => Arc::new(vault),
        Err(_) => {
            tracing::warn!("VAULT_MASTER_KEY not set; treating stored credentials as plaintext");
            Arc::new(PlaintextDecryptor)
        }
    }
}

async fn cmd_chat(cfg: &Config, mut params: ChatParams, stream: bool) -> Result<()> {
    let registry = Arc::new(cfg.registry());
    if params.user_id.is_empty() {
        let owner = registry
            .get_instance(&params.provider_instance_id)
            .await
            .map(|i| i.user_id)
            .with_context(|| format!("unknown provider instance {}", params.provider_instance_id))?;
        params.user_id = owner;
    }

    let layer = AbstractionLayer::builder()
        .config(cfg)
        .registry(registry)
        .decryptor(decryptor())
        .build()?;

    if stream {
        let mut chunks = layer.chat_completion_stream(params).await?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            write!(stdout, "{}", chunk.delta)?;
            stdout.flush()?;
            if let Some(usage) = chunk.usage.filter(|_| chunk.done) {
                writeln!(stdout)?;
                tracing::info!(
                    "{} via {}: {} prompt + {} completion tokens",
                    chunk.model,
                    chunk.provider,
                    usage.prompt_tokens,
                    usage.completion_tokens
                );
            }
        }
    } else {
        let resp = layer.chat_completion(params).await?;
        println!("{}", resp.content);
        tracing::info!(
            "{} via {} in {}ms ({} tokens{}{})",
            resp.model,
            resp.provider,
            resp.metadata.response_time_ms,
            resp.usage.total_tokens,
            if resp.metadata.fallback_used { ", fallback" } else { "" },
            if resp.metadata.cached { ", cached" } else { "" },
        );
    }
    Ok(())
}

fn cmd_providers(cfg: &Config) {
    let instances = cfg.registry().list();
    if instances.is_empty() {
        println!("No provider instances configured.");
        return;
    }

    for inst in instances {
        println!(
            "{:<20} {:<10} {:<8} model={} user={} credential={}{}",
            inst.id,
            inst.provider_type,
            if inst.is_active { "active" } else { "inactive" },
            inst.default_model,
            inst.user_id,
            chatgate_core::util::redact(&inst.encrypted_credential),
            inst.api_base
                .as_deref()
                .map(|b| format!(" base={b}"))
                .unwrap_or_default(),
        );
    }
}

fn cmd_encrypt(user: &str, credential: &str) -> Result<()> {
    let vault = VaultDecryptor::from_env()?;
    let blob = vault.encrypt(user, credential)?;
    println!("{blob}");
    Ok(())
}

fn cmd_status(cfg: &Config, config_path: Option<&std::path::Path>) {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(config::get_config_path);

    println!("chatgate {}\n", chatgate_core::VERSION);
    println!(
        "Config: {} {}",
        path.display(),
        if path.exists() { "✓" } else { "✗" }
    );
    println!("Provider instances: {}", cfg.providers.len());

    let adapters = chatgate_core::provider::AdapterRegistry::with_defaults(&cfg.api_bases);
    let names: Vec<String> = adapters
        .provider_types()
        .iter()
        .map(|pt| pt.to_string())
        .collect();
    println!("Adapters: {}", names.join(", "));

    let fb = &cfg.fallback;
    println!(
        "Fallback: {} (max retries {}, delay {}ms)",
        if fb.enabled { "enabled" } else { "disabled" },
        fb.max_retries,
        fb.retry_delay_ms
    );
    let order: Vec<String> = fb.fallback_order.iter().map(|pt| pt.to_string()).collect();
    println!("  order: {}", order.join(" → "));
    if !fb.skip_providers.is_empty() {
        let skip: Vec<String> = fb.skip_providers.iter().map(|pt| pt.to_string()).collect();
        println!("  skip: {}", skip.join(", "));
    }

    let cache = &cfg.cache;
    println!(
        "Cache: {} (ttl {}ms, max {} entries)",
        if cache.enabled { "enabled" } else { "disabled" },
        cache.ttl_ms,
        cache.max_entries
    );
    println!(
        "Vault key: {}",
        if chatgate_core::service::vault::load_master_key().is_ok() {
            "✓"
        } else {
            "not set"
        }
    );
}
