//! CLI commands and handlers

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::application::services::OrchestratorService;
use crate::domain::coordinator::TransactionOperation;
use crate::domain::fusion::{ConflictStrategy, DataType, FusionRequest};
use crate::domain::pipeline::{EventFilter, EventHandler, StreamEvent};
use crate::shared::config::{ConfigLoader, DEFAULT_CONFIG_PATH};
use crate::shared::types::StreamType;

#[derive(Parser)]
#[command(name = "arbmesh")]
#[command(version, about = "Server orchestration core for a multi-chain arbitrage bot")]
pub struct Cli {
    /// Path to the TOML configuration
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Use synthetic in-process servers instead of HTTP endpoints
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Log filter (overrides RUST_LOG), e.g. "info" or "arbmesh=debug"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start every component and run until Ctrl-C or the duration elapses
    Run {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Seconds between printed summaries
        #[arg(long, default_value_t = 30)]
        summary_interval: u64,
    },

    /// List configured servers and their capabilities
    Servers,

    /// Run one composite analysis for a trading pair
    Analyze {
        /// Pair such as ETH/USDC
        subject: String,
    },

    /// Fuse one data type across providers
    Fuse {
        /// market_data, price_data, order_book, liquidity, relationships, sentiment
        #[arg(long)]
        data_type: String,

        /// Required capability (repeatable); defaults to the data type's own
        #[arg(long)]
        capability: Vec<String>,

        /// priority, majority or quality
        #[arg(long)]
        strategy: Option<String>,

        #[arg(long, default_value_t = 5)]
        max_sources: usize,

        #[arg(long, default_value = "ETH/USDC")]
        symbol: String,
    },

    /// Run one transaction; each --op is server:action[:json]
    Transact {
        #[arg(long = "op", required = true)]
        ops: Vec<String>,
    },

    /// Run one health cycle and print the summary
    Status,
}

/// Parse `server:action[:json-parameters]`
pub fn parse_operation(input: &str) -> Result<TransactionOperation> {
    let mut parts = input.splitn(3, ':');
    let server = parts.next().unwrap_or_default().trim();
    let action = parts.next().unwrap_or_default().trim();
    if server.is_empty() || action.is_empty() {
        return Err(anyhow!("operation '{}' must look like server:action[:json]", input));
    }

    let parameters = match parts.next() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str::<Value>(raw)
            .with_context(|| format!("parameters of '{}' are not valid JSON", input))?,
        _ => json!({}),
    };

    Ok(TransactionOperation::new(server, action, parameters))
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Execute the selected command
    pub async fn execute(cli: Cli) -> Result<()> {
        let config = ConfigLoader::from_file(&cli.config)?;
        let service = OrchestratorService::from_config(config, cli.simulate)?;

        match cli.command {
            Commands::Run {
                duration,
                summary_interval,
            } => Self::execute_run_command(&service, duration, summary_interval).await,
            Commands::Servers => Self::execute_servers_command(&service),
            Commands::Analyze { subject } => Self::execute_analyze_command(&service, &subject).await,
            Commands::Fuse {
                data_type,
                capability,
                strategy,
                max_sources,
                symbol,
            } => {
                Self::execute_fuse_command(&service, &data_type, &capability, strategy.as_deref(), max_sources, &symbol)
                    .await
            }
            Commands::Transact { ops } => Self::execute_transact_command(&service, &ops).await,
            Commands::Status => Self::execute_status_command(&service).await,
        }
    }

    async fn execute_run_command(service: &OrchestratorService, duration: Option<u64>, summary_interval: u64) -> Result<()> {
        service.start().await?;

        let signals: Arc<dyn EventHandler> = Arc::new(|event: &StreamEvent| -> Result<()> {
            info!("📈 Signal {} from {}: {}", event.sequence, event.source, event.payload);
            Ok(())
        });
        service
            .coordinator()
            .subscribe(&[StreamType::ArbitrageSignals], EventFilter::new(), signals)
            .await;

        let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let mut ticker = tokio::time::interval(Duration::from_secs(summary_interval.max(1)));
        ticker.tick().await;

        loop {
            let until_deadline = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("\n🛑 Interrupted, shutting down...");
                    break;
                }
                _ = until_deadline => {
                    println!("⏰ Duration elapsed, shutting down...");
                    break;
                }
                _ = ticker.tick() => {
                    Self::print_summary(service).await;
                }
            }
        }

        service.stop().await;
        Self::print_summary(service).await;
        Ok(())
    }

    async fn print_summary(service: &OrchestratorService) {
        let pipeline = service.pipeline().statistics().await;
        let health = service.health().summary().await;
        let loads = service.coordinator().load_snapshot().await;
        let cache = service.fusion().cache_stats().await;

        println!("\n📊 ===== Orchestrator summary =====");
        println!(
            "📡 Events: {} emitted, {} processed, {} dropped, queue {}/{}",
            pipeline.events_emitted,
            pipeline.events_processed,
            pipeline.events_dropped,
            pipeline.queue_depth,
            pipeline.queue_capacity
        );
        println!(
            "🩺 Health: {} servers, availability {:.1}%, {} active alerts, {} predicted failures",
            health.total_servers,
            health.mean_availability * 100.0,
            health.active_alerts,
            health.predicted_failures
        );
        for (status, count) in &health.by_status {
            println!("   {:<10} {}", status.as_str(), count);
        }
        for load in loads {
            println!(
                "⚖️  {:<16} load {:.2} (cpu {:.0}%, mem {:.0}%, {} active)",
                load.server_id, load.load_score, load.cpu_usage, load.memory_usage, load.active_requests
            );
        }
        println!("🗄️  Fusion cache: {} entries, {} hits, {} misses", cache.entries, cache.hits, cache.misses);
    }

    fn execute_servers_command(service: &OrchestratorService) -> Result<()> {
        let config = service.config();
        println!("🖥️  {} configured servers", config.servers.len());
        for server in &config.servers {
            println!(
                "\n• {} ({}) priority {}{}",
                server.id,
                server.kind,
                server.priority,
                if server.required { " [required]" } else { "" }
            );
            if let Some(endpoint) = &server.endpoint {
                println!("  endpoint: {}", endpoint);
            }
            for capability in &server.capabilities {
                println!(
                    "  - {}{} ops: [{}] data: [{}]",
                    capability.name,
                    if capability.real_time { " (real-time)" } else { "" },
                    capability.operations.join(", "),
                    capability.data_kinds.join(", ")
                );
            }
        }
        Ok(())
    }

    async fn execute_analyze_command(service: &OrchestratorService, subject: &str) -> Result<()> {
        service.connect().await?;
        service.coordinator().sample_loads().await;

        let report = service.coordinator().coordinate_analysis(subject).await;
        println!("🔍 Analysis for {}", report.subject);
        println!("   Opportunity score: {:.2}", report.opportunity_score);
        println!("   Sources: {}  Quality: {}", report.source_count, report.quality_tags.join(" / "));
        println!("   Relationships: {}", report.relationship_count);
        for recommendation in &report.recommendations {
            println!("   👉 {}", recommendation);
        }
        Ok(())
    }

    async fn execute_fuse_command(
        service: &OrchestratorService,
        data_type: &str,
        capabilities: &[String],
        strategy: Option<&str>,
        max_sources: usize,
        symbol: &str,
    ) -> Result<()> {
        let data_type: DataType = data_type.parse().map_err(|e: String| anyhow!(e))?;
        let strategy: ConflictStrategy = match strategy {
            Some(s) => s.parse().map_err(|e: String| anyhow!(e))?,
            None => ConflictStrategy::default(),
        };

        let mut request = FusionRequest::new(data_type, json!({ "symbol": symbol }))
            .with_strategy(strategy)
            .with_max_sources(max_sources);
        if !capabilities.is_empty() {
            let names: Vec<&str> = capabilities.iter().map(String::as_str).collect();
            request = request.with_capabilities(&names);
        }

        service.connect().await?;
        let fused = service.coordinator().fuse(&request).await;

        println!("🧬 Fused {:?} from {} sources", data_type, fused.sources.len());
        println!("   Quality: {}  Confidence: {:.2}  Conflicts: {}", fused.quality, fused.confidence, fused.conflicts_detected);
        for note in &fused.notes {
            println!("   📝 {}", note);
        }
        println!("{}", serde_json::to_string_pretty(&fused.data)?);
        Ok(())
    }

    async fn execute_transact_command(service: &OrchestratorService, ops: &[String]) -> Result<()> {
        let operations = ops.iter().map(|op| parse_operation(op)).collect::<Result<Vec<_>>>()?;

        service.connect().await?;
        let result = service.coordinator().coordinate_transaction(operations).await;

        let icon = if result.success { "✅" } else { "❌" };
        println!(
            "{} Transaction {} {} in {}ms",
            icon, result.transaction_id, result.final_state, result.duration_ms
        );
        for (participant, value) in &result.results {
            println!("   {} -> {}", participant, value);
        }
        for (participant, error) in &result.errors {
            println!("   ⚠️  {}: {}", participant, error);
        }
        if !result.rolled_back.is_empty() {
            println!("   ↩️  Rolled back: {}", result.rolled_back.join(", "));
        }
        if !result.success {
            warn!("Transaction {} did not commit", result.transaction_id);
        }
        Ok(())
    }

    async fn execute_status_command(service: &OrchestratorService) -> Result<()> {
        let connected = service.connect().await?;
        service.coordinator().sample_loads().await;
        service.health().run_health_cycle().await;

        println!("🔗 {} servers connected", connected);
        for profile in service.health().profiles().await {
            println!(
                "   {:<16} {:<9} trend {:<17} availability {:.1}%",
                profile.server_id,
                profile.status.as_str(),
                profile.trend.to_string(),
                profile.availability() * 100.0
            );
        }
        for alert in service.health().active_alerts().await {
            println!("   🚨 [{}] {}", alert.severity, alert.message);
        }
        Self::print_summary(service).await;
        Ok(())
    }
}
