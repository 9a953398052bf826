//! compliance-runner: headless runner for the compliance decision engine.
//!
//! Usage:
//!   compliance-runner --db compliance.db --data-dir ./data --seed-defaults
//!   compliance-runner --config engine.json
//!
//! Reads one JSON command per line on stdin and writes one JSON response
//! per line on stdout.

use anyhow::Result;
use compliance_core::{
    cache::MemoryCache,
    clock::{Clock, SystemClock},
    config::{EngineConfig, RuleCatalog},
    engine::{ComplianceEngine, DecisionRequest},
    error::ComplianceResult,
    event::BroadcastPublisher,
    monitoring::{AlertFilter, AlertStatus, MonitorHandle, Transaction},
    rules::{RuleContext, RuleType, RuleVerdict},
    screening::{SanctionEntry, ScreeningRequest},
    store::SqliteStore,
};
use serde_json::{json, Value};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Screen {
        request: ScreeningRequest,
    },
    Evaluate {
        context: RuleContext,
        #[serde(default)]
        rule_type: Option<RuleType>,
    },
    Analyze {
        transaction: Transaction,
    },
    Submit {
        transaction: Transaction,
    },
    Decide {
        request: DecisionRequest,
    },
    Alerts {
        #[serde(default)]
        filter: AlertFilter,
    },
    UpdateAlert {
        id: String,
        status: AlertStatus,
        #[serde(default)]
        notes: Option<String>,
    },
    AddSanction {
        list: String,
        entry: SanctionEntry,
    },
    RemoveSanction {
        entry_id: String,
    },
    Stats,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = arg(&args, "--data-dir").unwrap_or("./data");
    let seed_defaults = args.iter().any(|a| a == "--seed-defaults");
    let config = match arg(&args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let store = Arc::new(if db == ":memory:" {
        SqliteStore::in_memory()?
    } else {
        SqliteStore::open(db)?
    });
    store.migrate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let publisher = Arc::new(BroadcastPublisher::new(config.monitoring.queue_capacity));
    let engine = ComplianceEngine::new(store, cache, publisher, clock, config);
    engine.initialize().await?;

    if seed_defaults {
        let catalog = if Path::new(data_dir).is_dir() {
            RuleCatalog::load(data_dir)?
        } else {
            log::warn!("data dir {data_dir} not found, seeding the built-in rule pack");
            RuleCatalog::builtin()?
        };
        engine.seed(&catalog).await?;
    }

    log::info!("compliance-runner ready db={db}");
    let intake = engine.monitor.start();
    let served = serve(&engine, &intake).await;

    let processed = intake.shutdown().await?;
    engine.shutdown().await?;
    log::info!("compliance-runner stopped queued_processed={processed}");
    served
}

async fn serve(engine: &ComplianceEngine, intake: &MonitorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<IpcCommand>(&line) {
            Ok(IpcCommand::Quit) => break,
            Ok(cmd) => match handle_command(engine, intake, cmd).await {
                Ok(result) => json!({ "ok": true, "result": result }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            },
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        };
        stdout.write_all(format!("{response}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_command(engine: &ComplianceEngine, intake: &MonitorHandle, cmd: IpcCommand) -> ComplianceResult<Value> {
    let value = match cmd {
        IpcCommand::Screen { request } => serde_json::to_value(engine.screener.screen(&request).await?)?,
        IpcCommand::Evaluate { context, rule_type } => {
            let results = engine.rules.evaluate_rules(&context, rule_type);
            json!({ "verdict": RuleVerdict::from_results(&results), "results": results })
        }
        IpcCommand::Analyze { transaction } => {
            serde_json::to_value(engine.monitor.process_transaction(&transaction).await?)?
        }
        IpcCommand::Submit { transaction } => {
            let id = transaction.id.clone();
            intake.submit(transaction).await?;
            json!({ "queued": id })
        }
        IpcCommand::Decide { request } => serde_json::to_value(engine.decide(&request).await?)?,
        IpcCommand::Alerts { filter } => serde_json::to_value(engine.monitor.get_alerts(&filter).await?)?,
        IpcCommand::UpdateAlert { id, status, notes } => {
            serde_json::to_value(engine.monitor.update_alert_status(&id, status, notes).await?)?
        }
        IpcCommand::AddSanction { list, entry } => {
            serde_json::to_value(engine.screener.add_to_custom_list(entry, &list).await?)?
        }
        IpcCommand::RemoveSanction { entry_id } => {
            engine.screener.remove_from_custom_list(&entry_id).await?;
            json!({ "removed": entry_id })
        }
        IpcCommand::Stats => json!({
            "screening": engine.screener.stats(),
            "rules_generation": engine.rules.generation(),
            "pending_profiles": engine.monitor.pending_profiles(),
        }),
        IpcCommand::Quit => Value::Null,
    };
    Ok(value)
}

fn arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
