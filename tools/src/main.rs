//! txguard-runner: headless driver for the transaction risk pipeline.
//!
//! Usage:
//!   txguard-runner --seed 12345 --count 500 --db run.db
//!   txguard-runner --db run.db --data-dir ./data --ipc-mode

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use txguard_core::{
    audit::{AuditSink, FanOutSink, LogSink, StoreSink},
    config::RiskConfig,
    decision_aggregator::Decision,
    ml::HeuristicScorer,
    pipeline::RiskPipeline,
    store::RiskStore,
    transaction::{AccountRecord, EntityIds, Location, Transaction},
    types::Channel,
};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    /// `id` may be omitted; a fresh one is assigned.
    Evaluate { transaction: serde_json::Value },
    RegisterAccount { account: AccountRecord },
    GetDecision { transaction_id: String },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let count = parse_arg(&args, "--count", 200u64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let data_dir = args
        .windows(2)
        .find(|w| w[0] == "--data-dir")
        .map(|w| w[1].as_str())
        .unwrap_or("./data");

    if !ipc_mode {
        println!("txguard-runner");
        println!("  seed:      {seed}");
        println!("  count:     {count}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    let config = load_config(data_dir)?;
    let store = if db == ":memory:" {
        RiskStore::in_memory()?
    } else {
        RiskStore::open(db)?
    };
    let store = Arc::new(store.with_retry(config.store.clone()));
    store.migrate()?;
    store.seed_rules(data_dir)?;

    let audit: Arc<dyn AuditSink> = Arc::new(FanOutSink::new(vec![
        Arc::new(LogSink),
        Arc::new(StoreSink::new(store.clone())),
    ]));
    let pipeline = RiskPipeline::new(&config, store.clone(), Arc::new(HeuristicScorer::default()), audit);

    if ipc_mode {
        run_ipc_loop(&pipeline)?;
    } else {
        run_batch(&pipeline, seed, count)?;
        print_summary(&store, count)?;
    }

    Ok(())
}

fn load_config(data_dir: &str) -> Result<RiskConfig> {
    if Path::new(data_dir).join("risk_config.json").exists() {
        RiskConfig::load(data_dir)
    } else {
        log::warn!("No risk_config.json under {data_dir}; using built-in defaults");
        Ok(RiskConfig::default_test())
    }
}

fn run_ipc_loop(pipeline: &RiskPipeline) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };

        let response = match cmd {
            IpcCommand::Quit => break,
            IpcCommand::Evaluate { transaction } => match parse_transaction(transaction) {
                Ok(tx) => serde_json::to_value(pipeline.evaluate(&tx))?,
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            },
            IpcCommand::RegisterAccount { account } => match pipeline.register_account(&account) {
                Ok(check) => serde_json::json!({
                    "user_id": account.user_id,
                    "sequential_accounts": check.as_ref().map(|c| c.is_suspicious).unwrap_or(false),
                    "evidence": check.map(|c| c.evidence),
                }),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            },
            IpcCommand::GetDecision { transaction_id } => match pipeline.decision(&transaction_id) {
                Ok(Some(result)) => serde_json::to_value(result)?,
                Ok(None) => serde_json::json!({ "error": format!("no decision for '{transaction_id}'") }),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            },
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn parse_transaction(mut raw: serde_json::Value) -> Result<Transaction> {
    if let Some(obj) = raw.as_object_mut() {
        obj.entry("id").or_insert_with(|| Transaction::new_id().into());
    }
    Ok(serde_json::from_value(raw)?)
}

// ── Batch mode ─────────────────────────────────────────────────

const USERS: u32 = 40;
const MERCHANTS: u32 = 10;

fn run_batch(pipeline: &RiskPipeline, seed: u64, count: u64) -> Result<()> {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid batch start time"))?;

    register_account_farm(pipeline, start)?;

    let mut now = start;
    for n in 0..count {
        now += Duration::seconds(rng.gen_range(1..=180));
        let tx = synthetic_transaction(&mut rng, n, now);
        let result = pipeline.evaluate(&tx);
        if result.decision != Decision::Approve {
            log::info!("{} → {} ({:.1})", tx.id, result.decision.as_str(), result.risk_score);
        }
    }
    Ok(())
}

/// A handful of templated signups on one fingerprint, so the
/// sequential-account detector has something to find.
fn register_account_farm(pipeline: &RiskPipeline, start: DateTime<Utc>) -> Result<()> {
    for i in 1..=4u32 {
        let account = AccountRecord {
            user_id:    format!("farm-{i}"),
            username:   format!("promo_user_{i:03}"),
            email:      Some(format!("promo.user{i}@example.com")),
            ip_address: Some("203.0.113.50".to_string()),
            device_id:  Some("device-farm".to_string()),
            created_at: start + Duration::minutes(i as i64),
        };
        pipeline.register_account(&account)?;
    }
    Ok(())
}

fn synthetic_transaction(rng: &mut Pcg64Mcg, n: u64, at: DateTime<Utc>) -> Transaction {
    let user = rng.gen_range(0..USERS);
    let merchant = rng.gen_range(0..MERCHANTS);

    let (amount, purpose) = match rng.gen_range(0..100u32) {
        0..=4 => (rng.gen_range(9_000..10_000u32) as f64, "deposit"),
        5..=9 => ((rng.gen_range(1..=80u32) * 100) as f64, "withdrawal"),
        10..=12 => (rng.gen_range(15_000..40_000u32) as f64, "transfer"),
        _ => (rng.gen_range(500..50_000u32) as f64 / 100.0, "purchase"),
    };
    let channel = match rng.gen_range(0..3u32) {
        0 => Channel::Pos,
        1 => Channel::Ecommerce,
        _ => Channel::Wallet,
    };
    let country = if rng.gen_bool(0.03) { "IR" } else if rng.gen_bool(0.1) { "GB" } else { "US" };

    Transaction {
        id: format!("txn-{n:06}"),
        entity_ids: EntityIds {
            user:        Some(format!("user-{user:02}")),
            card_number: Some(format!("4111 1111 1111 {:04}", user)),
            device:      Some(format!("device-{:02}", user % 25)),
            ip:          Some(format!("198.51.100.{}", user % 30)),
            merchant:    Some(format!("merchant-{merchant:02}")),
            email:       Some(format!("user{user}@example.com")),
        },
        amount,
        currency: if rng.gen_bool(0.05) { "EUR".to_string() } else { "USD".to_string() },
        channel,
        purpose: purpose.to_string(),
        timestamp: at,
        location: Location { country: Some(country.to_string()), city: None },
    }
}

fn print_summary(store: &RiskStore, count: u64) -> Result<()> {
    let totals = store.decision_totals()?;
    let approved = totals.get(Decision::Approve.as_str()).copied().unwrap_or(0);
    let review = totals.get(Decision::Review.as_str()).copied().unwrap_or(0);
    let rejected = totals.get(Decision::Reject.as_str()).copied().unwrap_or(0);
    let suspicious = store.suspicious_patterns()?;

    println!("=== RUN SUMMARY ===");
    println!("  transactions:   {count}");
    println!("  approved:       {approved}");
    println!("  review:         {review}");
    println!("  rejected:       {rejected}");
    println!("  suspicious AML: {}", suspicious.len());
    for (user_id, pattern) in suspicious.iter().take(10) {
        println!("    {user_id:<12} {}", pattern.as_str());
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
