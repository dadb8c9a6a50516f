//! CLI command implementations

use alloy_primitives::U256;
use anyhow::Result;
use dialoguer::Confirm;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::chain::{BlockTag, ChainClient, RpcChainClient};
use crate::cleanup::{reconcile, CleanupReport};
use crate::config::{format_eth, Config};
use crate::events::{spawn_event_logger, EventBus};
use crate::ledger::ExposureLedger;
use crate::position::{ExitReason, PositionMonitor, TradeBook, TradeStatus};
use crate::queue::TxQueue;
use crate::store::{KvStore, MemoryStore};
use crate::strategy::{Registry, TradeContext};
use crate::subscriber::{Pipeline, Subscriber};

/// Event bus capacity; slow consumers see `Lagged`
const EVENT_CAPACITY: usize = 1024;

/// Persistent state shared by every command
struct Persisted {
    store: Arc<MemoryStore>,
    ledger: Arc<ExposureLedger>,
    trades: Arc<TradeBook>,
    audit: AuditLog,
}

async fn open_store(config: &Config) -> Result<Arc<MemoryStore>> {
    let store = if config.store.snapshot_path.trim().is_empty() {
        warn!("store.snapshot_path is empty - state will not survive a restart");
        MemoryStore::new()
    } else {
        MemoryStore::open(&config.store.snapshot_path).await?
    };
    Ok(Arc::new(store))
}

async fn load_persisted(config: &Config) -> Result<Persisted> {
    let store = open_store(config).await?;
    let kv: Arc<dyn KvStore> = store.clone();

    let ledger = Arc::new(ExposureLedger::new());
    let restored = ledger.restore(kv.as_ref()).await?;
    let trades = Arc::new(TradeBook::new(kv.clone()));
    let loaded = trades.load().await?;
    info!("Restored {} strategy ledgers and {} trades", restored, loaded);

    Ok(Persisted {
        audit: AuditLog::new(kv, config.store.audit_cap),
        store,
        ledger,
        trades,
    })
}

fn rpc_client(config: &Config) -> Result<Arc<dyn ChainClient>> {
    Ok(Arc::new(RpcChainClient::new(&config.rpc)?))
}

/// Everything needed to trade: queue, context and strategy registry
fn trade_context(
    config: &Config,
    client: Arc<dyn ChainClient>,
    persisted: &Persisted,
    events: &EventBus,
    dry_run: bool,
) -> Result<(Arc<TradeContext>, Arc<Registry>)> {
    let queue = TxQueue::new(
        client.clone(),
        config.queue.clone(),
        events.clone(),
        persisted.audit.clone(),
    );
    let ctx = Arc::new(TradeContext {
        client,
        queue,
        ledger: persisted.ledger.clone(),
        trades: persisted.trades.clone(),
        events: events.clone(),
        signer: config.wallet.address,
        weth: config.weth,
        dry_run,
    });
    let registry = Arc::new(Registry::from_trackers(&config.trackers, ctx.clone())?);
    Ok((ctx, registry))
}

/// Periodically write the store snapshot until cancelled
fn spawn_store_flusher(
    store: Arc<MemoryStore>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = store.flush().await {
                        warn!("Store flush failed: {}", e);
                    }
                }
            }
        }
    })
}

async fn run_cleanup(config: &Config, client: &dyn ChainClient) -> Result<CleanupReport> {
    info!("Reconciling nonces for {}...", config.wallet.address);
    // reconcile logs its own outcome
    Ok(reconcile(client, config.wallet.address, &config.cleanup).await?)
}

/// Start the sniper
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - no buys will be broadcast");
    }

    info!("Starting EVM pool sniper...");
    if config.trackers.is_empty() {
        anyhow::bail!("No trackers configured - nothing to watch");
    }

    let persisted = load_persisted(config).await?;

    info!("Initializing RPC client...");
    let client = rpc_client(config)?;
    let head = client.get_block_number().await?;
    info!("Connected to {} at block {}", config.rpc.endpoint, head);

    // Stuck nonces must be cleared before the queue hands out its first one
    if config.cleanup.enabled && !dry_run {
        run_cleanup(config, client.as_ref()).await?;
    } else {
        info!("Startup nonce reconciliation skipped");
    }

    let cancel = CancellationToken::new();
    let events = EventBus::new(EVENT_CAPACITY);
    let mut tasks = vec![
        spawn_event_logger(&events, cancel.clone()),
        persisted
            .ledger
            .spawn_writer(persisted.store.clone(), cancel.clone()),
        spawn_store_flusher(
            persisted.store.clone(),
            config.store.flush_interval_secs,
            cancel.clone(),
        ),
    ];

    let (ctx, registry) = trade_context(config, client.clone(), &persisted, &events, dry_run)?;
    info!(
        "{} strategies registered, {} trades open",
        registry.len(),
        ctx.trades.active().await.len()
    );

    let pipeline = Pipeline::new(client.clone(), registry.clone(), events.clone(), &config.subscriber);
    let subscriber = Arc::new(Subscriber::new(client, pipeline, config.subscriber.clone()));
    let monitor = Arc::new(PositionMonitor::new(ctx, registry, config.monitor.clone()));

    {
        let subscriber = subscriber.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = subscriber.run(cancel).await {
                error!("Subscriber failed: {}", e);
            }
        }));
    }
    {
        let monitor = monitor.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { monitor.run(cancel).await }));
    }

    info!("Sniper running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    persisted.store.flush().await?;
    info!("State saved, goodbye");

    Ok(())
}

/// Clear stuck pending transactions and print the report
pub async fn cleanup(config: &Config) -> Result<()> {
    let client = rpc_client(config)?;
    let report = run_cleanup(config, client.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ok {
        anyhow::bail!("{} nonces still pending", report.remaining);
    }
    Ok(())
}

/// Manually sell an open trade
pub async fn sell(config: &Config, trade_id: &str, percent: u8, force: bool) -> Result<()> {
    info!("Sell command: trade={}, percent={}", trade_id, percent);

    let persisted = load_persisted(config).await?;
    let Some(trade) = persisted.trades.get(trade_id).await else {
        anyhow::bail!("Unknown trade: {}", trade_id);
    };
    if !trade.status.is_active() {
        anyhow::bail!("Trade {} is {} and cannot be sold", trade_id, trade.status);
    }

    // Confirmation prompt (unless --force)
    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Sell {}% of trade {} (token {})? This cannot be undone.",
                percent, trade_id, trade.token
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Sell cancelled by user");
            return Ok(());
        }
    }

    let cancel = CancellationToken::new();
    let events = EventBus::new(EVENT_CAPACITY);
    let logger = spawn_event_logger(&events, cancel.clone());
    let writer = persisted
        .ledger
        .spawn_writer(persisted.store.clone(), cancel.clone());

    let client = rpc_client(config)?;
    let (ctx, registry) = trade_context(config, client, &persisted, &events, false)?;
    let monitor = PositionMonitor::new(ctx, registry, config.monitor.clone());
    let result = monitor.sell(trade_id, percent, ExitReason::Manual, true).await;

    cancel.cancel();
    let _ = tokio::join!(logger, writer);
    persisted.store.flush().await?;

    match result? {
        Some(updated) if updated.status == TradeStatus::Selling => {
            let hash = updated.pending_sell.as_ref().map(|p| p.hash.to_string());
            println!("\nSell broadcast but not confirmed yet.");
            println!("Trade:     {}", updated.id);
            println!("Tx:        {}", hash.unwrap_or_default());
            println!("The running sniper settles it once the receipt is mined.");
        }
        Some(updated) => {
            println!("\nSell confirmed!");
            println!("Trade:     {}", updated.id);
            println!("Status:    {}", updated.status);
            println!("Remaining: {} tokens", updated.token_amount);
            println!("Proceeds:  {} ETH", format_eth(updated.proceeds_wei));
        }
        None => println!("Trade {} is already being sold", trade_id),
    }
    Ok(())
}

fn format_signed_eth(wei: i128) -> String {
    let sign = if wei < 0 { "-" } else { "" };
    format!("{}{}", sign, format_eth(U256::from(wei.unsigned_abs())))
}

/// Show strategy exposure, open trades and recent transactions
pub async fn status(config: &Config) -> Result<()> {
    info!("Loading state...");
    let persisted = load_persisted(config).await?;

    println!("\n=== SNIPER STATUS ===\n");

    println!("Strategies:");
    let snapshot = persisted.ledger.snapshot();
    if snapshot.is_empty() {
        println!("  (none recorded yet)");
    }
    let mut total_pnl: i128 = 0;
    for (id, entry) in &snapshot {
        let limits = &entry.limits;
        let counters = &entry.counters;
        total_pnl = total_pnl.saturating_add(counters.realized_pnl_wei);
        println!(
            "  {:<16} open {}/{}  exposure {} / {} ETH  trades {}  realized {} ETH",
            id,
            counters.open_trades,
            if limits.max_trades == 0 {
                "-".to_string()
            } else {
                limits.max_trades.to_string()
            },
            format_eth(counters.active_exposure_wei),
            if limits.max_active_buy_wei.is_zero() {
                "-".to_string()
            } else {
                format_eth(limits.max_active_buy_wei)
            },
            counters.trades_count,
            format_signed_eth(counters.realized_pnl_wei),
        );
    }
    println!("\nTotal realized P&L: {} ETH", format_signed_eth(total_pnl));

    println!("\n=== OPEN TRADES ===\n");
    let active = persisted.trades.active().await;
    if active.is_empty() {
        println!("No open trades.");
    }
    for trade in &active {
        println!(
            "  {}  {:<12} {:<12} token {}  cost {} ETH  last P&L {}",
            trade.id,
            trade.strategy_id,
            trade.status.to_string(),
            trade.token,
            format_eth(trade.remaining_cost_wei()),
            trade
                .last_pnl_pct
                .map(|p| format!("{:.2}%", p))
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    println!("\n=== RECENT TRANSACTIONS ===\n");
    let recent = persisted.audit.recent(10).await;
    if recent.is_empty() {
        println!("No transactions recorded.");
    }
    for entry in recent {
        println!(
            "  {}  {:<9} {:<28} nonce {:<6} {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", entry.phase).to_lowercase(),
            entry.label,
            entry
                .nonce
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry
                .error
                .or_else(|| entry.hash.map(|h| h.to_string()))
                .unwrap_or_default(),
        );
    }

    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check system health
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let mut all_healthy = true;
    let client = rpc_client(config)?;

    // Check RPC
    print!("RPC Endpoint... ");
    match check_rpc(client.as_ref()).await {
        Ok((block, latency)) => println!("OK (block {}, {}ms)", block, latency),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    // Check log subscription endpoint
    if config.rpc.ws_endpoint.trim().is_empty() {
        println!("WebSocket... DISABLED (polling eth_getLogs)");
    } else {
        print!("WebSocket... ");
        match check_ws(&config.rpc.ws_endpoint).await {
            Ok(_) => println!("OK"),
            Err(e) => {
                println!("FAILED: {}", e);
                all_healthy = false;
            }
        }
    }

    // Check fee data against the queue cap
    print!("Fee data... ");
    match client.get_fee_data().await {
        Ok(fee) => {
            let max_fee = fee.max_fee_per_gas.or(fee.gas_price).unwrap_or_default();
            let gwei = max_fee as f64 / 1e9;
            match config.queue.gas_cap_wei() {
                Some(cap) if max_fee > cap => {
                    println!(
                        "WARN ({:.2} gwei exceeds cap {} gwei)",
                        gwei, config.queue.max_gas_price_gwei
                    );
                }
                _ => println!("OK ({:.2} gwei)", gwei),
            }
        }
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    // Check signer nonces
    print!("Signer nonces... ");
    match check_nonces(client.as_ref(), config).await {
        Ok((latest, pending)) if pending > latest => {
            println!(
                "WARN ({} stuck: latest {}, pending {} - run `snipe cleanup`)",
                pending - latest,
                latest,
                pending
            );
        }
        Ok((latest, _)) => println!("OK (next nonce {})", latest),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    println!();
    if all_healthy {
        println!("All systems healthy!");
    } else {
        println!("Some systems are unhealthy. Check the errors above.");
    }

    Ok(())
}

async fn check_rpc(client: &dyn ChainClient) -> Result<(u64, u64)> {
    let start = Instant::now();
    let block = client.get_block_number().await?;
    let latency = start.elapsed().as_millis() as u64;
    Ok((block, latency))
}

async fn check_ws(ws_endpoint: &str) -> Result<()> {
    use tokio_tungstenite::connect_async;

    let url = url::Url::parse(ws_endpoint)
        .map_err(|e| anyhow::anyhow!("Invalid WebSocket URL: {}", e))?;

    // Try to connect with timeout
    let timeout = Duration::from_secs(5);
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _))) => {
            drop(ws);
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow::anyhow!("WebSocket connection failed: {}", e)),
        Err(_) => Err(anyhow::anyhow!("Connection timed out after {}s", timeout.as_secs())),
    }
}

async fn check_nonces(client: &dyn ChainClient, config: &Config) -> Result<(u64, u64)> {
    let signer = config.wallet.address;
    let latest = client.get_transaction_count(signer, BlockTag::Latest).await?;
    let pending = client.get_transaction_count(signer, BlockTag::Pending).await?;
    debug!("Nonces for {}: latest {}, pending {}", signer, latest, pending);
    Ok((latest, pending))
}
