use clap::{Parser, Subcommand};

use orderdw::{Database, OrderDW, OrderQuery, SyncMode};

#[derive(Parser)]
#[command(name = "orderdw", about = "Order data warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.orderdw/orderdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync orders from the platform to the local warehouse
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Audit a year against the platform and repair missing days
    Reconcile {
        /// Year to audit (e.g. 2026)
        year: i32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Query the local order mirror with filters
    Query {
        /// Filter by store name
        #[arg(long)]
        store: Option<String>,
        /// Filter by order status
        #[arg(long)]
        status: Option<String>,
        /// Filter by marketplace id
        #[arg(long)]
        marketplace: Option<String>,
        /// Purchased after date (YYYY-MM-DD)
        #[arg(long)]
        purchased_after: Option<String>,
        /// Purchased before date (YYYY-MM-DD)
        #[arg(long)]
        purchased_before: Option<String>,
        /// Updated after date (YYYY-MM-DD)
        #[arg(long)]
        updated_after: Option<String>,
        /// Updated before date (YYYY-MM-DD)
        #[arg(long)]
        updated_before: Option<String>,
        /// Filter by buyer name fragment
        #[arg(long)]
        buyer: Option<String>,
        /// Refunded orders only
        #[arg(long)]
        refunded: bool,
        /// Maximum results
        #[arg(long, default_value = "100")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Output as CSV
        #[arg(long)]
        csv: bool,
        /// Count only (no output rows)
        #[arg(long)]
        count: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Freshness sync over the last 24 hours of updates
    Auto {
        /// Order ids to refresh first, before the background sync
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
    },
    /// Sync a purchase-date range (ranges over 7 days are narrowed)
    Range {
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// End date (YYYY-MM-DD), inclusive
        #[arg(long)]
        end: String,
    },
    /// Backfill a full year by purchase date
    History {
        /// Year to backfill (e.g. 2025)
        year: i32,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

fn parse_date(value: &str) -> anyhow::Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("invalid date '{value}', expected YYYY-MM-DD"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    match cli.command {
        Commands::Status => {
            print_status(&db).await?;
        }
        Commands::Config { action } => {
            handle_config(&db, action).await?;
        }
        Commands::Query {
            store,
            status,
            marketplace,
            purchased_after,
            purchased_before,
            updated_after,
            updated_before,
            buyer,
            refunded,
            limit,
            json,
            csv,
            count,
        } => {
            let mut query = OrderQuery::new().limit(limit);
            if let Some(v) = store.as_deref() {
                query = query.store(v);
            }
            if let Some(v) = status.as_deref() {
                query = query.status(v);
            }
            if let Some(v) = marketplace.as_deref() {
                query = query.marketplace(v);
            }
            if let Some(v) = purchased_after.as_deref() {
                query = query.purchased_after(v);
            }
            if let Some(v) = purchased_before.as_deref() {
                query = query.purchased_before(v);
            }
            if let Some(v) = updated_after.as_deref() {
                query = query.updated_after(v);
            }
            if let Some(v) = updated_before.as_deref() {
                query = query.updated_before(v);
            }
            if let Some(v) = buyer.as_deref() {
                query = query.buyer_contains(v);
            }
            if refunded {
                query = query.refunded(true);
            }
            handle_query(&db, query, json, csv, count).await?;
        }
        Commands::Sync { target } => {
            let dw = OrderDW::from_env(db)?;
            handle_sync(&dw, target).await?;
        }
        Commands::Reconcile { year, json } => {
            let dw = OrderDW::from_env(db)?;
            let report = dw.reconcile_year(year).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_reconciliation(&report);
            }
        }
    }

    Ok(())
}

async fn handle_sync(dw: &OrderDW, target: SyncTarget) -> anyhow::Result<()> {
    let (mode, ids) = match target {
        SyncTarget::Auto { ids } => (SyncMode::Auto, ids),
        SyncTarget::Range { start, end } => {
            let start = parse_date(&start)?.and_hms_opt(0, 0, 0).unwrap();
            let end = parse_date(&end)?.and_hms_opt(23, 59, 59).unwrap();
            if end < start {
                anyhow::bail!("end date is before start date");
            }
            (SyncMode::Manual { start, end }, Vec::new())
        }
        SyncTarget::History { year } => (SyncMode::History { year }, Vec::new()),
    };

    let outcome = dw.sync(mode, &ids).await?;
    if outcome.hot_synced > 0 {
        println!("Refreshed {} priority orders", outcome.hot_synced);
    }
    if outcome.narrowed {
        println!("Note: range exceeded 7 days; synced the last 5 days only.");
    }
    println!(
        "Synced {} orders over {} pages ({})",
        outcome.background.synced_count, outcome.background.pages, outcome.background.window
    );
    if outcome.background.stalled {
        println!("Warning: platform pagination stalled; run ended at the repeated page.");
    }
    Ok(())
}

async fn handle_query(
    db: &Database,
    query: OrderQuery,
    json: bool,
    csv: bool,
    count: bool,
) -> anyhow::Result<()> {
    if count {
        println!("{}", query.count(db).await?);
    } else if json {
        println!("{}", query.to_json(db).await?);
    } else if csv {
        print!("{}", query.to_csv(db).await?);
    } else {
        let rows = query.orders(db).await?;
        if rows.is_empty() {
            println!("No orders found.");
            return Ok(());
        }
        for row in &rows {
            println!(
                "{}  {:<12} {:>10.2} {:<3}  {}  {}",
                row.order_id,
                row.status,
                row.amount,
                row.currency.as_deref().unwrap_or(""),
                row.purchase_at.as_deref().unwrap_or("-"),
                row.store_name,
            );
        }
        println!("({} orders)", rows.len());
    }
    Ok(())
}

async fn print_status(db: &Database) -> anyhow::Result<()> {
    let stats = db
        .reader()
        .call(|conn| {
            let orders: i64 =
                conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?;
            let items: i64 =
                conn.query_row("SELECT COUNT(*) FROM order_items", [], |row| row.get(0))?;
            let stores: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT store_name) FROM orders",
                [],
                |row| row.get(0),
            )?;
            let last_sync = orderdw::storage::repository::get_config(
                conn,
                orderdw::storage::repository::LAST_SYNCED_AT,
            )?;
            Ok::<_, rusqlite::Error>((orders, items, stores, last_sync))
        })
        .await?;

    let (orders, items, stores, last_sync) = stats;
    println!("Warehouse Status");
    println!("  Orders:    {orders}");
    println!("  Items:     {items}");
    println!("  Stores:    {stores}");
    println!(
        "  Last sync: {}",
        last_sync.unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

fn print_reconciliation(report: &orderdw::ReconciliationReport) {
    println!("Reconciliation for {}", report.year);
    for month in &report.months {
        println!(
            "  {}-{:02}  external {:>6}  local {:>6}  {:?}",
            month.year, month.month, month.external, month.local, month.status
        );
    }
    if report.repairs.is_empty() {
        println!("No repairs needed.");
    } else {
        println!("Repaired {} days:", report.repairs.len());
        for (day, repair) in report.deficit_days.iter().zip(&report.repairs) {
            println!(
                "  {}  was {}/{}  re-synced {} orders",
                day.day, day.local, day.external, repair.synced_count
            );
        }
    }
}

async fn handle_config(db: &Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| orderdw::storage::repository::get_config(conn, &key)
                })
                .await?;
            match val {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            db.writer()
                .call(move |conn| {
                    orderdw::storage::repository::set_config(conn, &key, &value)?;
                    Ok::<(), rusqlite::Error>(())
                })
                .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items: Vec<(String, String)> = db
                .reader()
                .call(|conn| orderdw::storage::repository::list_config(conn))
                .await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
