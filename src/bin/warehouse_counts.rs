use anyhow::Result;
use clap::Parser;
use game_pulse::cli::warehouse_counts::{self, WarehouseCountsConfig};
use game_pulse::tracing::{init_tracing, DEFAULT_FILTER};

#[derive(Parser, Debug)]
#[command(name = "warehouse_counts", about = "Print row counts for the warehouse tables")]
struct Args {
    /// Optional override for the client-server database URL
    #[arg(long)]
    db_url: Option<String>,
    /// Print JSON instead of a text table
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(DEFAULT_FILTER)?;
    let args = Args::parse();
    warehouse_counts::run(WarehouseCountsConfig {
        database_url: args.db_url,
        json: args.json,
    })
    .await
}
