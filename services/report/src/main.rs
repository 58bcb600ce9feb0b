//! Report Service - Answers the price questions against the loaded store
//!
//! Rows are printed to stdout; progress and errors go through tracing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eess_core::reports::{
    summary, OperatorCount, StationPrice, DEFAULT_MAX_KM, DEFAULT_ORIGIN, DEFAULT_PROVINCE,
    GASOLEO_A, GASOLINA_95_E5,
};
use eess_core::telemetry::init_tracing;
use eess_core::{GeoPoint, PgReports, PriceReports, StationKind};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "report", about = "Runs price reports against the loaded store")]
struct Args {
    /// Print rows as JSON
    #[arg(long, default_value = "false", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Operator with the most stations of one kind
    TopOperator {
        #[arg(long, default_value = "Terrestre")]
        kind: StationKind,
    },
    /// Cheapest station for a fuel in a province
    Cheapest {
        #[arg(long, default_value = GASOLINA_95_E5)]
        fuel: String,
        #[arg(long, default_value = DEFAULT_PROVINCE)]
        province: String,
    },
    /// Most expensive station for a fuel among one kind
    MostExpensive {
        #[arg(long, default_value = GASOLINA_95_E5)]
        fuel: String,
        #[arg(long, default_value = "Maritima")]
        kind: StationKind,
    },
    /// Cheapest station for a fuel within a radius
    Nearest {
        #[arg(long, default_value_t = DEFAULT_ORIGIN.lat, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, default_value_t = DEFAULT_ORIGIN.lon, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long, default_value = GASOLEO_A)]
        fuel: String,
        #[arg(long, default_value_t = DEFAULT_MAX_KM)]
        max_km: f64,
    },
    /// All standing questions
    All,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_operator(title: &str, row: Option<&OperatorCount>) {
    println!("=== {} ===", title);
    match row {
        Some(row) => println!("{} ({} stations)", row.empresa, row.total),
        None => println!("(no stations)"),
    }
}

fn print_station(title: &str, row: Option<&StationPrice>) {
    println!("=== {} ===", title);
    match row {
        Some(row) => println!("{}", row),
        None => println!("(no matching station)"),
    }
}

async fn run(reports: &dyn PriceReports, args: &Args) -> Result<()> {
    match &args.command {
        Command::TopOperator { kind } => {
            let row = reports.top_operator(*kind).await?;
            if args.json {
                return print_json(&row);
            }
            print_operator(&format!("Top operator ({})", kind), row.as_ref());
        }
        Command::Cheapest { fuel, province } => {
            let row = reports.cheapest_in_province(fuel, province).await?;
            if args.json {
                return print_json(&row);
            }
            print_station(&format!("Cheapest {} in {}", fuel, province), row.as_ref());
        }
        Command::MostExpensive { fuel, kind } => {
            let row = reports.most_expensive_by_kind(fuel, *kind).await?;
            if args.json {
                return print_json(&row);
            }
            print_station(&format!("Most expensive {} ({})", fuel, kind), row.as_ref());
        }
        Command::Nearest {
            lat,
            lon,
            fuel,
            max_km,
        } => {
            let origin = GeoPoint { lat: *lat, lon: *lon };
            let row = reports.nearest_cheapest(origin, fuel, *max_km).await?;
            if args.json {
                return print_json(&row);
            }
            print_station(
                &format!("Cheapest {} within {} km of {}, {}", fuel, max_km, lat, lon),
                row.as_ref(),
            );
        }
        Command::All => {
            let answers = summary(reports).await?;
            if args.json {
                return print_json(&answers);
            }
            print_operator("Top land operator", answers.top_land_operator.as_ref());
            print_operator("Top maritime operator", answers.top_maritime_operator.as_ref());
            print_station(
                &format!("Cheapest {} in {}", GASOLINA_95_E5, DEFAULT_PROVINCE),
                answers.cheapest_gasolina_madrid.as_ref(),
            );
            print_station(
                &format!("Most expensive maritime {}", GASOLINA_95_E5),
                answers.most_expensive_maritime_gasolina.as_ref(),
            );
            print_station(
                &format!(
                    "Cheapest {} within {} km of {}, {}",
                    GASOLEO_A, DEFAULT_MAX_KM, DEFAULT_ORIGIN.lat, DEFAULT_ORIGIN.lon
                ),
                answers.cheapest_gasoleo_nearby.as_ref(),
            );
        }
    }
    Ok(())
}

async fn execute(args: &Args) -> Result<()> {
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;
    info!("connected to database");

    let reports = PgReports::new(pool.clone());
    let result = run(&reports, args).await;
    pool.close().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let result = execute(&args).await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "report failed");
    }
    result
}
