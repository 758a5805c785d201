// One-shot query client.

use meshdb::client::DdbClient;
use meshdb::cluster::Strategy;
use meshdb::config::ClusterConfig;
use meshdb::error::{DbError, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = parse_args()?;
    let config = ClusterConfig::load(&args.config_path)?;
    let client = DdbClient::with_strategy(&config, args.strategy);

    let result = client.send_query(&args.sql).await?;

    match result.node_id {
        Some(node_id) => println!("executed on node {}", node_id),
        None => println!("executed"),
    }
    if result.success {
        if let Some(rows) = &result.data {
            println!("{} rows", rows.len());
            for row in rows {
                println!("  {}", serde_json::Value::Object(row.clone()));
            }
        } else if let Some(rows_affected) = result.rows_affected {
            println!("{} rows affected", rows_affected);
        }
    } else {
        println!(
            "query failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

struct Args {
    config_path: String,
    sql: String,
    strategy: Strategy,
}

const USAGE: &str =
    "usage: meshdb-client --config <file> --query <sql> [--strategy round_robin|least_loaded|random]";

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut sql = None;
    let mut strategy = Strategy::RoundRobin;

    let mut iter = args.iter().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--config" => config_path = iter.next().cloned(),
            "--query" => sql = iter.next().cloned(),
            "--strategy" => {
                strategy = match iter.next().map(String::as_str) {
                    Some("round_robin") => Strategy::RoundRobin,
                    Some("least_loaded") => Strategy::LeastLoaded,
                    Some("random") => Strategy::Random,
                    other => {
                        return Err(DbError::Configuration(format!(
                            "unknown strategy {}; {}",
                            other.unwrap_or("<missing>"),
                            USAGE
                        )))
                    }
                }
            }
            other => {
                return Err(DbError::Configuration(format!(
                    "unknown argument {}; {}",
                    other, USAGE
                )))
            }
        }
    }

    match (config_path, sql) {
        (Some(config_path), Some(sql)) => Ok(Args {
            config_path,
            sql,
            strategy,
        }),
        _ => Err(DbError::Configuration(USAGE.to_string())),
    }
}
