use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use tunnelboard_api::{decode, keys, models, Console, HEALTH_POLL};
use tunnelboard_core::{FetchStatus, QueryKey};

#[derive(Parser, Debug)]
#[command(name = "tbctl", version, about = "Tunnelboard admin console CLI")]
struct Cli {
    /// Backend base URL
    #[arg(long = "api", env = "TB_API_BASE", default_value = "http://localhost:8000")]
    api_base: String,

    /// Admin email for authentication
    #[arg(long, env = "TB_EMAIL")]
    email: Option<String>,

    /// Admin password for authentication
    #[arg(long, env = "TB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify credentials against the backend and print the granted role
    Login,
    /// List a console resource
    Ls {
        /// servers | plans | users | vpn-users | admin-users | usage | performance
        resource: String,
    },
    /// Poll a health service and print status transitions until interrupted
    Health {
        /// db | cache | system
        #[arg(default_value = "system")]
        service: String,
        /// Poll cadence in seconds
        #[arg(long = "every", default_value_t = 30)]
        every_secs: u64,
    },
    /// Mark a cached resource stale so its next reader refetches
    Invalidate {
        /// servers | plans | users | vpn-users | admin-users | usage | performance | health
        resource: String,
    },
}

fn resource_key(resource: &str) -> Result<QueryKey> {
    Ok(match resource {
        "servers" => keys::servers(),
        "plans" => keys::plans(),
        "users" => keys::users(),
        "vpn-users" => keys::vpn_users(),
        "admin-users" => keys::admin_users(),
        "usage" => keys::analytics_usage(),
        "performance" => keys::analytics_performance(),
        "health" => keys::health("system"),
        other => return Err(anyhow!("unknown resource: {}", other)),
    })
}

fn init_tracing() {
    let env = std::env::var("TB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TB_METRICS_ADDR; expected host:port");
        }
    }
}

async fn authenticate(console: &Console, cli: &Cli) -> Result<()> {
    match (&cli.email, &cli.password) {
        (Some(email), Some(password)) => {
            let role = console.login(email, password).await?;
            info!(role = ?role, "authenticated");
            Ok(())
        }
        (None, None) => Ok(()), // anonymous; backend will reject protected calls
        _ => Err(anyhow!("both --email and --password are required to authenticate")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let console = Console::new(&cli.api_base)?;
    authenticate(&console, &cli).await?;

    match &cli.command {
        Commands::Login => {
            if !console.session().is_authenticated() {
                return Err(anyhow!("no credentials; pass --email/--password or set TB_EMAIL/TB_PASSWORD"));
            }
            match console.session().role() {
                Some(role) => println!("authenticated as {:?}", role),
                None => println!("authenticated (role unknown)"),
            }
        }
        Commands::Ls { resource } => {
            ls(&console, resource, cli.output).await?;
        }
        Commands::Health { service, every_secs } => {
            watch_health(&console, service, Duration::from_secs(*every_secs)).await?;
        }
        Commands::Invalidate { resource } => {
            let key = resource_key(resource)?;
            console.cache().invalidate(&key);
            println!("invalidated {}", key);
        }
    }
    Ok(())
}

async fn ls(console: &Console, resource: &str, output: Output) -> Result<()> {
    let mut sub = match resource {
        "servers" => console.watch_servers(),
        "plans" => console.watch_plans(),
        "users" => console.watch_users(),
        "vpn-users" => console.watch_vpn_users(),
        "admin-users" => console.watch_admin_users(),
        "usage" => console.watch_usage(),
        "performance" => console.watch_performance(),
        other => return Err(anyhow!("unknown resource: {}", other)),
    };
    let entry = sub.ready().await;
    if entry.status == FetchStatus::Error {
        return Err(anyhow!("fetch failed: {}", entry.error.map(|e| e.to_string()).unwrap_or_default()));
    }
    match output {
        Output::Json => {
            let body = entry.value.unwrap_or(serde_json::Value::Null);
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Output::Human => print_human(resource, &entry)?,
    }
    Ok(())
}

fn print_human(resource: &str, entry: &tunnelboard_core::CacheEntry) -> Result<()> {
    match resource {
        "servers" => {
            let servers: Vec<models::VpnServer> = decode(entry)?;
            for s in servers {
                println!(
                    "{:<12} {:<16} {:<16} {:>4}/{:<4} {:?}",
                    s.name, s.ip_address, s.city, s.current_connections, s.max_connections, s.status
                );
            }
        }
        "plans" => {
            let plans: Vec<models::SubscriptionPlan> = decode(entry)?;
            for p in plans {
                println!("{:<20} {:>8.2} {:>4}d active={}", p.name, p.price, p.duration_days, p.is_active);
            }
        }
        _ => {
            // Pages without a stable human layout fall back to JSON.
            let body = entry.value.clone().unwrap_or(serde_json::Value::Null);
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

async fn watch_health(console: &Console, service: &str, every: Duration) -> Result<()> {
    let every = if every.is_zero() { HEALTH_POLL } else { every };
    let mut sub = console.watch_health(service, every);
    println!("polling /api/v1/health/{} every {}s (ctrl-c to stop)", service, every.as_secs());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping health watch");
                break;
            }
            entry = sub.changed() => {
                match entry.status {
                    FetchStatus::Success => match decode::<models::SystemHealth>(&entry) {
                        Ok(h) => println!("{} {:?} {}", h.service, h.status, h.message.unwrap_or_default()),
                        Err(_) => println!("{}", entry.value.unwrap_or(serde_json::Value::Null)),
                    },
                    FetchStatus::Error => {
                        warn!(error = ?entry.error, "health fetch failed");
                    }
                    FetchStatus::Idle | FetchStatus::Loading => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_resolve_to_catalog_keys() {
        assert_eq!(resource_key("servers").unwrap(), keys::servers());
        assert_eq!(resource_key("vpn-users").unwrap(), keys::vpn_users());
        assert_eq!(resource_key("usage").unwrap(), keys::analytics_usage());
        assert_eq!(resource_key("health").unwrap(), keys::health("system"));
        assert!(resource_key("nope").is_err());
    }
}
