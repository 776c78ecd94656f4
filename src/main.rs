use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plan_proxy::cache::spawn_sweeper;
use plan_proxy::cli::{self, Commands, KeyCommands, UserCommands};
use plan_proxy::config::{self, Config};
use plan_proxy::models::entities::RoutingStrategy;
use plan_proxy::proxy::model_mapping::ModelResolver;
use plan_proxy::store::postgres::{NewAccessKey, NewUser, PgStore};
use plan_proxy::vault::{KeyGenerator, KeyHasher};
use plan_proxy::{build_app, AppState};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "plan-proxy"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "plan_proxy=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Some(Commands::User { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_user_command(&db, command).await
        }
        Some(Commands::Key { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_key_command(&db, &cfg, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    if cfg.admin_key.is_none() {
        tracing::warn!("PROXY_ADMIN_KEY is not set; admin API will answer 503");
    }

    let state = Arc::new(AppState::new(cfg, db)?);

    spawn_sweeper(state.auth.cache().clone(), CACHE_SWEEP_INTERVAL);
    spawn_sweeper(state.budget.cache().clone(), CACHE_SWEEP_INTERVAL);
    spawn_sweeper(state.bedrock.key_cache().clone(), CACHE_SWEEP_INTERVAL);

    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("plan-proxy listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_user_command(db: &PgStore, cmd: UserCommands) -> anyhow::Result<()> {
    match cmd {
        UserCommands::Create {
            name,
            description,
            budget,
        } => {
            let user = db
                .create_user(&NewUser {
                    name,
                    description,
                    routing_strategy: RoutingStrategy::PlanFirst,
                    monthly_budget_usd: budget,
                })
                .await?;
            println!(
                "User created:\n  ID:     {}\n  Name:   {}\n  Budget: {}",
                user.id,
                user.name,
                user.monthly_budget_usd
                    .map(|b| format!("${}", b))
                    .unwrap_or_else(|| "none".into())
            );
        }
        UserCommands::List { limit } => {
            let users = db.list_users(limit, 0).await?;
            if users.is_empty() {
                println!("No users found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<24} {:<10} {:<14} BUDGET",
                "ID", "NAME", "STATUS", "ROUTING"
            );
            for u in users {
                println!(
                    "{:<38} {:<24} {:<10} {:<14} {}",
                    u.id,
                    u.name,
                    u.status,
                    u.routing_strategy,
                    u.monthly_budget_usd
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "-".into())
                );
            }
        }
    }
    Ok(())
}

async fn handle_key_command(db: &PgStore, cfg: &Config, cmd: KeyCommands) -> anyhow::Result<()> {
    match cmd {
        KeyCommands::Issue {
            user_id,
            bedrock_region,
            bedrock_model,
        } => {
            match db.get_user(user_id).await? {
                Some(u) if u.is_active() => {}
                _ => anyhow::bail!("User not found or not active: {}", user_id),
            }

            let generated = KeyGenerator::generate();
            let hasher = KeyHasher::new(&cfg.key_hasher_secret);
            let resolver = ModelResolver::from_config(cfg)
                .with_store(Arc::new(db.clone()), cfg.model_mapping_cache_ttl);
            let key = db
                .create_access_key(&NewAccessKey {
                    user_id,
                    key_hash: hasher.hash(&generated.raw_key),
                    key_prefix: generated.key_prefix,
                    bedrock_region: bedrock_region.unwrap_or_else(|| cfg.bedrock_region.clone()),
                    bedrock_model: resolver.resolve(bedrock_model.as_deref().unwrap_or_default()).await,
                })
                .await?;
            println!(
                "Access key issued:\n  ID:     {}\n  Key:    {}\n  Use:    /ak/{}/v1/messages\n(The key is shown only once.)",
                key.id, generated.raw_key, generated.raw_key
            );
        }
        KeyCommands::Revoke { key_id } => {
            if db.revoke_access_key(key_id).await? {
                println!("Access key revoked.");
            } else {
                println!("Access key not found or already revoked.");
            }
        }
    }
    Ok(())
}
