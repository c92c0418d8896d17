use colored::Colorize;
use log::{error, info, warn};
use ossea_migrate::api::{self, RocketExt};
use ossea_migrate::clients::cloudstack::{CloudAdapter, CloudStackClient};
use ossea_migrate::clients::{AgentClient, VolumeDaemonClient};
use ossea_migrate::config::APP_CONFIG;
use ossea_migrate::credentials::EncryptionKey;
use ossea_migrate::db::queries::{cloud_config, enrollment as enrollment_queries};
use ossea_migrate::jobtracker::recovery::{FailoverProbe, RecoveryScanner, VolumeOpProbe};
use ossea_migrate::scheduler::Scheduler;
use ossea_migrate::workflows::Workflows;
use ossea_migrate::{logging, DatabaseManager};
use ossea_migrate::agent::auth::TokenAuthority;
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init("orchestrator");
    logging::print_banner("OSSEA-Migrate Orchestrator", |s| s.blue());

    // Fatal preconditions: a half-configured orchestrator accepting work it
    // cannot finish is worse than one that refuses to start
    let encryption_key = match EncryptionKey::from_env() {
        Ok(key) => key,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Credential encryption key loaded (fingerprint {})", encryption_key.fingerprint());

    let database_url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            error!("DATABASE_URL is not set; refusing to start");
            std::process::exit(1);
        }
    };

    let db = match DatabaseManager::new(&database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!("Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    let pool = db.get_pool().clone();

    let active_config = match cloud_config::get_active(&pool).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            error!("No active cloud configuration; run the setup wizard and mark one active");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Reading cloud configuration failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("Active cloud configuration: {} ({})", active_config.name, active_config.api_url);

    let config = APP_CONFIG.clone();
    let cloud: Arc<dyn CloudAdapter> = Arc::new(CloudStackClient::new(active_config.api_url.clone()));
    let volumes = Arc::new(VolumeDaemonClient::new(config.orchestrator.volume_daemon_url.clone()));

    // The agent bearer token is derived from the approved enrollment; until
    // one exists, agent calls will be refused and that is correct
    let bearer_token = match latest_approved_token(&pool).await {
        Some(token) => token,
        None => {
            warn!("No approved agent enrollment yet; agent calls will fail until one is approved");
            String::new()
        }
    };
    let agent = Arc::new(AgentClient::new(
        config.orchestrator.agent_url.clone(),
        bearer_token,
        Duration::from_secs(config.timeouts.agent_discover_secs),
    ));

    let workflows = Workflows::new(
        pool.clone(),
        agent.clone(),
        volumes.clone(),
        cloud,
        config.timeouts.clone(),
    );

    // Recovery before serving: every open job is reconciled against the
    // subsystem that owns it, then surviving replications resume polling
    let mut scanner = RecoveryScanner::new(pool.clone());
    scanner.register_probe("replication", agent.clone());
    scanner.register_probe("volume", Arc::new(VolumeOpProbe::new(pool.clone())));
    scanner.register_probe("failover", Arc::new(FailoverProbe::new(pool.clone())));
    match scanner.run().await {
        Ok(open) => info!("Recovery scan done; {} job(s) left open", open.len()),
        Err(e) => {
            error!("Recovery scan failed: {}", e);
            std::process::exit(1);
        }
    }
    let resumed = workflows.clone().resume_active_replications().await?;
    if resumed > 0 {
        info!("Resumed polling for {} replication(s)", resumed);
    }

    let scheduler = Scheduler::new(pool.clone(), workflows.clone());
    tokio::spawn(async move {
        scheduler.run().await;
    });
    tokio::spawn(
        workflows
            .clone()
            .run_snapshot_retention(config.orchestrator.snapshot_retention_hours),
    );

    let _rocket = rocket::build()
        .configure(rocket::Config {
            port: config.orchestrator.port,
            address: config.orchestrator.management_address.parse()?,
            ..Default::default()
        })
        .manage(pool)
        .manage(workflows)
        .mount_routes(api::all_routes())
        .launch()
        .await?;

    Ok(())
}

/// Token for the most recently approved agent, derived from the enrollment
/// material both sides hold.
async fn latest_approved_token(pool: &sqlx::Pool<sqlx::MySql>) -> Option<String> {
    let enrollment = enrollment_queries::list_approved(pool).await.ok()?.pop()?;
    let authority = TokenAuthority::derive(&enrollment.public_key, &enrollment.pairing_code);
    authority
        .issue("orchestrator", Duration::from_secs(30 * 24 * 3600))
        .ok()
}
