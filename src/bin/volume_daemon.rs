use colored::Colorize;
use log::{error, info, warn};
use ossea_migrate::clients::cloudstack::{CloudAdapter, CloudStackClient};
use ossea_migrate::config::APP_CONFIG;
use ossea_migrate::db::queries::cloud_config;
use ossea_migrate::volume_daemon::api as daemon_api;
use ossea_migrate::volume_daemon::device::DeviceWatcher;
use ossea_migrate::volume_daemon::exports::NbdExportManager;
use ossea_migrate::volume_daemon::VolumeService;
use ossea_migrate::{logging, DatabaseManager};
use std::env;
use std::sync::Arc;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init("volume-daemon");
    logging::print_banner("OSSEA-Migrate Volume Daemon", |s| s.cyan());

    let database_url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            error!("DATABASE_URL is not set; refusing to start");
            std::process::exit(1);
        }
    };

    // Schema ownership stays with the orchestrator; the daemon only opens
    // a pool
    let db = match DatabaseManager::connect_existing(&database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!("Database connection failed: {}", e);
            std::process::exit(1);
        }
    };
    let pool = db.get_pool().clone();

    let config = APP_CONFIG.clone();

    // The cloud endpoint comes from the active configuration row; the OMA
    // VM id is re-read per attach, but an endpoint change needs a restart
    let api_url = match cloud_config::get_active(&pool).await {
        Ok(Some(active)) => active.api_url,
        Ok(None) => {
            warn!("No active cloud configuration yet; volume operations will be refused");
            String::from("http://127.0.0.1:8080/client/api")
        }
        Err(e) => {
            error!("Reading cloud configuration failed: {}", e);
            std::process::exit(1);
        }
    };
    let cloud: Arc<dyn CloudAdapter> = Arc::new(CloudStackClient::new(api_url));

    let watcher = DeviceWatcher::new(config.volume_daemon.sys_block_dir.clone());
    let exports = NbdExportManager::new(
        config.volume_daemon.nbd_config_dir.clone(),
        config.volume_daemon.nbd_pid_file.clone(),
        config.volume_daemon.nbd_port,
        config.orchestrator.data_address.clone(),
    );

    let service = Arc::new(VolumeService::new(
        pool,
        cloud,
        watcher,
        exports,
        config.volume_daemon.symlink_dir.clone(),
        config.timeouts.clone(),
    ));

    // The NBD server must start even with zero real exports
    if let Err(e) = service.ensure_dummy_export() {
        warn!("Could not write the dummy export: {}", e);
    }

    info!("Volume daemon listening on 127.0.0.1:{}", config.volume_daemon.port);
    let _rocket = rocket::build()
        .configure(rocket::Config {
            port: config.volume_daemon.port,
            // Loopback only: the orchestrator is the single caller and the
            // API is deliberately unauthenticated
            address: "127.0.0.1".parse()?,
            ..Default::default()
        })
        .manage(service)
        .mount("/", daemon_api::api_routes())
        .launch()
        .await?;

    Ok(())
}
