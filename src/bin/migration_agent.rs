use colored::Colorize;
use log::{error, info, warn};
use ossea_migrate::agent::api as agent_api;
use ossea_migrate::agent::auth::TokenAuthority;
use ossea_migrate::agent::replication::{EngineConfig, ReplicationEngine};
use ossea_migrate::agent::vsphere::{DataMoverAdapter, VsphereAdapter};
use ossea_migrate::config::APP_CONFIG;
use ossea_migrate::logging;
use ossea_migrate::tunnel::enrollment::{generate_pairing_code, EnrollmentKeys};
use ossea_migrate::tunnel::{TunnelConfig, TunnelManager};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init("migration-agent");
    logging::print_banner("OSSEA-Migrate Agent", |s| s.green());

    let config = APP_CONFIG.clone();

    let keys = match EnrollmentKeys::ensure(&config.agent.key_dir) {
        Ok(keys) => keys,
        Err(e) => {
            error!("Enrollment keypair unavailable: {:#}", e);
            std::process::exit(1);
        }
    };
    let pairing_code = load_or_create_pairing_code(&config.agent.key_dir)?;

    // Until the operator approves the key, the control tunnel is unusable;
    // enrollment blocks startup by design
    if let Err(e) = enroll_and_wait(&keys, &pairing_code, &config).await {
        error!("Enrollment failed: {:#}", e);
        std::process::exit(1);
    }

    let tunnel = TunnelManager::new(TunnelConfig {
        oma_host: config.agent.oma_management_address.clone(),
        oma_ssh_port: config.agent.oma_ssh_port,
        tunnel_user: config.agent.tunnel_user.clone(),
        private_key_path: keys.private_key_path.to_string_lossy().into_owned(),
        local_forward_port: 18082,
        orchestrator_port: config.orchestrator.port,
        remote_forward_port: config.orchestrator.agent_forward_port,
        agent_port: config.agent.port,
    });
    tunnel.spawn();

    let vsphere: Arc<dyn VsphereAdapter> =
        Arc::new(DataMoverAdapter::new(config.agent.datamover_url.clone()));

    let engine = Arc::new(ReplicationEngine::new(
        vsphere.clone(),
        EngineConfig {
            workers_per_disk: config.agent.workers_per_disk,
            chunk_write_timeout: Duration::from_secs(config.timeouts.chunk_write_secs),
            // CBT cursors go back over the control tunnel's local forward
            orchestrator_url: "http://127.0.0.1:18082".to_string(),
        },
    ));

    let authority = Arc::new(TokenAuthority::derive(&keys.public_key, &pairing_code));

    info!("Agent API listening on 127.0.0.1:{}", config.agent.port);
    let _rocket = rocket::build()
        .configure(rocket::Config {
            port: config.agent.port,
            // Reachable only through the tunnel's reverse forward
            address: "127.0.0.1".parse()?,
            ..Default::default()
        })
        .manage(vsphere)
        .manage(engine)
        .manage(authority)
        .mount("/", agent_api::api_routes())
        .launch()
        .await?;

    Ok(())
}

/// The pairing code must survive restarts: the bearer-token secret is
/// derived from it on both sides.
fn load_or_create_pairing_code(key_dir: &str) -> Result<String, std::io::Error> {
    let path = Path::new(key_dir).join("pairing_code");
    match std::fs::read_to_string(&path) {
        Ok(code) => Ok(code.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let code = generate_pairing_code();
            std::fs::write(&path, &code)?;
            Ok(code)
        }
        Err(e) => Err(e),
    }
}

/// First-boot bootstrap: present the public key, show the pairing code on
/// the console, poll until the operator approves.
async fn enroll_and_wait(
    keys: &EnrollmentKeys,
    pairing_code: &str,
    config: &ossea_migrate::config::AppConfig,
) -> anyhow::Result<()> {
    let bootstrap_url = format!(
        "http://{}:{}/api/v1/agents",
        config.agent.oma_management_address, config.agent.oma_api_port
    );
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;

    let id_path = Path::new(&config.agent.key_dir).join("enrollment_id");
    let enrollment_id = match std::fs::read_to_string(&id_path) {
        Ok(id) => id.trim().to_string(),
        Err(_) => {
            let response = http
                .post(format!("{}/enroll", bootstrap_url))
                .json(&serde_json::json!({
                    "agent_name": hostname(),
                    "public_key": keys.public_key,
                    "pairing_code": pairing_code,
                }))
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::CONFLICT {
                // Key already enrolled in a previous run; nothing to wait on
                info!("Enrollment key already known to the orchestrator");
                return Ok(());
            }
            if !response.status().is_success() {
                anyhow::bail!("enrollment rejected: HTTP {}", response.status());
            }

            let body: serde_json::Value = response.json().await?;
            let id = body["enrollment_id"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("enrollment response carried no id"))?
                .to_string();
            std::fs::write(&id_path, &id)?;
            id
        }
    };

    println!();
    println!("  Pairing code for operator approval: {}", pairing_code.bold());
    println!("  Key fingerprint: {}", keys.fingerprint());
    println!();

    loop {
        let response = http
            .get(format!("{}/enroll/{}", bootstrap_url, enrollment_id))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let body: serde_json::Value = response.json().await?;
                match body["state"].as_str() {
                    Some("approved") => {
                        info!("Enrollment approved");
                        return Ok(());
                    }
                    Some("rejected") => anyhow::bail!("operator rejected this agent's key"),
                    _ => info!("Awaiting operator approval..."),
                }
            }
            Ok(response) => warn!("Enrollment poll returned HTTP {}", response.status()),
            Err(e) => warn!("Enrollment poll failed: {}; retrying", e),
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "vma".to_string())
}
