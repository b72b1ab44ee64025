use std::sync::Arc;

use evse_fleet_sim::config::FleetConfig;
use evse_fleet_sim::registry::SessionRegistry;
use evse_fleet_sim::scheduler;
use evse_fleet_sim::session::SessionIdentity;
use evse_fleet_sim::tnr::NoopRecorder;
use evse_fleet_sim::transport::Endpoint;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "fleet.toml".into());
    let config = FleetConfig::from_file(&config_path)?;

    let station_count: u32 = std::env::var("EVSE_SIM_STATION_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let registry = Arc::new(SessionRegistry::new(Arc::new(NoopRecorder)));

    for i in 0..station_count {
        let charge_point_id = format!("CP-{i:04}");
        let identity = SessionIdentity {
            charge_point_id: charge_point_id.clone(),
            vendor: config.vendor.clone().unwrap_or_else(|| "evse-fleet-sim".into()),
            model: config.model.clone().unwrap_or_else(|| "simulated".into()),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        let endpoint = Endpoint {
            url: config.csms_url.clone(),
            charge_point_id: charge_point_id.clone(),
            auth_token: config.auth_token.clone(),
        };

        let handle = registry.create(identity, config.connectors_per_station, endpoint)?;
        scheduler::spawn_tick_loop(handle);
        tracing::info!(%charge_point_id, "session started");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down fleet");
    Ok(())
}
