use fleetsim::{Backend, FleetConfig, FleetSimulator, Transport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Fleet Telemetry Simulator");
    println!("=========================");

    let config = FleetConfig::from_env().map_err(|e| {
        error!(error = %e, "invalid configuration");
        e
    })?;

    let mut simulator = FleetSimulator::from_config(&config)?;
    let mut transport = Backend::from_config(&config.transport).await?;
    if let Err(e) = transport.health_check().await {
        if config.require_healthy_backend {
            error!(error = %e, transport = transport.name(), "receiver health check failed");
            return Err(e.into());
        }
        warn!(error = %e, transport = transport.name(), "receiver health check failed, streaming anyway");
    }
    info!(
        transport = transport.name(),
        vehicles = config.vehicle_count,
        "telemetry stream starting"
    );

    let summary = simulator
        .run(&mut transport, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    let evolution = simulator.evolution_stats();
    println!();
    println!("Ticks:              {}", summary.ticks);
    println!("Records sent:       {}", summary.records_sent);
    println!("Publish failures:   {}", summary.publish_failures);
    if let Some(rate) = summary.success_rate() {
        println!("Success rate:       {:.1}%", rate * 100.0);
    }
    println!("Anomalous records:  {}", summary.anomalies);
    println!("Saturated spikes:   {}", evolution.saturated_excursions);
    println!("Elapsed:            {:.1}s", summary.elapsed.as_secs_f64());

    let stats = simulator.publish_stats();
    if let Some(last) = stats.recent_failures().last() {
        println!("Last failure:       {} (tick {}): {}", last.vehicle_id, last.tick, last.error);
    }

    Ok(())
}
