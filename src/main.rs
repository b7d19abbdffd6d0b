use live_tally::config::{self, TallyConfig};
use live_tally::{LiveTally, LiveView};
use log::{error, info, warn};
use std::env;

fn log_view(view: &LiveView) {
    let Some(election_id) = view.election_id else {
        return;
    };
    if view.is_loading {
        info!("Election {}: loading results...", election_id);
        return;
    }
    if let Some(e) = &view.error {
        if e.is_retryable() {
            warn!("Election {}: {} (will retry)", election_id, e);
        } else {
            error!("Election {}: {}", election_id, e);
        }
        return;
    }

    let marker = if view.is_pulsing { " *" } else { "" };
    info!(
        "Election {} [{}]{}: {} votes",
        election_id,
        view.connection_status,
        marker,
        view.results.total_votes()
    );
    for (rank, entry) in view.results.iter().enumerate() {
        info!(
            "  {}. {} ({}): {} votes, {:.2}%",
            rank + 1,
            entry.candidate_name,
            entry.position,
            entry.vote_count,
            entry.display_percentage()
        );
    }
    if let Some(leader) = view.results.leader() {
        info!("  Leading: {}", leader.candidate_name);
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match TallyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    let target = match config::target_from_lookup(|key| env::var(key).ok()) {
        Ok(target) => target,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    let credentials = config::credentials_from_lookup(|key| env::var(key).ok());

    let tally = match LiveTally::from_config(&config, credentials) {
        Ok(tally) => tally,
        Err(e) => {
            error!("Failed to start live tally: {}", e);
            return;
        }
    };

    info!("Watching election {} via {}", target.election_id, config.hub_url);
    tally.watch(target);

    let mut views = tally.subscribe();
    tokio::spawn(async move {
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            log_view(&view);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
    tally.shutdown().await;
}
