//! Itinerary relay server.
//!
//! Usage: `relay [config.json]`. Without a file the configuration comes from
//! `ITINERARY_COLLAB_*` environment variables. `ITINERARY_COLLAB_TOKENS`
//! (`token:user,token:user`) restricts access to a fixed token table;
//! otherwise any non-empty token is accepted.

use itinerary_collab::config::ENV_PREFIX;
use itinerary_collab::net::serve;
use itinerary_collab::{CollabConfig, Relay, StaticTokens};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn relay_from_env() -> Relay {
    let Ok(table) = std::env::var(format!("{ENV_PREFIX}TOKENS")) else {
        tracing::warn!("No token table configured; accepting any non-empty token");
        return Relay::accept_all();
    };
    let tokens = table
        .split(',')
        .filter_map(|entry| entry.trim().split_once(':'))
        .fold(StaticTokens::new(), |tokens, (token, user)| {
            tokens.with_token(token, user)
        });
    Relay::new(tokens)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => CollabConfig::from_file(path)?,
        None => CollabConfig::from_env()?,
    };

    tracing::info!("Starting itinerary relay on {}", config.socket_addr());
    serve(relay_from_env(), config).await?;
    Ok(())
}
