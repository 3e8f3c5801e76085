use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use latchkey_clock::DurationMillis;
use latchkey_tokens::{sources, TokenCache, TokenResponse};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// Number of concurrent tasks requesting a token
    #[arg(short, long, env, default_value_t = 32)]
    tasks: usize,

    /// Lifetime, in seconds, declared by the simulated authority
    #[arg(short, long, env, default_value_t = 2)]
    expires_in: u64,

    /// Simulated latency of the authority, in milliseconds
    #[arg(short, long, env, default_value_t = 250)]
    latency: u64,

    /// Number of rounds to run
    #[arg(short, long, env, default_value_t = 5)]
    rounds: u32,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let issued = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&issued);
    let latency = Duration::from_millis(opts.latency);
    let expires_in = opts.expires_in;

    let cache = TokenCache::new(sources::from_fn(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            time::sleep(latency).await;
            Ok::<_, std::io::Error>(TokenResponse::new(
                format!("token-{n:04}"),
                Some(expires_in),
            ))
        }
    }))
    .with_max_age_fn(TokenResponse::expires_in);

    for round in 1..=opts.rounds {
        let tasks: Vec<_> = (0..opts.tasks)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.fetch().await })
            })
            .collect();

        for task in tasks {
            let token = task.await??;
            tracing::debug!(expires_in = token.expires_in, "task obtained token");
        }

        tracing::info!(
            round,
            tokens_issued = issued.load(Ordering::SeqCst),
            expires_at = cache.expires_at().map(|t| t.0),
            "round complete"
        );

        time::sleep(Duration::from(DurationMillis::from_secs(1))).await;
    }

    Ok(())
}
