use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

use netforage::input::{Config, Opts};
use netforage::nexus::Nexus;
use netforage::resolver::DnsLookup;
use netforage::storage::MemoryStorage;

/// How often the status line is logged.
const STATS_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut opts = Opts::read();
    let config = Config::read(opts.config_path.clone())?;
    opts.merge(&config);
    debug!("Main() `opts` arguments are {opts:?}");

    let lookup = Arc::new(DnsLookup::from_option(&opts.resolver).await);
    let storage = Arc::new(MemoryStorage::new());
    let nexus = Nexus::new(&opts.engine_config(), storage, lookup)
        .context("cannot set up the subsystems")?;

    nexus.start();

    for host in &opts.hosts {
        match &host.name {
            Some(name) => match nexus.add_host(host.addr, name).await {
                Ok(Some(id)) => info!("Added host #{id} {name} ({})", host.addr),
                Ok(None) => info!("{} is already known", host.addr),
                Err(e) => warn!("Cannot add {name} ({}): {e}", host.addr),
            },
            None => {
                if !nexus.submit(host.addr).await {
                    warn!("{} was not queued for lookup", host.addr);
                }
            }
        }
    }

    let mut stats = tokio::time::interval(STATS_PERIOD);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("cannot listen for Ctrl-C")?;
                break;
            }
            _ = stats.tick() => match nexus.stats().await {
                Ok(stats) => info!("Known so far: {stats}"),
                Err(e) => warn!("Cannot read counts: {e}"),
            },
        }
    }

    info!("Interrupted, shutting down");
    nexus.stop();
    Ok(())
}
