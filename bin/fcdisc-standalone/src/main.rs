// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use slog::{info, o, warn, Drain};

use fcdisc::ops::{HostOps, SystemClock};
use fcdisc::usdt::register_probes;
use fcdisc::{DiscState, FcHost, PortInfo};

mod config;
mod sim;

#[derive(clap::Parser)]
/// Run fabric discovery and login against a simulated set of remote ports.
struct Args {
    /// Fabric description (TOML).
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Seconds to wait for every port to finish logging in.
    #[clap(short, long, default_value_t = 30, action)]
    timeout: u64,

    /// Print the final port table as JSON.
    #[clap(long, action)]
    json: bool,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn converged(ports: &[PortInfo], expected: usize) -> bool {
    ports.len() >= expected
        && ports.iter().all(|p| p.disc_state == DiscState::LoginComplete)
}

async fn wait_converged(
    host: &FcHost,
    expected: usize,
    limit: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if converged(&host.ports(), expected) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn main() -> anyhow::Result<()> {
    let Args { config, timeout, json } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();
    info!(log, "fcdisc-standalone"; "version" => fcdisc::version());

    let config = config::parse(&config)?;

    let rt =
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let _rt_guard = rt.enter();

    let (fabric, mut completions) =
        sim::SimFabric::new(&config, log.new(o!("component" => "sim")));
    let ops = HostOps {
        fw: fabric.clone(),
        link: fabric.clone(),
        dma: fabric.clone(),
        sessions: fabric.clone(),
        clock: Arc::new(SystemClock),
    };
    let local = config.main.local();
    let host = FcHost::new(log.clone(), config.host.clone(), local, ops)
        .context("invalid host configuration")?;

    // Deliver firmware completions back into the host
    let pump_host = host.clone();
    rt.spawn(async move {
        while let Some(c) = completions.recv().await {
            pump_host.on_exchange_complete(c.id, c.status, c.payload);
        }
    });
    let _reconciler = host.spawn_reconciler();

    let delay = Duration::from_millis(config.main.link_up_delay_ms);
    if !delay.is_zero() {
        info!(log, "link down"; "up_in_ms" => config.main.link_up_delay_ms);
        host.notify_topology_changed();
        rt.block_on(tokio::time::sleep(delay));
        fabric.set_online(true);
    }
    info!(log, "link up"; "topology" => %config.main.topology);
    host.notify_topology_changed();

    let expected = config.ports.len();
    let done = rt.block_on(async {
        let limit = Duration::from_secs(timeout);
        let done = wait_converged(&host, expected, limit).await;
        if tokio::time::timeout(Duration::from_secs(1), host.quiesce())
            .await
            .is_err()
        {
            warn!(log, "exchanges still outstanding";
                "count" => host.exchanges().outstanding());
        }
        done
    });

    let ports = host.ports();
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else {
        for p in ports.iter() {
            println!(
                "{} {} loop_id={} {} {:?}",
                p.wwpn,
                p.port_id,
                p.loop_id,
                <&str>::from(p.disc_state),
                p.port_type,
            );
        }
    }

    if !done {
        let logged_in = ports
            .iter()
            .filter(|p| p.disc_state == DiscState::LoginComplete)
            .count();
        anyhow::bail!(
            "discovery did not converge within {timeout}s \
             ({logged_in} of {expected} ports)"
        );
    }
    info!(log, "all ports logged in"; "count" => ports.len());
    Ok(())
}
