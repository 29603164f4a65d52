use std::{env, sync::Arc};

use actix::System;
use anyhow::{bail, Context};
use log::info;
use tokio::{signal, sync::mpsc};

use fedavg::{
    runtime::{self, Shutdown},
    ClientId, Config, Event, LogObserver, Observer, Simulation,
};

const USAGE: &str = "usage: fedavg <coordinator [config] | client <id> [config] | simulate [config]>";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(mode) = args.first() else {
        bail!(USAGE);
    };

    match mode.as_str() {
        "coordinator" => run_coordinator(load(args.get(1))?),
        "client" => {
            let id = args
                .get(1)
                .with_context(|| USAGE)?
                .parse::<ClientId>()
                .context("client id must be a non-negative integer")?;

            let mut config = load(args.get(2))?;
            config.client.id = id;
            run_client(config)
        }
        "simulate" => simulate(load(args.get(1))?),
        other => bail!("unknown mode '{other}'\n{USAGE}"),
    }
}

fn load(path: Option<&String>) -> anyhow::Result<Config> {
    Config::from_path_or_env(path.map(String::as_str)).context("failed to load configuration")
}

fn run_coordinator(config: Config) -> anyhow::Result<()> {
    System::new().block_on(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = move |event: Event| {
            LogObserver.observe(event.clone());
            let _ = tx.send(event);
        };

        let coordinator = runtime::spawn_coordinator(&config, Arc::new(observer))
            .await
            .context("failed to start coordinator")?;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Event::Completed { rounds }) => {
                        info!("all {rounds} rounds done");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
            }
        }

        coordinator.do_send(Shutdown);
        Ok::<_, anyhow::Error>(())
    })
}

fn run_client(config: Config) -> anyhow::Result<()> {
    System::new().block_on(async move {
        let client = runtime::spawn_client(&config, Arc::new(LogObserver))
            .await
            .with_context(|| format!("failed to start client {}", config.client.id))?;

        signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
        info!("interrupted");

        client.do_send(Shutdown);
        Ok::<_, anyhow::Error>(())
    })
}

fn simulate(config: Config) -> anyhow::Result<()> {
    let mut simulation =
        Simulation::from_config(&config, Arc::new(LogObserver)).context("invalid simulation")?;
    let report = simulation.run();

    info!(
        "simulation ended in state {:?} after {:?}: {:?}",
        report.state, report.elapsed, report.stats
    );
    println!("{}", serde_json::to_string(&report.global_weights)?);
    Ok(())
}
