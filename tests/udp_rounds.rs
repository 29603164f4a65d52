use std::{sync::Arc, time::Duration};

use actix::prelude::*;
use fedavg::{
    data::SyntheticData,
    runtime::{ClientActor, CoordinatorActor, Shutdown, Snapshot, UdpEndpoint},
    ChannelObserver, ClientAgent, Coordinator, Event, Hyperparams, LinearModel, Observer,
    RoundState, RoundTiming, TrainingSchedule,
};
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};

const DIMENSION: usize = 3;

fn hyperparams() -> Hyperparams {
    Hyperparams {
        input_dimension: DIMENSION,
        ..Hyperparams::default()
    }
}

#[actix_rt::test]
async fn rounds_complete_over_loopback() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer: Arc<dyn Observer> = Arc::new(ChannelObserver::new(tx));
    let data = SyntheticData::default();

    let coordinator_endpoint = UdpEndpoint::bind("127.0.0.1:0").await.unwrap();
    let coordinator_addr = coordinator_endpoint.local_addr();

    let mut client_addrs = Vec::new();
    let mut clients = Vec::new();
    for id in 0..3 {
        let endpoint = UdpEndpoint::bind("127.0.0.1:0").await.unwrap();
        client_addrs.push(Some(endpoint.local_addr()));

        let agent = ClientAgent::new(
            id,
            LinearModel::new(hyperparams(), u64::from(id)),
            data.generate(id, DIMENSION).unwrap(),
            TrainingSchedule {
                base: Duration::from_millis(10),
                stagger: Duration::from_millis(5),
            },
            Arc::clone(&observer),
        );
        clients.push(ClientActor::new(agent, Some(coordinator_addr), endpoint).start());
    }

    let coordinator = Coordinator::new(
        3,
        3,
        LinearModel::new(hyperparams(), 42),
        Arc::clone(&observer),
    );
    let timing = RoundTiming {
        start_delay: Duration::from_millis(50),
        round_interval: Duration::from_millis(500),
    };
    let coordinator =
        CoordinatorActor::new(coordinator, timing, client_addrs, coordinator_endpoint).start();

    let events = timeout(Duration::from_secs(10), async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, Event::Completed { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    })
    .await
    .expect("federation did not complete in time");

    let aggregated: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::RoundAggregated {
                round,
                contributors,
                total_samples,
            } => Some((*round, *contributors, *total_samples)),
            _ => None,
        })
        .collect();
    assert_eq!(aggregated, vec![(1, 3, 360), (2, 3, 360), (3, 3, 360)]);
    assert_eq!(events.last(), Some(&Event::Completed { rounds: 3 }));

    let snapshot = coordinator.send(Snapshot).await.unwrap();
    assert_eq!(snapshot.state, RoundState::Completed);
    assert_eq!(snapshot.global_weights.len(), DIMENSION + 1);

    coordinator.send(Shutdown).await.unwrap();
    for client in clients {
        client.send(Shutdown).await.unwrap();
    }
}

#[actix_rt::test]
async fn shutdown_cancels_the_first_round() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        1,
        1,
        LinearModel::new(hyperparams(), 0),
        Arc::new(ChannelObserver::new(tx)),
    );
    let endpoint = UdpEndpoint::bind("127.0.0.1:0").await.unwrap();
    let coordinator_addr = endpoint.local_addr();
    let timing = RoundTiming {
        start_delay: Duration::from_millis(200),
        round_interval: Duration::from_millis(200),
    };
    let coordinator = CoordinatorActor::new(coordinator, timing, vec![None], endpoint).start();

    // garbage is dropped without disturbing the round state
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"not json", coordinator_addr).await.unwrap();
    actix_rt::time::sleep(Duration::from_millis(50)).await;

    let snapshot = coordinator.send(Snapshot).await.unwrap();
    assert_eq!(snapshot.state, RoundState::Idle);
    assert_eq!(snapshot.received, 0);

    coordinator.send(Shutdown).await.unwrap();
    actix_rt::time::sleep(Duration::from_millis(400)).await;

    assert!(rx.try_recv().is_err());
}
