use std::sync::Arc;

use fedavg::{
    data::SyntheticData, Advance, ClientAgent, Coordinator, Event, FedAvgError, Hyperparams,
    LinearModel, LocalUpdate, Message, NoopObserver, Observer, Receipt, RoundState,
    TrainingSchedule,
};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn hyperparams(dimension: usize) -> Hyperparams {
    Hyperparams {
        input_dimension: dimension,
        ..Hyperparams::default()
    }
}

fn clients(n: u32, dimension: usize, observer: Arc<dyn Observer>) -> Vec<ClientAgent> {
    let data = SyntheticData::default();
    (0..n)
        .map(|id| {
            ClientAgent::new(
                id,
                LinearModel::new(hyperparams(dimension), 100 + u64::from(id)),
                data.generate(id, dimension).unwrap(),
                TrainingSchedule::default(),
                Arc::clone(&observer),
            )
        })
        .collect()
}

/// Sends a message through the wire codec.
fn wire(msg: impl Into<Message>) -> Message {
    Message::decode(&msg.into().encode().unwrap()).unwrap()
}

fn local_update(round_id: u32, client_id: u32, weights: &str, samples: u64) -> LocalUpdate {
    LocalUpdate {
        round_id,
        client_id,
        weights: weights.into(),
        sample_count: samples,
        accuracy: 0.0,
    }
}

/// Plays one full round: broadcast, train every client, report back.
fn play_round(coordinator: &mut Coordinator, clients: &mut [ClientAgent]) -> Vec<Receipt> {
    let Advance::Started(global) = coordinator.advance() else {
        panic!("coordinator already completed");
    };
    let Message::GlobalUpdate(global) = wire(global) else {
        panic!("expected a global update");
    };

    for client in clients.iter_mut() {
        assert!(client.on_global_update(&global).is_some());
    }

    clients
        .iter_mut()
        .filter_map(ClientAgent::train_and_report)
        .map(|update| {
            let Message::LocalUpdate(update) = wire(update) else {
                panic!("expected a local update");
            };
            coordinator.handle_local_update(update).unwrap()
        })
        .collect()
}

#[test]
fn three_client_weighted_average() {
    let mut coordinator =
        Coordinator::new(3, 5, LinearModel::new(hyperparams(2), 0), Arc::new(NoopObserver));
    assert_ok!(coordinator.global_model_mut().set_weights(vec![0.0; 3]));
    coordinator.advance();

    for update in [
        local_update(1, 0, "1;0;0", 10),
        local_update(1, 1, "0;2;0", 30),
        local_update(1, 2, "0;0;3", 10),
    ] {
        let Message::LocalUpdate(update) = wire(update) else {
            unreachable!()
        };
        assert_ok!(coordinator.handle_local_update(update));
    }

    let weights = coordinator.global_model().weights();
    for (w, expected) in weights.iter().zip([0.2, 1.2, 0.6]) {
        assert!((w - expected).abs() < 1e-12, "got {weights:?}");
    }
}

#[test]
fn federated_rounds_improve_the_global_model() {
    let dimension = 5;
    let mut coordinator = Coordinator::new(
        3,
        10,
        LinearModel::new(hyperparams(dimension), 0),
        Arc::new(NoopObserver),
    );
    let mut clients = clients(3, dimension, Arc::new(NoopObserver));
    let validation = SyntheticData::default().generate(7, dimension).unwrap();

    let before = coordinator
        .global_model()
        .mean_absolute_error(&validation)
        .unwrap()
        .unwrap();

    for _ in 0..10 {
        let receipts = play_round(&mut coordinator, &mut clients);
        assert!(matches!(receipts.last(), Some(Receipt::Aggregated(s)) if s.total_samples == 360));
    }

    let after = coordinator
        .global_model()
        .mean_absolute_error(&validation)
        .unwrap()
        .unwrap();
    assert!(after < before, "error went from {before} to {after}");

    assert_eq!(coordinator.advance(), Advance::Completed { rounds: 10 });
}

#[test]
fn aggregation_fires_once_per_round() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = Arc::new(fedavg::ChannelObserver::new(tx));
    let mut coordinator = Coordinator::new(2, 3, LinearModel::new(hyperparams(1), 0), observer);

    coordinator.advance();
    assert_ok!(coordinator.handle_local_update(local_update(1, 0, "1;1", 1)));
    assert_ok!(coordinator.handle_local_update(local_update(1, 0, "1;1", 1)));
    assert_ok!(coordinator.handle_local_update(local_update(1, 1, "3;3", 1)));
    assert_ok!(coordinator.handle_local_update(local_update(1, 1, "5;5", 1)));

    let aggregations = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, Event::RoundAggregated { .. }))
        .count();
    assert_eq!(aggregations, 1);
    assert_eq!(coordinator.global_model().weights(), &[2.0, 2.0]);
}

#[test]
fn stale_update_is_rejected_without_side_effects() {
    let mut coordinator =
        Coordinator::new(2, 3, LinearModel::new(hyperparams(1), 0), Arc::new(NoopObserver));
    coordinator.advance();
    assert_ok!(coordinator.handle_local_update(local_update(1, 0, "1;1", 4)));
    coordinator.advance();

    let err = assert_err!(coordinator.handle_local_update(local_update(1, 1, "2;2", 4)));
    assert!(matches!(err, FedAvgError::StaleRound { current: Some(2), got: 1 }));
    assert!(coordinator.record().is_empty());
}

#[test]
fn round_timer_advances_unaggregated_rounds() {
    let initial = LinearModel::new(hyperparams(1), 3);
    let weights = initial.weights().to_vec();
    let mut coordinator = Coordinator::new(2, 2, initial, Arc::new(NoopObserver));

    let Advance::Started(first) = coordinator.advance() else {
        panic!("expected round 1");
    };
    assert_ok!(coordinator.handle_local_update(local_update(1, 0, "9;9", 4)));

    let Advance::Started(second) = coordinator.advance() else {
        panic!("expected round 2");
    };
    assert_eq!(first.weights, second.weights);
    assert_eq!(coordinator.global_model().weights(), weights.as_slice());

    assert_eq!(coordinator.advance(), Advance::Completed { rounds: 2 });
    assert_eq!(coordinator.state(), RoundState::Completed);
}

#[test]
fn client_reports_its_sample_count() {
    let mut clients = clients(2, 3, Arc::new(NoopObserver));
    let global = fedavg::GlobalUpdate::new(1, "0;0;0;0".into());

    for client in clients.iter_mut() {
        client.on_global_update(&global);
    }
    let reports: Vec<_> = clients
        .iter_mut()
        .filter_map(ClientAgent::train_and_report)
        .collect();

    assert_eq!(reports[0].sample_count, 100);
    assert_eq!(reports[1].sample_count, 120);
    assert!(reports.iter().all(|r| r.reported_accuracy().is_some()));
}

#[test]
fn huge_sample_counts_do_not_bring_down_the_coordinator() {
    let mut coordinator =
        Coordinator::new(2, 2, LinearModel::new(hyperparams(1), 0), Arc::new(NoopObserver));
    let before = coordinator.global_model().weights().to_vec();
    coordinator.advance();

    let payloads = [
        format!(
            r#"{{"type":"LOCAL_UPDATE","roundId":1,"senderId":0,"weights":"1;1","sampleCount":{}}}"#,
            u64::MAX
        ),
        r#"{"type":"LOCAL_UPDATE","roundId":1,"senderId":1,"weights":"2;2","sampleCount":1}"#
            .to_string(),
    ];

    let receipts: Vec<_> = payloads
        .iter()
        .map(|payload| {
            let Message::LocalUpdate(update) = assert_ok!(Message::decode(payload.as_bytes()))
            else {
                panic!("expected a local update");
            };
            assert_ok!(coordinator.handle_local_update(update))
        })
        .collect();

    assert!(matches!(
        receipts.last(),
        Some(Receipt::Skipped(FedAvgError::AggregationSkipped { round: 1, .. }))
    ));
    assert_eq!(coordinator.global_model().weights(), before.as_slice());
    assert!(matches!(coordinator.advance(), Advance::Started(u) if u.round_id == 2));
}
