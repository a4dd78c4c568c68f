//! End-to-end federation rounds over an in-memory dataset.
//!
//! An aggregator is simulated inline: it collects the protected updates of
//! all clients, combines them and broadcasts the result back.

use std::sync::Arc;

use pailnet_client::{
    Client, ClientSettings, DatasetSplit, Mode, Sample, SoftmaxRegression, Trainable,
};
use pailnet_core::{
    aggregation::{EncryptedAggregation, PlainAggregation},
    crypto::PaillierKeyPair,
    model::ModelState,
    update::ModelUpdate,
};

const NB_FEATURES: usize = 2;
const NB_CLASSES: usize = 2;

fn settings(mode: Mode) -> ClientSettings {
    ClientSettings {
        mode,
        local_epochs: 2,
        batch_size: 2,
        learning_rate: 0.5,
        momentum: 0.9,
        clip_bound: 0.25,
    }
}

/// Two linearly separable clusters around (1, 0) and (0, 1).
fn dataset() -> Arc<Vec<Sample>> {
    let mut samples = Vec::new();
    for step in 0..8 {
        let jitter = step as f64 * 0.01;
        samples.push(Sample {
            features: vec![1_f64 - jitter, jitter],
            label: 0,
        });
        samples.push(Sample {
            features: vec![jitter, 1_f64 - jitter],
            label: 1,
        });
    }
    Arc::new(samples)
}

fn shards(dataset: &Arc<Vec<Sample>>, nb_clients: usize) -> Vec<DatasetSplit> {
    (0..nb_clients)
        .map(|client| {
            let indices = (0..dataset.len())
                .filter(|index| index % nb_clients == client)
                .collect();
            DatasetSplit::new(dataset.clone(), indices).unwrap()
        })
        .collect()
}

fn plain_delta(update: ModelUpdate) -> ModelState {
    match update {
        ModelUpdate::Plain(delta) => delta,
        ModelUpdate::Encrypted(_) => panic!("expected a plaintext update"),
    }
}

fn max_abs_difference(lhs: &ModelState, rhs: &ModelState) -> f64 {
    lhs.delta(rhs)
        .unwrap()
        .iter()
        .flat_map(|(_, tensor)| tensor.data().iter())
        .fold(0_f64, |max, weight| max.max(weight.abs()))
}

/// Runs federated averaging over plaintext deltas and returns the average
/// loss of every round.
fn run_plain_federation(mode: Mode, nb_clients: usize, nb_rounds: usize) -> Vec<f64> {
    let dataset = dataset();
    let mut global = SoftmaxRegression::new(NB_FEATURES, NB_CLASSES).state();
    let mut clients: Vec<Client<SoftmaxRegression>> = shards(&dataset, nb_clients)
        .into_iter()
        .map(|shard| {
            Client::new(
                settings(mode),
                shard,
                SoftmaxRegression::new(NB_FEATURES, NB_CLASSES),
                &global,
            )
            .unwrap()
        })
        .collect();

    let mut round_losses = Vec::new();
    for _ in 0..nb_rounds {
        let mut aggregation = PlainAggregation::new();
        let mut losses = 0_f64;
        for client in clients.iter_mut() {
            let (update, loss) = client.train().unwrap();
            losses += loss;
            let delta = plain_delta(update);
            aggregation.validate_aggregation(&delta).unwrap();
            aggregation.aggregate(delta).unwrap();
        }
        round_losses.push(losses / nb_clients as f64);

        global = global.added(&aggregation.average().unwrap()).unwrap();
        for client in clients.iter_mut() {
            client.update(ModelUpdate::Plain(global.clone())).unwrap();
            assert_eq!(client.model_state(), global);
        }
    }
    round_losses
}

#[test]
fn test_plain_federation_learns() {
    let losses = run_plain_federation(Mode::Plain, 3, 4);
    assert!(losses.iter().all(|loss| loss.is_finite()));
    assert!(losses.last().unwrap() < losses.first().unwrap());
}

#[test]
fn test_single_client_single_epoch_round() {
    // the smallest federation: one client, one epoch, one round
    let dataset = dataset();
    let shard = DatasetSplit::new(dataset.clone(), vec![0, 1, 2, 3]).unwrap();
    let mut client_settings = settings(Mode::Plain);
    client_settings.local_epochs = 1;
    let initial = SoftmaxRegression::new(NB_FEATURES, NB_CLASSES).state();
    let mut client = Client::new(
        client_settings,
        shard,
        SoftmaxRegression::new(NB_FEATURES, NB_CLASSES),
        &initial,
    )
    .unwrap();

    let (update, loss) = client.train().unwrap();
    let delta = plain_delta(update);
    assert_eq!(delta.get("weight").unwrap().shape(), &[2, 2]);
    assert_eq!(delta.get("bias").unwrap().shape(), &[2]);
    assert!(loss.is_finite() && loss >= 0_f64);

    let next = initial.added(&delta).unwrap();
    client.update(ModelUpdate::Plain(next.clone())).unwrap();
    assert_eq!(client.model_state(), next);
}

#[test]
fn test_dp_federation_clips_every_delta() {
    let bound = settings(Mode::Dp).clip_bound;
    let dataset = dataset();
    let global = SoftmaxRegression::new(NB_FEATURES, NB_CLASSES).state();
    for shard in shards(&dataset, 2) {
        let mut client = Client::new(
            settings(Mode::Dp),
            shard,
            SoftmaxRegression::new(NB_FEATURES, NB_CLASSES),
            &global,
        )
        .unwrap();
        let delta = plain_delta(client.train().unwrap().0);
        for (_, tensor) in delta.iter() {
            assert!(tensor.l2_norm() <= bound + 1e-12);
        }
    }
    // clipped updates still aggregate like plain ones
    let losses = run_plain_federation(Mode::Dp, 2, 3);
    assert!(losses.iter().all(|loss| loss.is_finite()));
}

#[test]
fn test_paillier_federation_applies_the_summed_delta() {
    let keys = PaillierKeyPair::generate_with_modulus_bits(256);
    let public = Arc::new(keys.public);
    let secret = Arc::new(keys.secret);

    let dataset = dataset();
    let initial = SoftmaxRegression::new(NB_FEATURES, NB_CLASSES).state();
    let mut clients: Vec<Client<SoftmaxRegression>> = shards(&dataset, 2)
        .into_iter()
        .map(|shard| {
            Client::with_keys(
                settings(Mode::Paillier),
                shard,
                SoftmaxRegression::new(NB_FEATURES, NB_CLASSES),
                &initial,
                public.clone(),
                Some(secret.clone()),
            )
            .unwrap()
        })
        .collect();

    // the aggregator sums the encrypted updates without any key material
    // beyond the public key
    let mut aggregation = EncryptedAggregation::new();
    for client in clients.iter_mut() {
        let (update, loss) = client.train().unwrap();
        assert!(loss.is_finite());
        let encrypted = match update {
            ModelUpdate::Encrypted(encrypted) => encrypted,
            ModelUpdate::Plain(_) => panic!("expected an encrypted update"),
        };
        aggregation.validate_aggregation(&encrypted).unwrap();
        aggregation.aggregate(encrypted, public.as_ref()).unwrap();
    }
    let aggregate = aggregation.sum().unwrap();

    // the broadcast aggregate decrypts to one summed delta, applied
    // additively by every client
    let summed_delta = aggregate.decrypt(&initial, secret.as_ref()).unwrap();
    let expected = initial.added(&summed_delta).unwrap();
    for client in clients.iter_mut() {
        client
            .update(ModelUpdate::Encrypted(aggregate.clone()))
            .unwrap();
        assert!(max_abs_difference(&client.model_state(), &expected) < 1e-6);
    }

    // all replicas converged to the same next global state
    let first = clients[0].model_state();
    assert!(max_abs_difference(&clients[1].model_state(), &first) < 1e-9);
}
