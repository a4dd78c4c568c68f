//! Simulates a small federation in one process.
//!
//! Three clients train a softmax classifier on disjoint shards of a toy
//! dataset and protect their weight deltas under the Paillier public key.
//! The aggregator sums the encrypted updates and broadcasts the sum, which
//! every client decrypts and applies. Run with:
//!
//! ```text
//! cargo run --example federation
//! ```

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::fmt::Subscriber;

use pailnet_client::{
    Client, ClientSettings, DatasetSplit, Mode, Sample, SoftmaxRegression, Trainable,
};
use pailnet_core::{
    aggregation::EncryptedAggregation,
    crypto::PaillierKeyPair,
    update::ModelUpdate,
};

const NB_CLIENTS: usize = 3;
const NB_ROUNDS: usize = 3;
const MODULUS_BITS: usize = 1024;

fn dataset() -> Arc<Vec<Sample>> {
    let mut samples = Vec::new();
    for step in 0..16 {
        let jitter = step as f64 * 0.005;
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Subscriber::builder()
        .with_env_filter("pailnet=debug,info")
        .init();

    info!(modulus_bits = MODULUS_BITS, "generating the Paillier key pair");
    let keys = PaillierKeyPair::generate_with_modulus_bits(MODULUS_BITS);
    let public = Arc::new(keys.public);
    let secret = Arc::new(keys.secret);

    let settings = ClientSettings {
        mode: Mode::Paillier,
        local_epochs: 2,
        batch_size: 4,
        learning_rate: 0.5,
        momentum: 0.9,
        clip_bound: 1_f64,
    };

    let dataset = dataset();
    let initial = SoftmaxRegression::new(2, 2).state();
    let mut clients = (0..NB_CLIENTS)
        .map(|client| {
            let indices = (0..dataset.len())
                .filter(|index| index % NB_CLIENTS == client)
                .collect();
            let shard = DatasetSplit::new(dataset.clone(), indices)?;
            Ok(Client::with_keys(
                settings.clone(),
                shard,
                SoftmaxRegression::new(2, 2),
                &initial,
                public.clone(),
                Some(secret.clone()),
            )?)
        })
        .collect::<Result<Vec<_>, Box<dyn std::error::Error>>>()?;

    for round in 0..NB_ROUNDS {
        let mut aggregation = EncryptedAggregation::new();
        for (id, client) in clients.iter_mut().enumerate() {
            let (update, loss) = client.train()?;
            info!(round, client = id, loss, "local training finished");
            match update {
                ModelUpdate::Encrypted(encrypted) => {
                    aggregation.validate_aggregation(&encrypted)?;
                    aggregation.aggregate(encrypted, public.as_ref())?;
                }
                ModelUpdate::Plain(_) => unreachable!("Paillier clients encrypt their updates"),
            }
        }

        let aggregate = aggregation.sum()?;
        info!(
            round,
            nb_ciphertexts = aggregate.nb_ciphertexts(),
            "broadcasting the encrypted aggregate"
        );
        for client in clients.iter_mut() {
            client.update(ModelUpdate::Encrypted(aggregate.clone()))?;
        }
    }

    info!("federation finished");
    Ok(())
}
