//! Online amortized posterior training on a conjugate-Gaussian toy model.
//!
//! theta ~ N(0, I), x | theta ~ N(theta, 0.5^2 I). The analytic posterior
//! given one observation x is N(x / 1.25, 0.2 I), so we can eyeball how close
//! the amortized draws land.
//!
//! Run with: `cargo run --example gaussian_posterior`

use amortflow::amortizer::FlowAmortizer;
use amortflow::configure::SimulationBatch;
use amortflow::invertible::{InvertibleNetwork, InvertibleNetworkConfig};
use amortflow::optim::GradientClip;
use amortflow::trainer::{Trainer, TrainerConfig};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

const DIM: usize = 2;
const NOISE_STD: f32 = 0.5;

fn main() -> amortflow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let model = move |n: usize| -> amortflow::Result<SimulationBatch> {
        let theta = Array2::from_shape_fn((n, DIM), |_| StandardNormal.sample(&mut rng));
        let mut data = theta.clone();
        data.mapv_inplace(|v| {
            let noise: f32 = StandardNormal.sample(&mut rng);
            v + NOISE_STD * noise
        });
        SimulationBatch::new(theta, data, None)
    };

    let net = InvertibleNetwork::new(&InvertibleNetworkConfig {
        n_params: DIM,
        condition_dim: Some(DIM),
        n_coupling_layers: 4,
        hidden_units: 48,
        n_hidden: 2,
        seed: 9,
        ..Default::default()
    })?;

    let mut trainer = Trainer::new(
        FlowAmortizer::posterior(net),
        Some(Box::new(model)),
        None,
        TrainerConfig {
            learning_rate: 1e-3,
            clip: GradientClip::GlobalNorm(10.0),
            ..Default::default()
        },
    )?;

    let history = trainer.train_online(10, 100, 64)?;
    tracing::info!(epoch_means = ?history.epoch_means(), "training done");

    let amortizer = trainer.into_amortizer();
    let x_obs = Array1::from_vec(vec![1.0f32, -0.5]);
    let draws = amortizer.sample(Some(&x_obs.view()), 2000, 7)?;
    let mean = draws.mean_axis(Axis(0)).expect("non-empty draws");
    let std = draws.std_axis(Axis(0), 0.0);

    let posterior_scale = 1.0 / (1.0 + NOISE_STD * NOISE_STD);
    println!("observation:          {:?}", x_obs.to_vec());
    println!(
        "analytic posterior:   mean {:?}, std {:.3}",
        x_obs.mapv(|v| v * posterior_scale).to_vec(),
        (NOISE_STD * NOISE_STD * posterior_scale).sqrt()
    );
    println!("amortized posterior:  mean {:?}, std {:?}", mean.to_vec(), std.to_vec());
    Ok(())
}
