//! Round-based training with a best-epoch checkpoint keeper.
//!
//! Run with: `cargo run --example rounds_growth`

use amortflow::amortizer::FlowAmortizer;
use amortflow::checkpoint::{BestKeeper, CheckpointSink};
use amortflow::configure::SimulationBatch;
use amortflow::invertible::{InvertibleNetwork, InvertibleNetworkConfig};
use amortflow::trainer::{Trainer, TrainerConfig};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::cell::RefCell;
use std::rc::Rc;

struct SharedKeeper(Rc<RefCell<BestKeeper>>);

impl CheckpointSink for SharedKeeper {
    fn on_epoch_end(&mut self, epoch: u64, mean_loss: f32, params: &[f32]) -> amortflow::Result<()> {
        self.0.borrow_mut().on_epoch_end(epoch, mean_loss, params)
    }
}

fn main() -> amortflow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let mut rng = ChaCha8Rng::seed_from_u64(31);
    let model = move |n: usize| -> amortflow::Result<SimulationBatch> {
        let theta = Array2::from_shape_fn((n, 3), |_| StandardNormal.sample(&mut rng));
        let mut data = theta.clone();
        data.mapv_inplace(|v| {
            let noise: f32 = StandardNormal.sample(&mut rng);
            0.8 * v + 0.4 * noise
        });
        SimulationBatch::new(theta, data, None)
    };

    let net = InvertibleNetwork::new(&InvertibleNetworkConfig {
        n_params: 3,
        condition_dim: Some(3),
        n_coupling_layers: 4,
        hidden_units: 32,
        n_hidden: 2,
        seed: 5,
        ..Default::default()
    })?;

    let keeper = Rc::new(RefCell::new(BestKeeper::new()));
    let mut trainer = Trainer::new(
        FlowAmortizer::posterior(net),
        Some(Box::new(model)),
        None,
        TrainerConfig {
            learning_rate: 1e-3,
            ..Default::default()
        },
    )?
    .with_checkpoint_sink(Box::new(SharedKeeper(Rc::clone(&keeper))));

    let histories = trainer.train_rounds(4, 512, 3, 64)?;
    for (r, h) in histories.iter().enumerate() {
        println!("round {}: epoch means {:?}", r + 1, h.epoch_means());
    }

    let keeper = keeper.borrow();
    println!(
        "best epoch {} with mean loss {:?}",
        keeper.best_epoch(),
        keeper.best_loss()
    );

    let mut amortizer = trainer.into_amortizer();
    if keeper.restore_into(&mut amortizer)? {
        println!("restored best-epoch parameters into the amortizer");
    }
    Ok(())
}
