//! Regime bookkeeping: offline training over a fixed dataset, round-based
//! dataset growth, configurator string dispatch inside a trainer, and the
//! checkpoint seam.

use amortflow::amortizer::{AmortizerKind, FlowAmortizer};
use amortflow::checkpoint::{BestKeeper, CheckpointSink};
use amortflow::configure::{configurator_from_name, SimulationBatch};
use amortflow::dataset::SimulatedDataset;
use amortflow::invertible::{InvertibleNetwork, InvertibleNetworkConfig};
use amortflow::optim::Sgd;
use amortflow::trainer::{Trainer, TrainerConfig};
use amortflow::{Error, Result};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::cell::RefCell;
use std::rc::Rc;

fn simulate(n: usize, seed: u64) -> SimulationBatch {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let theta = Array2::from_shape_fn((n, 2), |_| StandardNormal.sample(&mut rng));
    let mut data = theta.clone();
    data.mapv_inplace(|v| {
        let noise: f32 = StandardNormal.sample(&mut rng);
        v + 0.3 * noise
    });
    SimulationBatch::new(theta, data, None).unwrap()
}

fn amortizer(seed: u64) -> FlowAmortizer {
    let net = InvertibleNetwork::new(&InvertibleNetworkConfig {
        n_params: 2,
        condition_dim: Some(2),
        n_coupling_layers: 2,
        hidden_units: 16,
        n_hidden: 1,
        seed,
        ..Default::default()
    })
    .unwrap();
    FlowAmortizer::posterior(net)
}

#[test]
fn offline_training_walks_the_whole_dataset() {
    let dataset = SimulatedDataset::new(simulate(37, 1));
    let mut trainer = Trainer::new(amortizer(5), None, None, TrainerConfig::default())
        .unwrap()
        .with_optimizer(Box::new(Sgd::new(1e-3).unwrap()));

    let history = trainer.train_offline(&dataset, 3, 10).unwrap();
    assert_eq!(history.n_epochs(), 3);
    // 37 sims at batch 10: 4 batches per epoch, the last one partial.
    for ep in history.epochs() {
        assert_eq!(ep.len(), 4);
        assert!(ep.iter().all(|l| l.is_finite()));
    }
}

#[test]
fn offline_training_is_deterministic() {
    let run = || -> Vec<f32> {
        let dataset = SimulatedDataset::new(simulate(24, 8));
        let mut trainer = Trainer::new(
            amortizer(9),
            None,
            None,
            TrainerConfig {
                seed: 21,
                ..Default::default()
            },
        )
        .unwrap();
        let history = trainer.train_offline(&dataset, 2, 6).unwrap();
        history.epochs().iter().flatten().copied().collect()
    };
    let a = run();
    let b = run();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn rounds_reuse_and_extend_previous_simulations() {
    let mut rng = ChaCha8Rng::seed_from_u64(12);
    let sims = Rc::new(RefCell::new(Vec::<usize>::new()));
    let sims_probe = Rc::clone(&sims);
    let model = move |n: usize| -> Result<SimulationBatch> {
        sims_probe.borrow_mut().push(n);
        let theta = Array2::from_shape_fn((n, 2), |_| StandardNormal.sample(&mut rng));
        let data = theta.clone();
        SimulationBatch::new(theta, data, None)
    };

    let mut trainer = Trainer::new(
        amortizer(13),
        Some(Box::new(model)),
        None,
        TrainerConfig {
            check_consistency: false,
            ..Default::default()
        },
    )
    .unwrap();

    let histories = trainer.train_rounds(3, 8, 1, 4).unwrap();
    assert_eq!(histories.len(), 3);
    // Each round asks for exactly sim_per_round fresh simulations.
    assert_eq!(&*sims.borrow(), &[8, 8, 8]);
    // Batches per epoch grow with the dataset: 8, 16, 24 sims at batch 4.
    assert_eq!(histories[0].epochs()[0].len(), 2);
    assert_eq!(histories[1].epochs()[0].len(), 4);
    assert_eq!(histories[2].epochs()[0].len(), 6);
}

#[test]
fn named_configurator_runs_inside_the_trainer() {
    let dataset = {
        let mut batch = simulate(30, 3);
        // Poison a few simulations the way a crashing simulator would.
        batch.sim_data[[4, 0]] = f32::NAN;
        batch.prior_draws[[9, 1]] = f32::INFINITY;
        SimulatedDataset::new(batch)
    };

    let configurator =
        configurator_from_name("drop_nonfinite+standardize", AmortizerKind::Posterior).unwrap();
    let mut trainer =
        Trainer::new(amortizer(19), None, Some(configurator), TrainerConfig::default()).unwrap();

    let history = trainer.train_offline(&dataset, 1, 10).unwrap();
    assert!(history.epochs()[0].iter().all(|l| l.is_finite()));

    // The unsupported names from the original string table fail fast.
    match configurator_from_name("variable_num_obs", AmortizerKind::Posterior) {
        Err(Error::Config(msg)) => assert!(msg.contains("variable_num_obs")),
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[test]
fn best_keeper_restores_the_best_epoch_params() {
    struct Shared(Rc<RefCell<BestKeeper>>);
    impl CheckpointSink for Shared {
        fn on_epoch_end(&mut self, epoch: u64, mean_loss: f32, params: &[f32]) -> Result<()> {
            self.0.borrow_mut().on_epoch_end(epoch, mean_loss, params)
        }
    }

    let keeper = Rc::new(RefCell::new(BestKeeper::new()));
    let dataset = SimulatedDataset::new(simulate(40, 6));
    let mut trainer = Trainer::new(
        amortizer(23),
        None,
        None,
        TrainerConfig {
            learning_rate: 1e-3,
            ..Default::default()
        },
    )
    .unwrap()
    .with_checkpoint_sink(Box::new(Shared(Rc::clone(&keeper))));

    trainer.train_offline(&dataset, 4, 8).unwrap();

    let keeper = keeper.borrow();
    assert!(keeper.best_loss().is_some());
    assert!(keeper.best_epoch() >= 1 && keeper.best_epoch() <= 4);

    let mut am = trainer.into_amortizer();
    assert!(keeper.restore_into(&mut am).unwrap());
    use amortflow::amortizer::Amortizer;
    let restored = am.parameters();
    assert_eq!(restored.len(), keeper.best_params().unwrap().len());
    for (a, b) in restored.iter().zip(keeper.best_params().unwrap().iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
