//! Simulation-based training regimes.
//!
//! A [`Trainer`] connects a generative model (or already-simulated data), a
//! configurator, and an amortizer, and optimizes the amortizer with one of
//! three regimes:
//!
//! - **online** — simulate every batch on the fly (fast simulators),
//! - **offline** — iterate a fixed pre-simulated dataset (slow simulators),
//! - **rounds** — periodically grow the dataset, then train offline on it.
//!
//! Each backprop step runs
//! `simulate -> configure -> loss+gradients -> clip -> optimizer step`.
//! Progress is reported through `tracing`; per-batch losses are returned as
//! [`LossHistory`] values so callers can do their own bookkeeping.

use crate::amortizer::Amortizer;
use crate::checkpoint::CheckpointSink;
use crate::configure::{default_configurator, Configurator, SimulationBatch};
use crate::dataset::SimulatedDataset;
use crate::optim::{Adam, GradientClip, Optimizer};
use crate::{Error, Result};

/// A stochastic simulator of joint parameter/data draws.
pub trait GenerativeModel {
    fn simulate(&mut self, n_sim: usize) -> Result<SimulationBatch>;
}

impl<F> GenerativeModel for F
where
    F: FnMut(usize) -> Result<SimulationBatch>,
{
    fn simulate(&mut self, n_sim: usize) -> Result<SimulationBatch> {
        self(n_sim)
    }
}

/// Trainer construction knobs.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Gradient clipping applied before each optimizer step.
    pub clip: GradientClip,
    /// Run one `simulate -> configure -> loss` pass at construction and fail
    /// with context if any stage breaks. Skipped without a generative model.
    pub check_consistency: bool,
    /// Base seed for per-epoch dataset shuffles.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            clip: GradientClip::None,
            check_consistency: true,
            seed: 42,
        }
    }
}

/// Per-batch losses grouped by epoch.
#[derive(Debug, Clone, Default)]
pub struct LossHistory {
    epochs: Vec<Vec<f32>>,
}

impl LossHistory {
    pub fn epochs(&self) -> &[Vec<f32>] {
        &self.epochs
    }

    pub fn n_epochs(&self) -> usize {
        self.epochs.len()
    }

    /// Mean loss per epoch.
    pub fn epoch_means(&self) -> Vec<f32> {
        self.epochs
            .iter()
            .map(|l| {
                if l.is_empty() {
                    f32::NAN
                } else {
                    l.iter().sum::<f32>() / l.len() as f32
                }
            })
            .collect()
    }

    /// Mean loss of the final epoch, if any.
    pub fn final_epoch_mean(&self) -> Option<f32> {
        self.epoch_means().last().copied()
    }
}

/// Connects amortizer, generative model, and configurator, and owns the
/// optimizer state.
pub struct Trainer<A: Amortizer> {
    amortizer: A,
    generative_model: Option<Box<dyn GenerativeModel>>,
    configurator: Box<dyn Configurator>,
    optimizer: Box<dyn Optimizer>,
    clip: GradientClip,
    checkpoint: Option<Box<dyn CheckpointSink>>,
    seed: u64,
    /// Epochs completed over the trainer's lifetime (all regimes); also
    /// drives per-epoch shuffle seeds so rounds reshuffle differently.
    epoch_counter: u64,
}

impl<A: Amortizer> std::fmt::Debug for Trainer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("seed", &self.seed)
            .field("epoch_counter", &self.epoch_counter)
            .finish_non_exhaustive()
    }
}

impl<A: Amortizer> Trainer<A> {
    /// Build a trainer. With `configurator = None` the default for the
    /// amortizer kind is used. Unless disabled, a consistency check runs the
    /// full pipeline once on two simulations and reports failures as
    /// configuration errors.
    pub fn new(
        mut amortizer: A,
        mut generative_model: Option<Box<dyn GenerativeModel>>,
        configurator: Option<Box<dyn Configurator>>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.clip.validate()?;
        let optimizer: Box<dyn Optimizer> = Box::new(Adam::new(config.learning_rate)?);
        let configurator =
            configurator.unwrap_or_else(|| default_configurator(amortizer.kind()));

        if generative_model.is_none() {
            tracing::info!("no generative model provided; only offline training is available");
        }

        if config.check_consistency {
            if let Some(gm) = generative_model.as_mut() {
                tracing::info!("performing a consistency check with the provided components");
                let raw = gm.simulate(2).map_err(|e| {
                    Error::Config(format!("consistency check failed during simulation: {e}"))
                })?;
                let input = configurator.configure(&raw).map_err(|e| {
                    Error::Config(format!("consistency check failed during configuration: {e}"))
                })?;
                let loss = amortizer.compute_loss(&input).map_err(|e| {
                    Error::Config(format!(
                        "consistency check failed during loss computation: {e}"
                    ))
                })?;
                if !loss.is_finite() {
                    return Err(Error::Config(format!(
                        "consistency check produced a non-finite loss ({loss})"
                    )));
                }
                tracing::info!(loss, "consistency check passed");
            }
        }

        Ok(Self {
            amortizer,
            generative_model,
            configurator,
            optimizer,
            clip: config.clip,
            checkpoint: None,
            seed: config.seed,
            epoch_counter: 0,
        })
    }

    /// Replace the default Adam optimizer.
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Attach a checkpoint sink notified after every epoch.
    pub fn with_checkpoint_sink(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    pub fn amortizer(&self) -> &A {
        &self.amortizer
    }

    pub fn amortizer_mut(&mut self) -> &mut A {
        &mut self.amortizer
    }

    /// Hand back the trained amortizer.
    pub fn into_amortizer(self) -> A {
        self.amortizer
    }

    /// Online training: simulate a fresh batch for every gradient step.
    pub fn train_online(
        &mut self,
        epochs: usize,
        iterations_per_epoch: usize,
        batch_size: usize,
    ) -> Result<LossHistory> {
        if epochs == 0 || iterations_per_epoch == 0 || batch_size == 0 {
            return Err(Error::Domain(
                "epochs, iterations_per_epoch, and batch_size must be >= 1",
            ));
        }

        let mut history = LossHistory::default();
        for ep in 1..=epochs {
            let mut losses = Vec::with_capacity(iterations_per_epoch);
            for _ in 0..iterations_per_epoch {
                let raw = self.forward_inference(batch_size)?;
                let input = self.configurator.configure(&raw)?;
                losses.push(self.backprop_step(&input)?);
            }
            self.finish_epoch(ep, epochs, &losses)?;
            history.epochs.push(losses);
        }
        Ok(history)
    }

    /// Offline training: iterate a fixed dataset in shuffled mini-batches.
    pub fn train_offline(
        &mut self,
        dataset: &SimulatedDataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<LossHistory> {
        if epochs == 0 || batch_size == 0 {
            return Err(Error::Domain("epochs and batch_size must be >= 1"));
        }

        let mut history = LossHistory::default();
        for ep in 1..=epochs {
            let shuffle_seed = self.seed.wrapping_add(self.epoch_counter);
            let batches = dataset.epoch_batches(batch_size, shuffle_seed)?;
            let mut losses = Vec::with_capacity(batches.len());
            for raw in &batches {
                let input = self.configurator.configure(raw)?;
                losses.push(self.backprop_step(&input)?);
            }
            self.finish_epoch(ep, epochs, &losses)?;
            history.epochs.push(losses);
        }
        Ok(history)
    }

    /// Round-based training: simulate `sim_per_round` fresh data sets each
    /// round, append them to a growing dataset, and train offline on it.
    /// Returns one history per round.
    pub fn train_rounds(
        &mut self,
        rounds: usize,
        sim_per_round: usize,
        epochs: usize,
        batch_size: usize,
    ) -> Result<Vec<LossHistory>> {
        if rounds == 0 || sim_per_round == 0 || epochs == 0 || batch_size == 0 {
            return Err(Error::Domain(
                "rounds, sim_per_round, epochs, and batch_size must be >= 1",
            ));
        }

        tracing::info!(sim_per_round, "simulating initial data sets");
        let first = self.forward_inference(sim_per_round)?;
        let mut dataset = SimulatedDataset::new(first);

        let mut histories = Vec::with_capacity(rounds);
        for round in 1..=rounds {
            if round > 1 {
                tracing::info!(
                    round,
                    new_sims = sim_per_round,
                    total = dataset.n_sim() + sim_per_round,
                    "simulating additional data sets"
                );
                let extra = self.forward_inference(sim_per_round)?;
                dataset.append(&extra)?;
            }
            let history = self.train_offline(&dataset, epochs, batch_size)?;
            histories.push(history);
        }
        Ok(histories)
    }

    /// One simulation step. Dedicated error when no generative model exists.
    fn forward_inference(&mut self, n_sim: usize) -> Result<SimulationBatch> {
        match self.generative_model.as_mut() {
            Some(gm) => gm.simulate(n_sim),
            None => Err(Error::Simulation(
                "no generative model specified; only offline training is available",
            )),
        }
    }

    /// Loss, clipped gradients, one optimizer step.
    fn backprop_step(&mut self, input: &crate::configure::TrainInput) -> Result<f32> {
        let (loss, mut grads) = self.amortizer.loss_and_gradients(input)?;
        if !loss.is_finite() {
            return Err(Error::Domain("training loss is not finite"));
        }
        self.clip.apply(&mut grads);
        let mut params = self.amortizer.parameters();
        self.optimizer.step(&mut params, &grads)?;
        self.amortizer.set_parameters(&params)?;
        Ok(loss)
    }

    fn finish_epoch(&mut self, epoch: usize, epochs: usize, losses: &[f32]) -> Result<()> {
        self.epoch_counter += 1;
        let mean = if losses.is_empty() {
            f32::NAN
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        };
        tracing::info!(epoch, epochs, mean_loss = mean, "finished epoch");
        if let Some(sink) = self.checkpoint.as_mut() {
            let params = self.amortizer.parameters();
            sink.on_epoch_end(self.epoch_counter, mean, &params)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amortizer::FlowAmortizer;
    use crate::invertible::{InvertibleNetwork, InvertibleNetworkConfig};
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};
    use std::cell::Cell;
    use std::rc::Rc;

    fn toy_amortizer() -> FlowAmortizer {
        let net = InvertibleNetwork::new(&InvertibleNetworkConfig {
            n_params: 2,
            condition_dim: Some(2),
            n_coupling_layers: 2,
            hidden_units: 8,
            n_hidden: 1,
            seed: 17,
            ..Default::default()
        })
        .unwrap();
        FlowAmortizer::posterior(net)
    }

    fn toy_model(seed: u64) -> Box<dyn GenerativeModel> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Box::new(move |n: usize| -> crate::Result<SimulationBatch> {
            let prior = Array2::from_shape_fn((n, 2), |_| StandardNormal.sample(&mut rng));
            let mut data = prior.clone();
            data.mapv_inplace(|v| v + 0.1);
            SimulationBatch::new(prior, data, None)
        })
    }

    #[test]
    fn offline_only_trainer_cannot_simulate() {
        let mut trainer =
            Trainer::new(toy_amortizer(), None, None, TrainerConfig::default()).unwrap();
        let err = trainer.train_online(1, 1, 4).unwrap_err();
        match err {
            Error::Simulation(_) => {}
            other => panic!("expected Simulation error, got {other:?}"),
        }
        let err = trainer.train_rounds(1, 4, 1, 2).unwrap_err();
        assert!(matches!(err, Error::Simulation(_)));
    }

    #[test]
    fn zero_sized_regimes_are_rejected() {
        let mut trainer =
            Trainer::new(toy_amortizer(), Some(toy_model(1)), None, TrainerConfig::default())
                .unwrap();
        assert!(trainer.train_online(0, 1, 1).is_err());
        assert!(trainer.train_online(1, 0, 1).is_err());
        assert!(trainer.train_online(1, 1, 0).is_err());
        assert!(trainer.train_rounds(0, 1, 1, 1).is_err());
    }

    #[test]
    fn consistency_check_wraps_broken_components() {
        let broken: Box<dyn GenerativeModel> =
            Box::new(|_n: usize| -> crate::Result<SimulationBatch> {
                Err(Error::Simulation("simulator exploded"))
            });
        let err = Trainer::new(
            toy_amortizer(),
            Some(broken),
            None,
            TrainerConfig::default(),
        )
        .unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("simulator exploded")),
            other => panic!("expected Config error, got {other:?}"),
        }

        // Skipping the check defers the failure to training time.
        let broken: Box<dyn GenerativeModel> =
            Box::new(|_n: usize| -> crate::Result<SimulationBatch> {
                Err(Error::Simulation("simulator exploded"))
            });
        let mut trainer = Trainer::new(
            toy_amortizer(),
            Some(broken),
            None,
            TrainerConfig {
                check_consistency: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(trainer.train_online(1, 1, 4).is_err());
    }

    #[test]
    fn online_history_has_the_requested_shape() {
        let mut trainer = Trainer::new(
            toy_amortizer(),
            Some(toy_model(3)),
            None,
            TrainerConfig {
                learning_rate: 1e-3,
                ..Default::default()
            },
        )
        .unwrap();
        let history = trainer.train_online(2, 5, 8).unwrap();
        assert_eq!(history.n_epochs(), 2);
        for ep in history.epochs() {
            assert_eq!(ep.len(), 5);
            assert!(ep.iter().all(|l| l.is_finite()));
        }
        assert!(history.final_epoch_mean().unwrap().is_finite());
    }

    #[test]
    fn rounds_grow_the_dataset_and_report_per_round() {
        let calls = Rc::new(Cell::new(0usize));
        let calls_probe = Rc::clone(&calls);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let model: Box<dyn GenerativeModel> = Box::new(move |n: usize| {
            calls_probe.set(calls_probe.get() + 1);
            let prior = Array2::from_shape_fn((n, 2), |_| StandardNormal.sample(&mut rng));
            let data = prior.clone();
            SimulationBatch::new(prior, data, None)
        });

        let mut trainer = Trainer::new(
            toy_amortizer(),
            Some(model),
            None,
            TrainerConfig {
                check_consistency: false,
                learning_rate: 1e-3,
                ..Default::default()
            },
        )
        .unwrap();

        let histories = trainer.train_rounds(3, 6, 2, 4).unwrap();
        assert_eq!(histories.len(), 3);
        // One simulation call per round.
        assert_eq!(calls.get(), 3);
        // Round r trains on 6*r sims: ceil(6r/4) batches per epoch.
        for (r, h) in histories.iter().enumerate() {
            assert_eq!(h.n_epochs(), 2);
            let expected_batches = (6 * (r + 1)).div_ceil(4);
            assert_eq!(h.epochs()[0].len(), expected_batches);
        }
    }

    #[test]
    fn checkpoint_sink_sees_every_epoch() {
        struct Recorder(Rc<Cell<u64>>);
        impl CheckpointSink for Recorder {
            fn on_epoch_end(&mut self, epoch: u64, _loss: f32, _params: &[f32]) -> crate::Result<()> {
                self.0.set(epoch);
                Ok(())
            }
        }

        let seen = Rc::new(Cell::new(0u64));
        let mut trainer = Trainer::new(
            toy_amortizer(),
            Some(toy_model(11)),
            None,
            TrainerConfig::default(),
        )
        .unwrap()
        .with_checkpoint_sink(Box::new(Recorder(Rc::clone(&seen))));

        trainer.train_online(3, 2, 4).unwrap();
        assert_eq!(seen.get(), 3);
    }
}
