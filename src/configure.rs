//! Simulation batches and configurators.
//!
//! A configurator shapes the raw output of a generative model into the
//! tensors an amortizer consumes, giving the modular pipeline
//! `generative model -> configurator -> amortizer`. Users can pass their own
//! closure, pick a named pipeline by string, or let the trainer fall back to
//! the default for the amortizer kind.

use crate::amortizer::AmortizerKind;
use crate::{Error, Result};
use ndarray::{s, Array2, Axis};

const STD_EPS: f32 = 1e-8;

/// Raw output of one generative-model call: `n_sim` rows of parameter draws
/// and simulated observations, plus optional per-sample context.
#[derive(Debug, Clone)]
pub struct SimulationBatch {
    pub prior_draws: Array2<f32>,
    pub sim_data: Array2<f32>,
    pub context: Option<Array2<f32>>,
}

impl SimulationBatch {
    pub fn new(
        prior_draws: Array2<f32>,
        sim_data: Array2<f32>,
        context: Option<Array2<f32>>,
    ) -> Result<Self> {
        let n = prior_draws.nrows();
        if n == 0 {
            return Err(Error::Domain("batch must contain at least one simulation"));
        }
        if sim_data.nrows() != n {
            return Err(Error::Shape("sim_data rows must match prior_draws rows"));
        }
        if let Some(c) = &context {
            if c.nrows() != n {
                return Err(Error::Shape("context rows must match prior_draws rows"));
            }
        }
        Ok(Self {
            prior_draws,
            sim_data,
            context,
        })
    }

    pub fn n_sim(&self) -> usize {
        self.prior_draws.nrows()
    }

    /// Concatenate `other` below `self` (round-based dataset growth).
    pub fn append(&mut self, other: &SimulationBatch) -> Result<()> {
        if other.prior_draws.ncols() != self.prior_draws.ncols()
            || other.sim_data.ncols() != self.sim_data.ncols()
        {
            return Err(Error::Shape("appended batch widths must match"));
        }
        let ctx = match (&self.context, &other.context) {
            (None, None) => None,
            (Some(a), Some(b)) => {
                if a.ncols() != b.ncols() {
                    return Err(Error::Shape("appended context widths must match"));
                }
                Some(vstack(a, b))
            }
            _ => {
                return Err(Error::Shape(
                    "appended batch must match context presence of the existing data",
                ))
            }
        };
        self.prior_draws = vstack(&self.prior_draws, &other.prior_draws);
        self.sim_data = vstack(&self.sim_data, &other.sim_data);
        self.context = ctx;
        Ok(())
    }

    /// Gather the given rows into a new batch (order preserved, duplicates
    /// allowed). Out-of-range indices are a caller bug and panic.
    pub fn select_rows(&self, idx: &[usize]) -> SimulationBatch {
        SimulationBatch {
            prior_draws: gather_rows(&self.prior_draws, idx),
            sim_data: gather_rows(&self.sim_data, idx),
            context: self.context.as_ref().map(|c| gather_rows(c, idx)),
        }
    }
}

fn vstack(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((a.nrows() + b.nrows(), a.ncols()));
    out.slice_mut(s![..a.nrows(), ..]).assign(a);
    out.slice_mut(s![a.nrows().., ..]).assign(b);
    out
}

fn gather_rows(a: &Array2<f32>, idx: &[usize]) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((idx.len(), a.ncols()));
    for (r, &i) in idx.iter().enumerate() {
        out.row_mut(r).assign(&a.row(i));
    }
    out
}

fn hstack(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((a.nrows(), a.ncols() + b.ncols()));
    out.slice_mut(s![.., ..a.ncols()]).assign(a);
    out.slice_mut(s![.., a.ncols()..]).assign(b);
    out
}

/// Network-ready tensors: the vectors whose density is modeled, plus the
/// conditioning input.
#[derive(Debug, Clone)]
pub struct TrainInput {
    pub targets: Array2<f32>,
    pub condition: Option<Array2<f32>>,
}

/// Shapes a [`SimulationBatch`] into a [`TrainInput`].
pub trait Configurator {
    fn configure(&self, raw: &SimulationBatch) -> Result<TrainInput>;
}

impl<F> Configurator for F
where
    F: Fn(&SimulationBatch) -> Result<TrainInput>,
{
    fn configure(&self, raw: &SimulationBatch) -> Result<TrainInput> {
        self(raw)
    }
}

impl std::fmt::Debug for dyn Configurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Configurator")
    }
}

/// Posterior default: learn `p(parameters | data ⊕ context)`.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPosteriorConfigurator;

impl Configurator for DefaultPosteriorConfigurator {
    fn configure(&self, raw: &SimulationBatch) -> Result<TrainInput> {
        let condition = match &raw.context {
            Some(c) => hstack(&raw.sim_data, c),
            None => raw.sim_data.clone(),
        };
        Ok(TrainInput {
            targets: raw.prior_draws.clone(),
            condition: Some(condition),
        })
    }
}

/// Likelihood default: learn `p(data | parameters ⊕ context)`.
#[derive(Debug, Clone, Copy)]
pub struct DefaultLikelihoodConfigurator;

impl Configurator for DefaultLikelihoodConfigurator {
    fn configure(&self, raw: &SimulationBatch) -> Result<TrainInput> {
        let condition = match &raw.context {
            Some(c) => hstack(&raw.prior_draws, c),
            None => raw.prior_draws.clone(),
        };
        Ok(TrainInput {
            targets: raw.sim_data.clone(),
            condition: Some(condition),
        })
    }
}

/// The default configurator for an amortizer kind.
pub fn default_configurator(kind: AmortizerKind) -> Box<dyn Configurator> {
    match kind {
        AmortizerKind::Posterior => Box::new(DefaultPosteriorConfigurator),
        AmortizerKind::Likelihood => Box::new(DefaultLikelihoodConfigurator),
    }
}

/// Pre-combine transform stages selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransformStage {
    /// Per-batch, per-dimension z-scoring of every block.
    Standardize,
    /// Remove simulations containing NaN or ±inf anywhere.
    DropNonfinite,
}

impl TransformStage {
    fn apply(&self, batch: &SimulationBatch) -> Result<SimulationBatch> {
        match self {
            TransformStage::Standardize => Ok(SimulationBatch {
                prior_draws: standardize(&batch.prior_draws),
                sim_data: standardize(&batch.sim_data),
                context: batch.context.as_ref().map(standardize),
            }),
            TransformStage::DropNonfinite => {
                let keep: Vec<usize> = (0..batch.n_sim())
                    .filter(|&i| {
                        let row_ok = |a: &Array2<f32>| a.row(i).iter().all(|v| v.is_finite());
                        row_ok(&batch.prior_draws)
                            && row_ok(&batch.sim_data)
                            && batch.context.as_ref().map_or(true, row_ok)
                    })
                    .collect();
                if keep.is_empty() {
                    return Err(Error::Domain("no finite simulations left after filtering"));
                }
                Ok(batch.select_rows(&keep))
            }
        }
    }
}

fn standardize(a: &Array2<f32>) -> Array2<f32> {
    let mut out = a.clone();
    if let Some(mean) = a.mean_axis(Axis(0)) {
        let std = a.std_axis(Axis(0), 0.0);
        for k in 0..a.ncols() {
            let m = mean[k];
            let s = std[k] + STD_EPS;
            for v in out.column_mut(k).iter_mut() {
                *v = (*v - m) / s;
            }
        }
    }
    out
}

/// A named transform pipeline in front of the kind's default combiner.
#[derive(Debug, Clone)]
pub struct NamedConfigurator {
    stages: Vec<TransformStage>,
    kind: AmortizerKind,
}

impl Configurator for NamedConfigurator {
    fn configure(&self, raw: &SimulationBatch) -> Result<TrainInput> {
        let mut batch = raw.clone();
        for stage in &self.stages {
            batch = stage.apply(&batch)?;
        }
        default_configurator(self.kind).configure(&batch)
    }
}

/// Resolve a configurator from its name.
///
/// Accepted names: `default`, `standardize`, `drop_nonfinite`, or a
/// `+`-separated union applied left to right, e.g.
/// `"drop_nonfinite+standardize"`. Anything else fails immediately.
pub fn configurator_from_name(name: &str, kind: AmortizerKind) -> Result<Box<dyn Configurator>> {
    let mut stages = Vec::new();
    for part in name.split('+') {
        match part.trim() {
            "default" => {}
            "standardize" => stages.push(TransformStage::Standardize),
            "drop_nonfinite" => stages.push(TransformStage::DropNonfinite),
            other => {
                return Err(Error::Config(format!(
                    "unsupported configurator '{other}'; supported: default, standardize, \
                     drop_nonfinite (joined with '+')"
                )))
            }
        }
    }
    Ok(Box::new(NamedConfigurator { stages, kind }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy_batch(n: usize) -> SimulationBatch {
        let prior = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f32);
        let data = Array2::from_shape_fn((n, 3), |(i, j)| (i * 3 + j) as f32 * 0.5);
        SimulationBatch::new(prior, data, None).unwrap()
    }

    #[test]
    fn batch_construction_validates_rows() {
        let prior = Array2::<f32>::zeros((4, 2));
        let data = Array2::<f32>::zeros((3, 3));
        assert!(SimulationBatch::new(prior.clone(), data, None).is_err());
        let data = Array2::<f32>::zeros((4, 3));
        let ctx = Array2::<f32>::zeros((2, 1));
        assert!(SimulationBatch::new(prior.clone(), data.clone(), Some(ctx)).is_err());
        assert!(SimulationBatch::new(prior, data, None).is_ok());
        assert!(SimulationBatch::new(
            Array2::<f32>::zeros((0, 2)),
            Array2::<f32>::zeros((0, 3)),
            None
        )
        .is_err());
    }

    #[test]
    fn append_grows_and_checks() {
        let mut a = toy_batch(3);
        let b = toy_batch(2);
        a.append(&b).unwrap();
        assert_eq!(a.n_sim(), 5);
        assert_eq!(a.prior_draws[[3, 0]], 0.0);

        let wrong = SimulationBatch::new(
            Array2::<f32>::zeros((2, 5)),
            Array2::<f32>::zeros((2, 3)),
            None,
        )
        .unwrap();
        assert!(a.append(&wrong).is_err());

        let with_ctx = SimulationBatch::new(
            Array2::<f32>::zeros((2, 2)),
            Array2::<f32>::zeros((2, 3)),
            Some(Array2::<f32>::zeros((2, 1))),
        )
        .unwrap();
        assert!(a.append(&with_ctx).is_err());
    }

    #[test]
    fn posterior_and_likelihood_defaults_swap_roles() {
        let batch = toy_batch(4);
        let p = DefaultPosteriorConfigurator.configure(&batch).unwrap();
        assert_eq!(p.targets.dim(), (4, 2));
        assert_eq!(p.condition.as_ref().unwrap().dim(), (4, 3));

        let l = DefaultLikelihoodConfigurator.configure(&batch).unwrap();
        assert_eq!(l.targets.dim(), (4, 3));
        assert_eq!(l.condition.as_ref().unwrap().dim(), (4, 2));
    }

    #[test]
    fn context_is_appended_to_the_condition() {
        let mut batch = toy_batch(4);
        batch.context = Some(Array2::from_elem((4, 2), 9.0));
        let p = DefaultPosteriorConfigurator.configure(&batch).unwrap();
        let cond = p.condition.unwrap();
        assert_eq!(cond.dim(), (4, 5));
        assert_eq!(cond[[0, 3]], 9.0);
    }

    #[test]
    fn unknown_configurator_name_fails_fast() {
        let err = configurator_from_name("one_hot", AmortizerKind::Posterior).unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("one_hot")),
            other => panic!("expected Config error, got {other:?}"),
        }
        assert!(configurator_from_name("standardize+bogus", AmortizerKind::Posterior).is_err());
    }

    #[test]
    fn standardize_centers_and_scales() {
        let cfg = configurator_from_name("standardize", AmortizerKind::Posterior).unwrap();
        let input = cfg.configure(&toy_batch(8)).unwrap();
        let mean = input.targets.mean_axis(Axis(0)).unwrap();
        let std = input.targets.std_axis(Axis(0), 0.0);
        for k in 0..2 {
            assert_abs_diff_eq!(mean[k], 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(std[k], 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn drop_nonfinite_filters_rows() {
        let mut batch = toy_batch(5);
        batch.sim_data[[1, 2]] = f32::NAN;
        batch.prior_draws[[3, 0]] = f32::INFINITY;
        let cfg = configurator_from_name("drop_nonfinite", AmortizerKind::Posterior).unwrap();
        let input = cfg.configure(&batch).unwrap();
        assert_eq!(input.targets.nrows(), 3);

        let mut all_bad = toy_batch(2);
        all_bad.sim_data[[0, 0]] = f32::NAN;
        all_bad.sim_data[[1, 0]] = f32::NAN;
        assert!(cfg.configure(&all_bad).is_err());
    }

    #[test]
    fn closure_configurators_work() {
        let cfg = |raw: &SimulationBatch| -> Result<TrainInput> {
            Ok(TrainInput {
                targets: raw.prior_draws.clone(),
                condition: None,
            })
        };
        let input = cfg.configure(&toy_batch(3)).unwrap();
        assert!(input.condition.is_none());
    }
}
