use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::error::ModelError;

/// A trainable predictor driven by [`crate::ml::ModelManager`].
pub trait Model {
    /// Identifier used to pick a loader when a saved manager is read back.
    fn kind(&self) -> &'static str;

    fn fit(
        &mut self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        params: &FitParams<'_>,
    ) -> Result<History, ModelError>;

    /// Returns `[loss, metric]`.
    fn evaluate(&self, x: &DMatrix<f64>, y: &DVector<f64>, batch_size: usize) -> Result<Vec<f64>, ModelError>;

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError>;

    /// The model's own serialized form.
    fn to_native(&self) -> Result<Vec<u8>, ModelError>;
}

#[derive(Debug, Clone, Copy)]
pub struct FitParams<'a> {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation: Option<(&'a DMatrix<f64>, &'a DVector<f64>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub metric: f64,
    pub val_loss: Option<f64>,
    pub val_metric: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub model_kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub epochs: Vec<EpochRecord>,
}

impl History {
    fn start(model_kind: &str) -> Self {
        let now = Utc::now();
        Self {
            model_kind: model_kind.to_string(),
            started_at: now,
            finished_at: now,
            epochs: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

fn check_shapes(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
    if x.nrows() != y.len() {
        return Err(ModelError::DimensionMismatch(format!(
            "{} feature rows but {} labels",
            x.nrows(),
            y.len()
        )));
    }
    if x.nrows() == 0 {
        return Err(ModelError::EmptyData);
    }
    Ok(())
}

fn check_batch_size(batch_size: usize) -> Result<(), ModelError> {
    if batch_size == 0 {
        return Err(ModelError::InvalidParameter("batch size must be at least 1".to_string()));
    }
    Ok(())
}

fn r_squared(y: &DVector<f64>, sum_squared_error: f64) -> f64 {
    let y_mean = y.iter().mean();
    let ss_tot: f64 = y.iter().map(|yi| (yi - y_mean).powi(2)).sum();
    if ss_tot.abs() < f64::EPSILON {
        0.0
    } else {
        1.0 - sum_squared_error / ss_tot
    }
}

/// Accumulates squared error batch by batch, then reports `[mse, r²]`.
fn regression_scores(
    predict: impl Fn(&DMatrix<f64>) -> DVector<f64>,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    batch_size: usize,
) -> Vec<f64> {
    let mut sse = 0.0;
    let mut start = 0;
    while start < x.nrows() {
        let len = batch_size.min(x.nrows() - start);
        let predicted = predict(&x.rows(start, len).into_owned());
        sse += predicted
            .iter()
            .zip(y.rows(start, len).iter())
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f64>();
        start += len;
    }
    vec![sse / x.nrows() as f64, r_squared(y, sse)]
}

/// Ordinary least squares solved with the normal equation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeastSquaresModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LeastSquaresModel {
    pub const KIND: &'static str = "least_squares";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_native(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn check_features(&self, x: &DMatrix<f64>) -> Result<(), ModelError> {
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::DimensionMismatch(format!(
                "model expects {} features, got {}",
                self.coefficients.len(),
                x.ncols()
            )));
        }
        Ok(())
    }

    fn predict_unchecked(&self, x: &DMatrix<f64>) -> DVector<f64> {
        let coefficients = DVector::from_column_slice(&self.coefficients);
        x * coefficients + DVector::from_element(x.nrows(), self.intercept)
    }
}

impl Model for LeastSquaresModel {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    /// Closed-form, so one solve regardless of `epochs`; the history holds a single record.
    fn fit(
        &mut self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        params: &FitParams<'_>,
    ) -> Result<History, ModelError> {
        check_shapes(x, y)?;
        check_batch_size(params.batch_size)?;
        let mut history = History::start(Self::KIND);

        // Add intercept column
        let mut x_with_intercept = DMatrix::zeros(x.nrows(), x.ncols() + 1);
        x_with_intercept.set_column(0, &DVector::from_element(x.nrows(), 1.0));
        x_with_intercept.columns_mut(1, x.ncols()).copy_from(x);

        // Normal equation: (X^T * X)^-1 * X^T * y
        let xt = x_with_intercept.transpose();
        let xtx = &xt * &x_with_intercept;
        let xty = &xt * y;

        let xtx_inv = xtx.try_inverse().ok_or(ModelError::NotInvertible)?;
        let solution = xtx_inv * xty;
        self.intercept = solution[0];
        self.coefficients = solution.rows(1, x.ncols()).iter().copied().collect();

        let scores = self.evaluate(x, y, params.batch_size)?;
        self.r_squared = scores[1];

        let validation = params
            .validation
            .map(|(vx, vy)| self.evaluate(vx, vy, params.batch_size))
            .transpose()?;

        history.epochs.push(EpochRecord {
            epoch: 1,
            loss: scores[0],
            metric: scores[1],
            val_loss: validation.as_ref().map(|v| v[0]),
            val_metric: validation.as_ref().map(|v| v[1]),
        });
        info!("Least squares fit on {} rows, r² = {:.4}", x.nrows(), self.r_squared);
        Ok(history.finish())
    }

    fn evaluate(&self, x: &DMatrix<f64>, y: &DVector<f64>, batch_size: usize) -> Result<Vec<f64>, ModelError> {
        check_shapes(x, y)?;
        check_batch_size(batch_size)?;
        self.check_features(x)?;
        Ok(regression_scores(|batch| self.predict_unchecked(batch), x, y, batch_size))
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        self.check_features(x)?;
        Ok(self.predict_unchecked(x))
    }

    fn to_native(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Mean squared error; metric is r².
    Linear,
    /// Binary cross-entropy on a sigmoid output; metric is accuracy.
    Logistic,
}

/// Single-layer model trained with shuffled mini-batch gradient descent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdModel {
    pub objective: Objective,
    pub learning_rate: f64,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Seeds weight initialisation and per-epoch shuffling.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SgdModel {
    pub const KIND: &'static str = "sgd";

    pub fn new(objective: Objective, learning_rate: f64) -> Self {
        Self {
            objective,
            learning_rate,
            weights: Vec::new(),
            bias: 0.0,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn from_native(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn check_features(&self, x: &DMatrix<f64>) -> Result<(), ModelError> {
        if x.ncols() != self.weights.len() {
            return Err(ModelError::DimensionMismatch(format!(
                "model expects {} features, got {}",
                self.weights.len(),
                x.ncols()
            )));
        }
        Ok(())
    }

    fn output(&self, x: &DMatrix<f64>) -> DVector<f64> {
        let weights = DVector::from_column_slice(&self.weights);
        let linear = x * weights + DVector::from_element(x.nrows(), self.bias);
        match self.objective {
            Objective::Linear => linear,
            Objective::Logistic => linear.map(sigmoid),
        }
    }

    fn initialise(&mut self, features: usize, rng: &mut StdRng) -> Result<(), ModelError> {
        let normal = Normal::new(0.0, 0.01)
            .map_err(|e| ModelError::InvalidParameter(e.to_string()))?;
        self.weights = (0..features).map(|_| normal.sample(rng)).collect();
        self.bias = 0.0;
        Ok(())
    }

    fn step(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) {
        let residual = self.output(x) - y;
        // d(mse)/dz carries a factor 2; cross-entropy on a sigmoid does not.
        let scale = match self.objective {
            Objective::Linear => 2.0,
            Objective::Logistic => 1.0,
        } / x.nrows() as f64;

        let grad_w = x.transpose() * &residual * scale;
        let grad_b = residual.sum() * scale;
        for (w, g) in self.weights.iter_mut().zip(grad_w.iter()) {
            *w -= self.learning_rate * g;
        }
        self.bias -= self.learning_rate * grad_b;
    }

    fn scores(&self, x: &DMatrix<f64>, y: &DVector<f64>, batch_size: usize) -> Vec<f64> {
        match self.objective {
            Objective::Linear => regression_scores(|batch| self.output(batch), x, y, batch_size),
            Objective::Logistic => {
                let mut loss = 0.0;
                let mut correct = 0usize;
                let mut start = 0;
                while start < x.nrows() {
                    let len = batch_size.min(x.nrows() - start);
                    let p = self.output(&x.rows(start, len).into_owned());
                    for (p, t) in p.iter().zip(y.rows(start, len).iter()) {
                        let p = p.clamp(1e-7, 1.0 - 1e-7);
                        loss -= t * p.ln() + (1.0 - t) * (1.0 - p).ln();
                        if (p >= 0.5) == (*t >= 0.5) {
                            correct += 1;
                        }
                    }
                    start += len;
                }
                let n = x.nrows() as f64;
                vec![loss / n, correct as f64 / n]
            }
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl Model for SgdModel {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn fit(
        &mut self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        params: &FitParams<'_>,
    ) -> Result<History, ModelError> {
        check_shapes(x, y)?;
        check_batch_size(params.batch_size)?;
        if !(self.learning_rate > 0.0) {
            return Err(ModelError::InvalidParameter(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some((vx, vy)) = params.validation {
            check_shapes(vx, vy)?;
            if vx.ncols() != x.ncols() {
                return Err(ModelError::DimensionMismatch(format!(
                    "validation data has {} features, training data {}",
                    vx.ncols(),
                    x.ncols()
                )));
            }
        }

        let mut rng = self.rng();
        if self.weights.len() != x.ncols() {
            self.initialise(x.ncols(), &mut rng)?;
        }

        let mut history = History::start(Self::KIND);
        let mut order: Vec<usize> = (0..x.nrows()).collect();

        for epoch in 1..=params.epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(params.batch_size) {
                let bx = x.select_rows(batch.iter());
                let by = y.select_rows(batch.iter());
                self.step(&bx, &by);
            }

            let train = self.scores(x, y, params.batch_size);
            let validation = params
                .validation
                .map(|(vx, vy)| self.scores(vx, vy, params.batch_size));
            debug!(
                "Epoch {}/{}: loss {:.5}, metric {:.4}",
                epoch, params.epochs, train[0], train[1]
            );
            history.epochs.push(EpochRecord {
                epoch,
                loss: train[0],
                metric: train[1],
                val_loss: validation.as_ref().map(|v| v[0]),
                val_metric: validation.as_ref().map(|v| v[1]),
            });
        }

        info!(
            "SGD ({:?}) trained for {} epochs on {} rows",
            self.objective,
            params.epochs,
            x.nrows()
        );
        Ok(history.finish())
    }

    fn evaluate(&self, x: &DMatrix<f64>, y: &DVector<f64>, batch_size: usize) -> Result<Vec<f64>, ModelError> {
        check_shapes(x, y)?;
        check_batch_size(batch_size)?;
        self.check_features(x)?;
        Ok(self.scores(x, y, batch_size))
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        self.check_features(x)?;
        Ok(self.output(x))
    }

    fn to_native(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }
}
