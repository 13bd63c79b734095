use super::autograd::Parameter;
use crate::{error::StyleTransferError, tensor::Tensor1};
use anyhow::{bail, Result};
use ndarray::Dimension;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`LBFGS`].
    #[derive(Debug, Clone)]
    pub struct LBFGSBuilder {
        lr: f32,
        max_iter: usize,
        max_eval: Option<usize>,
        tolerance_grad: f32,
        tolerance_change: f32,
        history_size: usize,
    }

    impl LBFGSBuilder {
        pub(super) fn new() -> Self {
            Self {
                lr: 1.,
                max_iter: 20,
                max_eval: None,
                tolerance_grad: 1e-7,
                tolerance_change: 1e-9,
                history_size: 100,
            }
        }
        /// Learning rate. Default is 1.
        pub fn lr(self, lr: f32) -> Self {
            Self { lr, ..self }
        }
        /// Maximum number of iterations per [`.step()`](Optimizer::step). Default is 20.
        pub fn max_iter(self, max_iter: usize) -> Self {
            Self { max_iter, ..self }
        }
        /// Maximum number of evaluations per [`.step()`](Optimizer::step).
        ///
        /// Defaults to `max_iter * 5 / 4`.
        pub fn max_eval(self, max_eval: usize) -> Self {
            Self {
                max_eval: Some(max_eval),
                ..self
            }
        }
        /// Termination tolerance on the largest gradient element. Default is 1e-7.
        pub fn tolerance_grad(self, tolerance_grad: f32) -> Self {
            Self {
                tolerance_grad,
                ..self
            }
        }
        /// Termination tolerance on changes of the loss or the parameter. Default is 1e-9.
        pub fn tolerance_change(self, tolerance_change: f32) -> Self {
            Self {
                tolerance_change,
                ..self
            }
        }
        /// Number of curvature pairs kept. Default is 100.
        pub fn history_size(self, history_size: usize) -> Self {
            Self {
                history_size,
                ..self
            }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        /// `lr` must be positive and `max_iter`, `max_eval` and `history_size` must not be 0.
        pub fn build(self) -> Result<LBFGS> {
            let Self {
                lr,
                max_iter,
                max_eval,
                tolerance_grad,
                tolerance_change,
                history_size,
            } = self;
            let max_eval = max_eval.unwrap_or(max_iter * 5 / 4);
            if !(lr > 0.) {
                bail!(StyleTransferError::InvalidOption(format!(
                    "LBFGS lr {lr} must be positive"
                )));
            }
            if max_iter == 0 || max_eval == 0 || history_size == 0 {
                bail!(StyleTransferError::InvalidOption(format!(
                    "LBFGS max_iter {max_iter}, max_eval {max_eval} and history_size {history_size} must be positive"
                )));
            }
            Ok(LBFGS {
                lr,
                max_iter,
                max_eval,
                tolerance_grad,
                tolerance_change,
                history_size,
                state: LBFGSState::default(),
            })
        }
    }
}
use builder::*;

/// Objective.
///
/// Computes the loss at the current value of a parameter, storing its gradient in the
/// parameter via the backward pass.
///
/// Implemented for closures `FnMut(&mut Parameter<D>) -> Result<f32>`.
pub trait Objective<D: Dimension> {
    /// Evaluates the objective.
    fn evaluate(&mut self, parameter: &mut Parameter<D>) -> Result<f32>;
}

impl<D: Dimension, F: FnMut(&mut Parameter<D>) -> Result<f32>> Objective<D> for F {
    fn evaluate(&mut self, parameter: &mut Parameter<D>) -> Result<f32> {
        (self)(parameter)
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs an optimization step, updating `parameter`.
    ///
    /// `objective` may be evaluated several times. Returns the loss of the first evaluation.
    fn step<D, O>(&mut self, parameter: &mut Parameter<D>, objective: &mut O) -> Result<f32>
    where
        D: Dimension,
        O: Objective<D>;
}

#[derive(Default, Debug, Clone)]
struct LBFGSState {
    func_evals: usize,
    n_iter: usize,
    d: Option<Tensor1>,
    t: f32,
    old_dirs: VecDeque<Tensor1>,
    old_stps: VecDeque<Tensor1>,
    ro: VecDeque<f32>,
    h_diag: f32,
    prev_flat_grad: Option<Tensor1>,
    prev_loss: f32,
}

/// Limited memory BFGS.
///
/// Without line search, each iteration moves the parameter by `t * d`, where `d` is the
/// quasi-Newton direction computed from the last `history_size` curvature pairs, and `t`
/// is the learning rate (the first iteration is additionally scaled by `1 / |g|_1`).
///
/// State is kept across calls to [`.step()`](Optimizer::step) and is flattened, so the
/// parameter may have any dimensionality but must keep the same number of elements.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LBFGS {
    lr: f32,
    max_iter: usize,
    max_eval: usize,
    tolerance_grad: f32,
    tolerance_change: f32,
    history_size: usize,
    #[cfg_attr(feature = "serde", serde(skip))]
    state: LBFGSState,
}

impl Default for LBFGS {
    fn default() -> Self {
        Self {
            lr: 1.,
            max_iter: 20,
            max_eval: 25,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            state: LBFGSState::default(),
        }
    }
}

fn gather_flat_grad<D: Dimension>(parameter: &Parameter<D>) -> Result<Tensor1> {
    let Some(grad) = parameter.grad() else {
        bail!("LBFGS: objective did not compute a gradient for the parameter!");
    };
    Ok(grad.iter().copied().collect())
}

fn abs_max(x: &Tensor1) -> f32 {
    x.iter().fold(0f32, |acc, x| acc.max(x.abs()))
}

impl LBFGS {
    /// A builder for creating a [`LBFGS`].
    pub fn builder() -> LBFGSBuilder {
        LBFGSBuilder::new()
    }
    /// Maximum number of iterations per step.
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }
    /// Maximum number of evaluations per step.
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }
    /// Number of curvature pairs kept.
    pub fn history_size(&self) -> usize {
        self.history_size
    }
    /// The total number of objective evaluations.
    pub fn func_evals(&self) -> usize {
        self.state.func_evals
    }
    /// The total number of iterations.
    pub fn n_iter(&self) -> usize {
        self.state.n_iter
    }
    fn direction(&mut self, flat_grad: &Tensor1) -> Tensor1 {
        let history_size = self.history_size;
        let state = &mut self.state;
        let (Some(d), Some(prev_flat_grad)) = (state.d.take(), state.prev_flat_grad.take()) else {
            state.old_dirs.clear();
            state.old_stps.clear();
            state.ro.clear();
            state.h_diag = 1.;
            return flat_grad.mapv(|g| -g);
        };
        let y = flat_grad - &prev_flat_grad;
        let s = d * state.t;
        let ys = y.dot(&s);
        if ys > 1e-10 {
            if state.old_dirs.len() == history_size {
                state.old_dirs.pop_front();
                state.old_stps.pop_front();
                state.ro.pop_front();
            }
            state.h_diag = ys / y.dot(&y);
            state.old_dirs.push_back(y);
            state.old_stps.push_back(s);
            state.ro.push_back(1. / ys);
        }
        // two loop recursion
        let num_old = state.old_dirs.len();
        let mut al = vec![0f32; num_old];
        let mut q = flat_grad.mapv(|g| -g);
        for i in (0..num_old).rev() {
            al[i] = state.old_stps[i].dot(&q) * state.ro[i];
            q.scaled_add(-al[i], &state.old_dirs[i]);
        }
        let mut r = q * state.h_diag;
        for i in 0..num_old {
            let be_i = state.old_dirs[i].dot(&r) * state.ro[i];
            r.scaled_add(al[i] - be_i, &state.old_stps[i]);
        }
        r
    }
}

impl Optimizer for LBFGS {
    fn step<D, O>(&mut self, parameter: &mut Parameter<D>, objective: &mut O) -> Result<f32>
    where
        D: Dimension,
        O: Objective<D>,
    {
        let (lr, max_iter, max_eval) = (self.lr, self.max_iter, self.max_eval);
        let (tolerance_grad, tolerance_change) = (self.tolerance_grad, self.tolerance_change);
        let orig_loss = objective.evaluate(parameter)?;
        let mut loss = orig_loss;
        let mut current_evals = 1;
        self.state.func_evals += 1;
        let mut flat_grad = gather_flat_grad(parameter)?;
        if let Some(d) = self.state.d.as_ref() {
            if d.len() != flat_grad.len() {
                bail!(StyleTransferError::shape_mismatch(
                    &[d.len()],
                    &[flat_grad.len()]
                ));
            }
        }
        if abs_max(&flat_grad) <= tolerance_grad {
            return Ok(orig_loss);
        }
        let mut n_iter = 0;
        while n_iter < max_iter {
            n_iter += 1;
            self.state.n_iter += 1;
            let d = self.direction(&flat_grad);
            let state = &mut self.state;
            let first = state.n_iter == 1;
            state.prev_loss = loss;
            state.t = if first {
                let l1 = flat_grad.iter().map(|g| g.abs()).sum::<f32>();
                lr * 1f32.min(1. / l1)
            } else {
                lr
            };
            let t = state.t;
            let gtd = flat_grad.dot(&d);
            state.prev_flat_grad.replace(flat_grad.clone());
            state.d.replace(d);
            if gtd > -tolerance_change {
                break;
            }
            if let Some(d) = state.d.as_ref() {
                for (x, d) in parameter.value_view_mut().iter_mut().zip(d.iter()) {
                    *x += t * d;
                }
            }
            let mut opt_cond = false;
            if n_iter != max_iter {
                loss = objective.evaluate(parameter)?;
                flat_grad = gather_flat_grad(parameter)?;
                opt_cond = abs_max(&flat_grad) <= tolerance_grad;
                current_evals += 1;
                self.state.func_evals += 1;
            }
            if n_iter == max_iter || current_evals >= max_eval || opt_cond {
                break;
            }
            let state = &self.state;
            let step_max = state
                .d
                .as_ref()
                .map_or(0., |d| abs_max(d) * t.abs());
            if step_max <= tolerance_change {
                break;
            }
            if (loss - state.prev_loss).abs() < tolerance_change {
                break;
            }
        }
        Ok(orig_loss)
    }
}
