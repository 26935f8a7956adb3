//! Limited-memory BFGS over a single tensor variable.
//!
//! Each [`Lbfgs::step`] runs up to `max_iter` quasi-Newton iterations,
//! re-evaluating the objective through a closure after every update. The step
//! length along each direction is either found with a strong Wolfe line search
//! or fixed to the learning rate. In both cases the very first iteration
//! starts from a step scaled down by the gradient's L1 norm.

use crate::Error;
use candle_core::{Tensor, Var};
use std::collections::VecDeque;

/// The value of the objective and its gradient w.r.t. the optimized variable
pub struct Evaluation {
    pub loss: f64,
    /// Must have the same shape as the variable
    pub grad: Tensor,
}

/// How the step length along a search direction is chosen
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineSearch {
    /// Always step by the learning rate. The loss is free to go up between
    /// iterations.
    Fixed,
    /// Bracket and zoom until the sufficient decrease and curvature
    /// conditions hold, starting from the learning rate.
    StrongWolfe,
}

#[derive(Copy, Clone, Debug)]
pub struct LbfgsConfig {
    /// Initial step length
    pub lr: f64,
    /// Maximum number of iterations per `step`
    pub max_iter: usize,
    /// Maximum number of objective evaluations per `step`
    pub max_eval: usize,
    /// Termination tolerance on the largest absolute gradient component
    pub tolerance_grad: f64,
    /// Termination tolerance on loss and parameter changes
    pub tolerance_change: f64,
    /// Number of correction pairs kept
    pub history_size: usize,
    pub line_search: LineSearch,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            lr: 1.0,
            max_iter: 20,
            max_eval: 25,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            line_search: LineSearch::StrongWolfe,
        }
    }
}

/// State carried from one `step` to the next
#[derive(Default)]
struct State {
    direction: Option<Tensor>,
    step_size: f64,
    old_dirs: VecDeque<Tensor>,
    old_steps: VecDeque<Tensor>,
    ro: VecDeque<f64>,
    h_diag: f64,
    prev_flat_grad: Option<Tensor>,
    n_iter: usize,
    func_evals: usize,
}

pub struct Lbfgs {
    param: Var,
    config: LbfgsConfig,
    state: State,
}

fn dot(a: &Tensor, b: &Tensor) -> Result<f64, Error> {
    Ok(f64::from((a * b)?.sum_all()?.to_scalar::<f32>()?))
}

fn abs_max(a: &Tensor) -> Result<f64, Error> {
    Ok(f64::from(a.abs()?.max(0)?.to_scalar::<f32>()?))
}

fn abs_sum(a: &Tensor) -> Result<f64, Error> {
    Ok(f64::from(a.abs()?.sum_all()?.to_scalar::<f32>()?))
}

/// Sufficient decrease constant
const WOLFE_C1: f64 = 1e-4;
/// Curvature constant
const WOLFE_C2: f64 = 0.9;
const MAX_LINE_SEARCH_EVALS: usize = 25;

/// Minimizer of the cubic through two points with known values and
/// derivatives, clamped to `bounds` (or the interval between the points)
fn cubic_interpolate(
    (x1, f1, g1): (f64, f64, f64),
    (x2, f2, g2): (f64, f64, f64),
    bounds: Option<(f64, f64)>,
) -> f64 {
    let (lo, hi) = bounds.unwrap_or(if x1 <= x2 { (x1, x2) } else { (x2, x1) });

    let d1 = g1 + g2 - 3.0 * (f1 - f2) / (x1 - x2);
    let d2_square = d1 * d1 - g1 * g2;
    if d2_square < 0.0 {
        return (lo + hi) / 2.0;
    }

    let d2 = d2_square.sqrt();
    let min_pos = if x1 <= x2 {
        x2 - (x2 - x1) * ((g2 + d2 - d1) / (g2 - g1 + 2.0 * d2))
    } else {
        x1 - (x1 - x2) * ((g1 + d2 - d1) / (g1 - g2 + 2.0 * d2))
    };

    // NaN from a degenerate cubic falls back to the midpoint
    if min_pos.is_nan() {
        (lo + hi) / 2.0
    } else {
        min_pos.max(lo).min(hi)
    }
}

/// A point evaluated along the search direction
#[derive(Clone)]
struct LinePoint {
    t: f64,
    loss: f64,
    grad: Tensor,
    gtd: f64,
}

/// Indices of the lower and higher ends of a bracket
fn low_high(bracket: &[LinePoint]) -> (usize, usize) {
    if bracket[0].loss <= bracket[bracket.len() - 1].loss {
        (0, 1)
    } else {
        (1, 0)
    }
}

struct LineSearchResult {
    t: f64,
    loss: f64,
    grad: Tensor,
    evals: usize,
}

/// Finds a step length `t` along `direction` satisfying the strong Wolfe
/// conditions, evaluating the objective at `x + t * direction` through
/// `evaluate`.
///
/// When the evaluation budget runs out, the lowest point of the bracket is
/// returned, which is never worse than the starting point.
fn strong_wolfe<F>(
    mut evaluate: F,
    t: f64,
    direction: &Tensor,
    start: LinePoint,
    tolerance_change: f64,
) -> Result<LineSearchResult, Error>
where
    F: FnMut(f64) -> Result<(f64, Tensor), Error>,
{
    let d_norm = abs_max(direction)?;
    let (f, gtd) = (start.loss, start.gtd);

    let mut eval_at = |t: f64| -> Result<LinePoint, Error> {
        let (loss, grad) = evaluate(t)?;
        let gtd = dot(&grad, direction)?;
        Ok(LinePoint {
            t,
            loss,
            grad,
            gtd,
        })
    };

    let mut new = eval_at(t)?;
    let mut evals = 1;
    let mut prev = start.clone();
    let mut done = false;
    let mut ls_iter = 0;

    // Bracketing phase
    let mut bracket: Vec<LinePoint> = loop {
        if ls_iter >= MAX_LINE_SEARCH_EVALS {
            break vec![start.clone(), new];
        }

        if new.loss > f + WOLFE_C1 * new.t * gtd || (ls_iter > 1 && new.loss >= prev.loss) {
            break vec![prev, new];
        }

        if new.gtd.abs() <= -WOLFE_C2 * gtd {
            done = true;
            break vec![new];
        }

        if new.gtd >= 0.0 {
            break vec![prev, new];
        }

        let min_step = new.t + 0.01 * (new.t - prev.t);
        let max_step = new.t * 10.0;
        let next_t = cubic_interpolate(
            (prev.t, prev.loss, prev.gtd),
            (new.t, new.loss, new.gtd),
            Some((min_step, max_step)),
        );

        prev = new;
        new = eval_at(next_t)?;
        evals += 1;
        ls_iter += 1;
    };

    let (mut low, mut high) = low_high(&bracket);

    // Zoom phase
    let mut insufficient_progress = false;
    while !done && ls_iter < MAX_LINE_SEARCH_EVALS {
        let (lo_t, hi_t) = (
            bracket[0].t.min(bracket[1].t),
            bracket[0].t.max(bracket[1].t),
        );
        if (hi_t - lo_t) * d_norm < tolerance_change {
            break;
        }

        let mut t = cubic_interpolate(
            (bracket[0].t, bracket[0].loss, bracket[0].gtd),
            (bracket[1].t, bracket[1].loss, bracket[1].gtd),
            None,
        );

        // Keep the trial point away from the edges of the bracket
        let eps = 0.1 * (hi_t - lo_t);
        if (hi_t - t).min(t - lo_t) < eps {
            if insufficient_progress || t >= hi_t || t <= lo_t {
                t = if (t - hi_t).abs() < (t - lo_t).abs() {
                    hi_t - eps
                } else {
                    lo_t + eps
                };
                insufficient_progress = false;
            } else {
                insufficient_progress = true;
            }
        } else {
            insufficient_progress = false;
        }

        let trial = eval_at(t)?;
        evals += 1;
        ls_iter += 1;

        if trial.loss > f + WOLFE_C1 * trial.t * gtd || trial.loss >= bracket[low].loss {
            bracket[high] = trial;
            let (l, h) = low_high(&bracket);
            low = l;
            high = h;
        } else {
            if trial.gtd.abs() <= -WOLFE_C2 * gtd {
                done = true;
            } else if trial.gtd * (bracket[high].t - bracket[low].t) >= 0.0 {
                bracket[high] = bracket[low].clone();
            }

            bracket[low] = trial;
        }
    }

    if !done {
        tracing::debug!("line search stopped before the Wolfe conditions held");
    }

    let best = bracket.swap_remove(low);
    Ok(LineSearchResult {
        t: best.t,
        loss: best.loss,
        grad: best.grad,
        evals,
    })
}

/// Evaluates `closure` with the parameter moved to `x + t * direction`, then
/// puts the parameter back to `x`
fn directional_evaluate<F>(
    param: &Var,
    closure: &mut F,
    x: &Tensor,
    t: f64,
    direction: &Tensor,
) -> Result<(f64, Tensor), Error>
where
    F: FnMut(&Var) -> Result<Evaluation, Error>,
{
    let moved = (x + direction.affine(t, 0.0)?.reshape(x.dims())?)?;
    param.set(&moved)?;

    let eval = closure(param)?;
    param.set(x)?;

    Ok((eval.loss, eval.grad.flatten_all()?))
}

impl Lbfgs {
    pub fn new(param: Var, config: LbfgsConfig) -> Self {
        Self {
            param,
            config,
            state: State::default(),
        }
    }

    pub fn param(&self) -> &Var {
        &self.param
    }

    pub fn into_param(self) -> Var {
        self.param
    }

    /// Total number of objective evaluations over all steps
    pub fn func_evals(&self) -> usize {
        self.state.func_evals
    }

    /// Performs a single optimization step, which may evaluate `closure`
    /// several times. Returns the loss from the first evaluation.
    pub fn step<F>(&mut self, mut closure: F) -> Result<f64, Error>
    where
        F: FnMut(&Var) -> Result<Evaluation, Error>,
    {
        let cfg = self.config;

        let eval = closure(&self.param)?;
        let orig_loss = eval.loss;
        let mut loss = eval.loss;
        let mut flat_grad = eval.grad.flatten_all()?;
        let mut current_evals = 1;
        self.state.func_evals += 1;

        let mut opt_cond = abs_max(&flat_grad)? <= cfg.tolerance_grad;
        if opt_cond {
            tracing::debug!("gradient is below tolerance, nothing to do");
            return Ok(orig_loss);
        }

        let mut n_iter = 0;
        while n_iter < cfg.max_iter {
            n_iter += 1;
            self.state.n_iter += 1;

            let direction = match (&self.state.direction, &self.state.prev_flat_grad) {
                (Some(prev_dir), Some(prev_grad)) if self.state.n_iter > 1 => {
                    let y = (&flat_grad - prev_grad)?;
                    let s = prev_dir.affine(self.state.step_size, 0.0)?;
                    let ys = dot(&y, &s)?;

                    if ys > 1e-10 {
                        if self.state.old_dirs.len() == cfg.history_size {
                            self.state.old_dirs.pop_front();
                            self.state.old_steps.pop_front();
                            self.state.ro.pop_front();
                        }

                        self.state.h_diag = ys / dot(&y, &y)?;
                        self.state.old_dirs.push_back(y);
                        self.state.old_steps.push_back(s);
                        self.state.ro.push_back(1.0 / ys);
                    }

                    self.two_loop(&flat_grad)?
                }
                _ => {
                    self.state.old_dirs.clear();
                    self.state.old_steps.clear();
                    self.state.ro.clear();
                    self.state.h_diag = 1.0;
                    flat_grad.neg()?
                }
            };

            self.state.prev_flat_grad = Some(flat_grad.clone());
            let prev_loss = loss;

            let mut step_size = if self.state.n_iter == 1 {
                (1.0 / abs_sum(&flat_grad)?).min(1.0) * cfg.lr
            } else {
                cfg.lr
            };

            let gtd = dot(&flat_grad, &direction)?;
            self.state.direction = Some(direction.clone());
            self.state.step_size = step_size;

            // Not a descent direction
            if gtd > -cfg.tolerance_change {
                tracing::debug!("direction is not a descent direction, stopping");
                break;
            }

            match cfg.line_search {
                LineSearch::StrongWolfe => {
                    let x_init = self.param.as_tensor().copy()?.detach();
                    let param = &self.param;
                    let start = LinePoint {
                        t: 0.0,
                        loss,
                        grad: flat_grad.clone(),
                        gtd,
                    };

                    let found = strong_wolfe(
                        |t| directional_evaluate(param, &mut closure, &x_init, t, &direction),
                        step_size,
                        &direction,
                        start,
                        cfg.tolerance_change,
                    )?;

                    step_size = found.t;
                    self.state.step_size = step_size;
                    self.add_step(&x_init, step_size, &direction)?;

                    loss = found.loss;
                    flat_grad = found.grad;
                    opt_cond = abs_max(&flat_grad)? <= cfg.tolerance_grad;
                    current_evals += found.evals;
                    self.state.func_evals += found.evals;
                }
                LineSearch::Fixed => {
                    let x = self.param.as_tensor().copy()?.detach();
                    self.add_step(&x, step_size, &direction)?;

                    if n_iter != cfg.max_iter {
                        let eval = closure(&self.param)?;
                        loss = eval.loss;
                        flat_grad = eval.grad.flatten_all()?;
                        opt_cond = abs_max(&flat_grad)? <= cfg.tolerance_grad;
                        current_evals += 1;
                        self.state.func_evals += 1;
                    }
                }
            }

            if n_iter == cfg.max_iter || current_evals >= cfg.max_eval || opt_cond {
                break;
            }

            if abs_max(&direction)? * step_size.abs() <= cfg.tolerance_change {
                tracing::debug!("parameter change is below tolerance");
                break;
            }

            if (loss - prev_loss).abs() < cfg.tolerance_change {
                tracing::debug!("loss change is below tolerance");
                break;
            }
        }

        Ok(orig_loss)
    }

    /// Sets the parameter to `x + t * direction`
    fn add_step(&self, x: &Tensor, t: f64, direction: &Tensor) -> Result<(), Error> {
        let update = direction.affine(t, 0.0)?.reshape(x.dims())?;
        self.param.set(&(x + update)?)?;
        Ok(())
    }

    /// Approximates `-H^-1 * grad` from the stored correction pairs
    fn two_loop(&self, flat_grad: &Tensor) -> Result<Tensor, Error> {
        let state = &self.state;
        let num_old = state.old_dirs.len();
        let mut al = vec![0.0; num_old];

        let mut q = flat_grad.neg()?;
        for i in (0..num_old).rev() {
            al[i] = dot(&state.old_steps[i], &q)? * state.ro[i];
            q = (q - state.old_dirs[i].affine(al[i], 0.0)?)?;
        }

        let mut r = q.affine(state.h_diag, 0.0)?;
        for i in 0..num_old {
            let be_i = dot(&state.old_dirs[i], &r)? * state.ro[i];
            r = (r + state.old_steps[i].affine(al[i] - be_i, 0.0)?)?;
        }

        Ok(r)
    }
}
