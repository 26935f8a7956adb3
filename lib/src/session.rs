use crate::{
    errors,
    lbfgs::{Evaluation, Lbfgs, LbfgsConfig},
    pipeline::InstrumentedPipeline,
    Error, InitImage, Parameters, StyleModel,
};
use candle_core::{DType, Device, Tensor, Var};

/// Style transfer session.
///
/// A `Transfer` only holds parameters, so the same session can be run any
/// number of times, with any images. You can provide a `TransferProgress`
/// implementation to periodically get the current style and content scores.
///
/// # Example
/// ```no_run
/// # fn main() -> Result<(), neural_style::Error> {
/// let device = neural_style::resolve_device(false)?;
/// let model = neural_style::StyleModel::load("vgg19.safetensors", &device)?;
///
/// let content = neural_style::load_image(&"imgs/content.jpg", 256, &device)?;
/// let style = neural_style::load_image(&"imgs/style.jpg", 256, &device)?;
///
/// let transfer = neural_style::Transfer::builder()
///     .iterations(300)
///     .build()?;
///
/// let stylized = transfer.run(&model, &content, &style, None)?;
/// neural_style::save_image(&stylized, "stylized.png")?;
/// # Ok(())
/// # }
/// ```
pub struct Transfer {
    params: Parameters,
}

impl Transfer {
    /// Creates a new transfer builder with default parameters.
    pub fn builder() -> TransferBuilder {
        TransferBuilder::default()
    }

    /// Runs the transfer, starting from the working image chosen with
    /// [`TransferBuilder::init_image`].
    pub fn run(
        &self,
        model: &StyleModel,
        content: &Tensor,
        style: &Tensor,
        progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<Tensor, Error> {
        let working = match self.params.init {
            InitImage::Content => content.clone(),
            InitImage::Noise { seed } => crate::noise_image(content, seed)?,
        };

        self.run_with_input(model, content, style, working, progress)
    }

    /// Runs the transfer, optimizing the pixels of `working` and returning
    /// them, clamped to `[0, 1]`.
    ///
    /// The content, style and working images must have the same shape and be
    /// on the model's device. Any failure during the optimization aborts it.
    pub fn run_with_input(
        &self,
        model: &StyleModel,
        content: &Tensor,
        style: &Tensor,
        working: Tensor,
        progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<Tensor, Error> {
        check_inputs(&model.device, content, style, &working)?;

        tracing::info!("building the instrumented network");
        let pipeline = InstrumentedPipeline::build(
            &model.network,
            &model.normalization,
            style,
            content,
            &self.params.layers,
        )?;

        let mut objective = TransferObjective::new(
            pipeline,
            self.params.style_weight,
            self.params.content_weight,
            self.params.report_every,
            progress,
        )?
        .with_budget(self.params.iterations);

        let mut optimizer = Lbfgs::new(Var::from_tensor(&working)?, self.params.optimizer);

        tracing::info!("optimizing for {} iterations", self.params.iterations);
        while objective.iteration() <= self.params.iterations {
            optimizer.step(|image| objective.evaluate(image))?;
        }

        // Trial points of the line search can be worse than where the
        // optimizer ended up, so return the best image that was evaluated
        let image = match objective.into_best() {
            Some(best) => best,
            None => optimizer.into_param().into_inner(),
        };
        Ok(image.clamp(0f32, 1f32)?.detach())
    }
}

fn check_inputs(
    device: &Device,
    content: &Tensor,
    style: &Tensor,
    working: &Tensor,
) -> Result<(), Error> {
    content.dims4()?;

    for &(name, img) in &[("style", style), ("working", working)] {
        if img.dims() != content.dims() {
            return Err(Error::ShapeMismatch(errors::ShapeMismatch {
                name,
                expected: content.dims().to_vec(),
                actual: img.dims().to_vec(),
            }));
        }
    }

    for &(name, img) in &[("content", content), ("style", style), ("working", working)] {
        if !img.device().same_device(device) {
            return Err(Error::DeviceMismatch(name));
        }
    }

    Ok(())
}

/// The objective the optimizer minimizes, along with the bookkeeping that
/// has to survive between evaluations.
///
/// Each call to [`TransferObjective::evaluate`] counts as one iteration. The
/// objective also remembers the lowest scoring image it was evaluated on,
/// checkpoints report the scores of that image.
pub struct TransferObjective {
    pipeline: InstrumentedPipeline,
    style_weight: f64,
    content_weight: f64,
    report_every: usize,
    progress: Option<Box<dyn TransferProgress>>,
    iteration: usize,
    budget: usize,
    best: Option<BestImage>,
}

struct BestImage {
    image: Tensor,
    style_score: f64,
    content_score: f64,
}

impl TransferObjective {
    pub fn new(
        pipeline: InstrumentedPipeline,
        style_weight: f64,
        content_weight: f64,
        report_every: usize,
        progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<Self, Error> {
        if report_every == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::MAX,
                value: 0.0,
                name: "report-every",
            }));
        }

        Ok(Self {
            pipeline,
            style_weight,
            content_weight,
            report_every,
            progress,
            iteration: 0,
            budget: 0,
            best: None,
        })
    }

    /// The iteration budget passed along in progress updates
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// The number of evaluations so far
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The weighted style and content scores from the last evaluation
    pub fn scores(&self) -> Result<(f64, f64), Error> {
        let (style, content) = self.weighted_scores()?;
        Ok((scalar(&style)?, scalar(&content)?))
    }

    /// The weighted style and content scores of the best image so far
    pub fn best_scores(&self) -> Option<(f64, f64)> {
        self.best
            .as_ref()
            .map(|best| (best.style_score, best.content_score))
    }

    /// The clamped image with the lowest total loss seen so far
    pub fn into_best(self) -> Option<Tensor> {
        self.best.map(|best| best.image)
    }

    /// Clamps `image` into `[0, 1]`, runs it through the pipeline and returns
    /// the weighted loss together with its gradient w.r.t. the pixels.
    pub fn evaluate(&mut self, image: &Var) -> Result<Evaluation, Error> {
        let clamped = image.as_tensor().clamp(0f32, 1f32)?;
        image.set(&clamped)?;

        // Only the probes' side effects matter, the output is discarded
        self.pipeline.forward(image.as_tensor())?;

        let (style_score, content_score) = self.weighted_scores()?;
        let loss = (&style_score + &content_score)?;

        // Every backward pass starts from a fresh gradient store
        let grads = loss.backward()?;
        let grad = match grads.get(image.as_tensor()) {
            Some(grad) => grad.clone(),
            None => image.as_tensor().zeros_like()?,
        };

        self.iteration += 1;

        let style_score = scalar(&style_score)?;
        let content_score = scalar(&content_score)?;
        let total = style_score + content_score;

        let improved = match &self.best {
            Some(best) => total < best.style_score + best.content_score,
            None => true,
        };
        if improved {
            // The variable's storage is overwritten by later steps
            self.best = Some(BestImage {
                image: image.as_tensor().copy()?.detach(),
                style_score,
                content_score,
            });
        }

        if self.iteration % self.report_every == 0 {
            if let Some((style_score, content_score)) = self.best_scores() {
                tracing::info!(
                    "iteration {}: style loss {:.6}, content loss {:.6}",
                    self.iteration,
                    style_score,
                    content_score
                );

                if let Some(progress) = &mut self.progress {
                    progress.update(ProgressUpdate {
                        iteration: self.iteration,
                        budget: self.budget,
                        style_score,
                        content_score,
                    });
                }
            }
        }

        Ok(Evaluation { loss: total, grad })
    }

    fn weighted_scores(&self) -> Result<(Tensor, Tensor), Error> {
        let device = self.pipeline.device();

        let style = sum_losses(
            self.pipeline.style_losses().map(|p| p.current_loss()),
            device,
        )?
        .affine(self.style_weight, 0.0)?;

        let content = sum_losses(
            self.pipeline.content_losses().map(|p| p.current_loss()),
            device,
        )?
        .affine(self.content_weight, 0.0)?;

        Ok((style, content))
    }
}

fn sum_losses<'t>(
    losses: impl Iterator<Item = &'t Tensor>,
    device: &Device,
) -> Result<Tensor, Error> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for loss in losses {
        total = (total + loss)?;
    }

    Ok(total)
}

fn scalar(t: &Tensor) -> Result<f64, Error> {
    Ok(f64::from(t.to_scalar::<f32>()?))
}

/// Builds a transfer by setting parameters, calling `build` will check that
/// all of them are in a valid range
#[derive(Default)]
pub struct TransferBuilder {
    params: Parameters,
}

impl TransferBuilder {
    /// Creates a new `TransferBuilder`, can also be created via
    /// `Transfer::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The iteration budget. Every objective evaluation counts as an
    /// iteration, and a single optimizer step can evaluate the objective many
    /// times, so the final count can overshoot the budget.
    ///
    /// Default: 500
    pub fn iterations(mut self, count: usize) -> Self {
        self.params.iterations = count;
        self
    }

    /// How much the style probes' losses count towards the total loss.
    ///
    /// Default: 1e5
    pub fn style_weight(mut self, weight: f64) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// How much the content probes' losses count towards the total loss.
    ///
    /// Default: 1.0
    pub fn content_weight(mut self, weight: f64) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// The number of iterations between progress reports.
    ///
    /// Default: 50
    pub fn report_every(mut self, iterations: usize) -> Self {
        self.params.report_every = iterations;
        self
    }

    /// The layers followed by a content probe.
    ///
    /// Default: `conv_4`
    pub fn content_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.layers.content = layers.into_iter().map(Into::into).collect();
        self
    }

    /// The layers followed by a style probe.
    ///
    /// Default: `conv_1` through `conv_5`
    pub fn style_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.layers.style = layers.into_iter().map(Into::into).collect();
        self
    }

    /// What the working image starts out as when using [`Transfer::run`].
    ///
    /// Default: `InitImage::Content`
    pub fn init_image(mut self, init: InitImage) -> Self {
        self.params.init = init;
        self
    }

    /// Tweaks the L-BFGS optimizer, eg. the history size or the number of
    /// iterations per step.
    pub fn optimizer(mut self, config: LbfgsConfig) -> Self {
        self.params.optimizer = config;
        self
    }

    /// Creates a `Transfer`, or returns an error if invalid parameters were
    /// specified.
    pub fn build(self) -> Result<Transfer, Error> {
        self.check_parameters_validity()?;

        Ok(Transfer {
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let weights = [
            (self.params.style_weight, "style-weight"),
            (self.params.content_weight, "content-weight"),
        ];

        for &(value, name) in &weights {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f64::MAX,
                    value,
                    name,
                }));
            }
        }

        if self.params.report_every == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::MAX,
                value: 0.0,
                name: "report-every",
            }));
        }

        let opt = &self.params.optimizer;
        if opt.max_iter == 0 || opt.max_eval == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::MAX,
                value: 0.0,
                name: if opt.max_iter == 0 {
                    "max-iter"
                } else {
                    "max-eval"
                },
            }));
        }

        if opt.history_size == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::MAX,
                value: 0.0,
                name: "history-size",
            }));
        }

        if !(opt.lr > 0.0 && opt.lr.is_finite()) {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f64::MAX,
                value: opt.lr,
                name: "learning-rate",
            }));
        }

        if self.params.layers.content.is_empty() && self.params.layers.style.is_empty() {
            return Err(Error::NoProbes);
        }

        Ok(())
    }
}

/// The scores at a checkpoint of the optimization
#[derive(Copy, Clone, Debug)]
pub struct ProgressUpdate {
    /// The number of objective evaluations so far
    pub iteration: usize,
    /// The iteration budget of the transfer
    pub budget: usize,
    /// The weighted sum of the style losses of the best image so far
    pub style_score: f64,
    /// The weighted sum of the content losses of the best image so far
    pub content_score: f64,
}

impl ProgressUpdate {
    pub fn total(&self) -> f64 {
        self.style_score + self.content_score
    }
}

/// Allows the optimizer to update external callers with the current
/// progress of the transfer
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info)
    }
}
