//! Content and style probes, which measure how far the current activations
//! are from a fixed target while passing them through untouched.

use crate::Error;
use candle_core::Tensor;
use candle_nn::loss::mse;

/// Computes the normalized Gram matrix of a `(batch, channels, height, width)`
/// activation, ie. the correlation between every pair of feature maps, which
/// doesn't depend on where in the image a feature occurs.
///
/// The result is a square `(batch * channels, batch * channels)` matrix.
pub fn gram_matrix(input: &Tensor) -> Result<Tensor, Error> {
    let (batch, channels, height, width) = input.dims4()?;

    let features = input.reshape((batch * channels, height * width))?;
    let gram = features.matmul(&features.t()?)?;

    let elements = (batch * channels * height * width) as f64;
    Ok(gram.affine(1.0 / elements, 0.0)?)
}

/// Measures the mean squared error between the input activation and the
/// content target.
///
/// The probe is stateful: every call to `forward` replaces the loss that
/// `current_loss` returns.
#[derive(Clone, Debug)]
pub struct ContentLoss {
    target: Tensor,
    loss: Tensor,
}

impl ContentLoss {
    pub fn new(target: &Tensor) -> Result<Self, Error> {
        let target = target.detach();
        let loss = mse(&target, &target)?;

        Ok(Self { target, loss })
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor, Error> {
        self.loss = mse(input, &self.target)?;
        Ok(input.clone())
    }

    /// The loss from the most recent forward pass, zero before the first one
    pub fn current_loss(&self) -> &Tensor {
        &self.loss
    }

    pub fn target(&self) -> &Tensor {
        &self.target
    }
}

/// Measures the mean squared error between the Gram matrix of the input
/// activation and that of the style target.
///
/// Like [`ContentLoss`], `forward` updates the stored loss.
#[derive(Clone, Debug)]
pub struct StyleLoss {
    target: Tensor,
    loss: Tensor,
}

impl StyleLoss {
    /// Creates the probe from the raw style activation, its Gram matrix is
    /// computed here and kept as the target
    pub fn new(target_feature: &Tensor) -> Result<Self, Error> {
        let target = gram_matrix(&target_feature.detach())?.detach();
        let loss = mse(&target, &target)?;

        Ok(Self { target, loss })
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor, Error> {
        let gram = gram_matrix(input)?;
        self.loss = mse(&gram, &self.target)?;
        Ok(input.clone())
    }

    pub fn current_loss(&self) -> &Tensor {
        &self.loss
    }

    /// The target Gram matrix
    pub fn target(&self) -> &Tensor {
        &self.target
    }
}
