// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4
#![allow(unsafe_code)]

//! `neural-style` transfers the style of one image onto the content of
//! another by optimizing the pixels of a working image directly, using a
//! frozen, pretrained convolutional network (VGG19) as a feature extractor.
//!
//! Content and style probes are spliced into a copy of the network after
//! chosen layers. A probe passes activations through untouched and records
//! how far they are from its target: the content image's activations for a
//! content probe, the Gram matrix of the style image's activations for a
//! style probe. The weighted sum of all probe losses is then minimized with
//! L-BFGS.
//!
//! First, you build a `Transfer` via a `TransferBuilder`, which follows the
//! builder pattern and validates the parameters. Calling `run` with a
//! `StyleModel` and the content and style images produces the stylized image.
//!
//! ## Usage
//!
//! ```no_run
//! use neural_style as ns;
//!
//! # fn main() -> Result<(), ns::Error> {
//! let device = ns::resolve_device(false)?;
//!
//! // Load the pretrained network once, it can be reused for every transfer
//! let model = ns::StyleModel::load("vgg19.safetensors", &device)?;
//!
//! let content = ns::load_image(&"imgs/content.jpg", 512, &device)?;
//! let style = ns::load_image(&"imgs/style.jpg", 512, &device)?;
//!
//! let transfer = ns::Transfer::builder()
//!     .iterations(300)
//!     .style_weight(1e5)
//!     .build()?;
//!
//! let stylized = transfer.run(&model, &content, &style, None)?;
//! ns::save_image(&stylized, "out/stylized.png")?;
//! # Ok(())
//! # }
//! ```
mod errors;
pub mod extractor;
pub mod lbfgs;
pub mod loss;
pub mod pipeline;
pub mod session;
mod utils;

pub use candle_core;
pub use image;

pub use errors::Error;
pub use extractor::{FeatureStage, Layer, Network, Normalization, StageKind, StyleModel};
pub use lbfgs::{LbfgsConfig, LineSearch};
pub use pipeline::{InstrumentedPipeline, ProbeLayers};
pub use session::{ProgressUpdate, Transfer, TransferBuilder, TransferProgress};
pub use utils::{
    image_to_tensor, load_dynamic_image, load_image, noise_image, resolve_device, save_image,
    tensor_to_image, ImageSource,
};

/// How the working image is initialized before optimization
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum InitImage {
    /// A copy of the content image
    Content,
    /// Uniform noise, generated from the seed
    Noise { seed: u64 },
}

struct Parameters {
    iterations: usize,
    style_weight: f64,
    content_weight: f64,
    report_every: usize,
    layers: ProbeLayers,
    init: InitImage,
    optimizer: LbfgsConfig,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            iterations: 500,
            style_weight: 1e5,
            content_weight: 1.0,
            report_every: 50,
            layers: ProbeLayers::default(),
            init: InitImage::Content,
            optimizer: LbfgsConfig::default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use candle_core::{Device, Tensor};
    use candle_nn::{Conv2d, Conv2dConfig};
    use rand::{Rng, SeedableRng};

    fn conv(rng: &mut rand_pcg::Pcg32, device: &Device, in_c: usize, out_c: usize) -> Layer {
        let weights: Vec<f32> = (0..out_c * in_c * 9)
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect();
        let bias: Vec<f32> = (0..out_c).map(|_| rng.gen_range(0.0..0.1)).collect();

        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        Layer::Conv2d(Conv2d::new(
            Tensor::from_vec(weights, (out_c, in_c, 3, 3), device).unwrap(),
            Some(Tensor::from_vec(bias, out_c, device).unwrap()),
            cfg,
        ))
    }

    /// Five small convolution blocks with fixed random weights, named
    /// `conv_1` through `conv_5`
    pub(crate) fn tiny_network(device: &Device) -> (Network, Normalization) {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(42);
        let relu = || Layer::Relu { inplace: true };
        let pool = || Layer::MaxPool2d {
            kernel: 2,
            stride: 2,
        };

        let network = Network::from_layers(vec![
            conv(&mut rng, device, 3, 4),
            relu(),
            pool(),
            conv(&mut rng, device, 4, 4),
            relu(),
            conv(&mut rng, device, 4, 6),
            relu(),
            pool(),
            conv(&mut rng, device, 6, 6),
            relu(),
            conv(&mut rng, device, 6, 6),
            relu(),
        ]);

        (network, Normalization::imagenet(device).unwrap())
    }

    pub(crate) fn uniform_image(device: &Device, value: f32, size: usize) -> Tensor {
        Tensor::ones((1, 3, size, size), candle_core::DType::F32, device)
            .unwrap()
            .affine(f64::from(value), 0.0)
            .unwrap()
    }

    /// An image whose channels ramp in different directions
    pub(crate) fn gradient_image(device: &Device, size: usize) -> Tensor {
        let mut data = Vec::with_capacity(3 * size * size);
        for c in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    let v = match c {
                        0 => x as f32,
                        1 => y as f32,
                        _ => (x + y) as f32 / 2.0,
                    };
                    data.push(v / size as f32);
                }
            }
        }

        Tensor::from_vec(data, (1, 3, size, size), device).unwrap()
    }
}
