use crate::{
    extractor::{FeatureStage, Network, Normalization},
    loss::{ContentLoss, StyleLoss},
    Error,
};
use candle_core::{Device, Tensor};
use std::collections::HashSet;

/// The layers after which content and style probes are inserted, named the
/// way [`Network::feature_stages`] names them.
#[derive(Clone, Debug)]
pub struct ProbeLayers {
    pub content: Vec<String>,
    pub style: Vec<String>,
}

impl Default for ProbeLayers {
    fn default() -> Self {
        Self {
            content: vec!["conv_4".to_owned()],
            style: (1..=5).map(|i| format!("conv_{}", i)).collect(),
        }
    }
}

/// A single step of an [`InstrumentedPipeline`]
#[derive(Clone, Debug)]
pub enum Stage {
    Normalize(Normalization),
    Feature(FeatureStage),
    ContentProbe(ContentLoss),
    StyleProbe(StyleLoss),
}

impl Stage {
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::ContentProbe(_) | Self::StyleProbe(_))
    }
}

/// A copy of the network with loss probes spliced in after the requested
/// layers, and nothing after the last probe.
///
/// Running an image `forward` through the pipeline refreshes the loss stored
/// in every probe.
#[derive(Clone, Debug)]
pub struct InstrumentedPipeline {
    stages: Vec<(String, Stage)>,
    device: Device,
}

impl InstrumentedPipeline {
    /// Builds the pipeline, computing the content targets from `content_img`
    /// and the style targets from `style_img` as each probe is inserted.
    ///
    /// `network` is only read, the pipeline holds its own handles to the
    /// layers.
    pub fn build(
        network: &Network,
        normalization: &Normalization,
        style_img: &Tensor,
        content_img: &Tensor,
        layers: &ProbeLayers,
    ) -> Result<Self, Error> {
        if layers.content.is_empty() && layers.style.is_empty() {
            return Err(Error::NoProbes);
        }

        let feature_stages = network.feature_stages()?;

        let mut stages = Vec::with_capacity(feature_stages.len() + 1);
        stages.push((
            "normalization".to_owned(),
            Stage::Normalize(normalization.clone()),
        ));

        let mut content_act = normalization.forward(&content_img.detach())?;
        let mut style_act = normalization.forward(&style_img.detach())?;

        // Targets are only needed up to the last requested layer
        let mut remaining: HashSet<&str> = layers
            .content
            .iter()
            .chain(layers.style.iter())
            .map(String::as_str)
            .collect();

        for stage in feature_stages {
            if !remaining.is_empty() {
                content_act = stage.forward(&content_act)?;
                style_act = stage.forward(&style_act)?;
            }

            let name = stage.name().to_owned();
            let ordinal = stage.ordinal();
            stages.push((name.clone(), Stage::Feature(stage)));

            if layers.content.contains(&name) {
                tracing::debug!("inserting content probe after {}", name);
                stages.push((
                    format!("content_loss_{}", ordinal),
                    Stage::ContentProbe(ContentLoss::new(&content_act)?),
                ));
            }

            if layers.style.contains(&name) {
                tracing::debug!("inserting style probe after {}", name);
                stages.push((
                    format!("style_loss_{}", ordinal),
                    Stage::StyleProbe(StyleLoss::new(&style_act)?),
                ));
            }

            remaining.remove(name.as_str());
        }

        if let Some(missing) = remaining.into_iter().next() {
            return Err(Error::UnknownProbeLayer(missing.to_owned()));
        }

        // Nothing after the last probe contributes to the loss
        let last_probe = stages
            .iter()
            .rposition(|(_, stage)| stage.is_probe())
            .ok_or(Error::NoProbes)?;
        stages.truncate(last_probe + 1);

        Ok(Self {
            stages,
            device: content_img.device().clone(),
        })
    }

    /// Runs `input` through every stage, updating the probes' losses
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor, Error> {
        let mut xs = input.clone();

        for (_, stage) in &mut self.stages {
            xs = match stage {
                Stage::Normalize(norm) => norm.forward(&xs)?,
                Stage::Feature(feature) => feature.forward(&xs)?,
                Stage::ContentProbe(probe) => probe.forward(&xs)?,
                Stage::StyleProbe(probe) => probe.forward(&xs)?,
            };
        }

        Ok(xs)
    }

    /// The device the probe targets live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn stages(&self) -> &[(String, Stage)] {
        &self.stages
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(name, _)| name.as_str())
    }

    /// The content probes, in network order
    pub fn content_losses(&self) -> impl Iterator<Item = &ContentLoss> {
        self.stages.iter().filter_map(|(_, stage)| match stage {
            Stage::ContentProbe(probe) => Some(probe),
            _ => None,
        })
    }

    /// The style probes, in network order
    pub fn style_losses(&self) -> impl Iterator<Item = &StyleLoss> {
        self.stages.iter().filter_map(|(_, stage)| match stage {
            Stage::StyleProbe(probe) => Some(probe),
            _ => None,
        })
    }
}
