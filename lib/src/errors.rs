use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) value: f64,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) name: &'static str,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} image has shape {:?}, but the content image has shape {:?}",
            self.name, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// A tensor operation failed, this includes any failure during a forward
    /// or backward pass
    Tensor(candle_core::Error),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The content, style and working images must all have the same shape
    ShapeMismatch(ShapeMismatch),
    /// An input image lives on a different device than the model
    DeviceMismatch(&'static str),
    /// The network contains a stage that is not a convolution, activation,
    /// pooling or batch normalization
    UnsupportedLayer(String),
    /// A content or style layer was requested that the network does not have
    UnknownProbeLayer(String),
    /// No content or style layers were requested, so there is nothing to
    /// optimize
    NoProbes,
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Tensor(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Tensor(te) => write!(f, "{}", te),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::DeviceMismatch(name) => write!(
                f,
                "the {} image is not on the same device as the model",
                name
            ),
            Self::UnsupportedLayer(layer) => write!(f, "unsupported layer: {}", layer),
            Self::UnknownProbeLayer(name) => {
                write!(f, "the network has no layer named '{}'", name)
            }
            Self::NoProbes => write!(
                f,
                "at least 1 content or style layer must be specified"
            ),
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<candle_core::Error> for Error {
    fn from(te: candle_core::Error) -> Self {
        Self::Tensor(te)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}
