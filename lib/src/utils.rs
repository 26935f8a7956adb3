use crate::Error;
use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Loads an image as a `(1, 3, size, size)` tensor with values in `[0, 1]`.
///
/// The image is scaled so that its shorter side is `size`, then the center
/// square is cropped out.
pub fn load_image<'a, I: Into<ImageSource<'a>>>(
    src: I,
    size: u32,
    device: &Device,
) -> Result<Tensor, Error> {
    use image::GenericImageView;

    let img = load_dynamic_image(src.into())?;
    let (width, height) = img.dimensions();

    let scale = f64::from(size) / f64::from(width.min(height));
    let scaled_width = ((f64::from(width) * scale).round() as u32).max(size);
    let scaled_height = ((f64::from(height) * scale).round() as u32).max(size);

    let resized = image::imageops::resize(
        &img.to_rgb8(),
        scaled_width,
        scaled_height,
        image::imageops::FilterType::Triangle,
    );

    let cropped = image::imageops::crop_imm(
        &resized,
        (scaled_width - size) / 2,
        (scaled_height - size) / 2,
        size,
        size,
    )
    .to_image();

    image_to_tensor(&cropped, device)
}

/// Converts an 8-bit RGB image to a `(1, 3, height, width)` tensor in `[0, 1]`
pub fn image_to_tensor(img: &image::RgbImage, device: &Device) -> Result<Tensor, Error> {
    let (width, height) = img.dimensions();
    let data: Vec<f32> = img.as_raw().iter().map(|v| f32::from(*v) / 255.0).collect();

    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .contiguous()?;

    Ok(tensor)
}

/// Converts a `(1, 3, height, width)` tensor back into an 8-bit RGB image,
/// clamping values outside of `[0, 1]`
pub fn tensor_to_image(tensor: &Tensor) -> Result<image::RgbImage, Error> {
    let (batch, channels, height, width) = tensor.dims4()?;
    if batch != 1 || channels != 3 {
        return Err(Error::Tensor(candle_core::Error::Msg(format!(
            "expected a single RGB image, got shape {:?}",
            tensor.dims()
        ))));
    }

    let data: Vec<u8> = tensor
        .to_device(&Device::Cpu)?
        .squeeze(0)?
        .clamp(0f32, 1f32)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| (v * 255.0) as u8)
        .collect();

    image::RgbImage::from_raw(width as u32, height as u32, data).ok_or_else(|| {
        Error::Tensor(candle_core::Error::Msg(
            "pixel buffer doesn't match the image dimensions".to_owned(),
        ))
    })
}

/// Saves an image tensor to the specified path, the format is determined by
/// the file extension
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<(), Error> {
    let path = path.as_ref();

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") | Some("jpg") | Some("jpeg") | Some("bmp") => {}
        other => {
            return Err(Error::UnsupportedOutputFormat(
                other.unwrap_or_default().to_owned(),
            ))
        }
    }

    if let Some(parent_path) = path.parent() {
        std::fs::create_dir_all(&parent_path)?;
    }

    tensor_to_image(tensor)?.save(path)?;
    Ok(())
}

/// Creates a tensor shaped like `like`, filled with uniform noise in `[0, 1)`
pub fn noise_image(like: &Tensor, seed: u64) -> Result<Tensor, Error> {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
    let data: Vec<f32> = (0..like.elem_count()).map(|_| rng.gen::<f32>()).collect();

    Ok(Tensor::from_vec(data, like.dims(), like.device())?)
}

/// Selects the first CUDA device if there is one, otherwise the CPU
pub fn resolve_device(force_cpu: bool) -> Result<Device, Error> {
    let device = if force_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    tracing::info!("using {:?}", device);
    Ok(device)
}
