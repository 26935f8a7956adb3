mod progress_window;

use structopt::StructOpt;

use neural_style::{Error, InitImage, Transfer};
use progress_window::ProgressWindow;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn parse_init(input: &str) -> Result<Init, String> {
    let init = match input {
        "content" => Init::Content,
        "noise" => Init::Noise,
        other => {
            return Err(format!(
                "initial image `{}` not one of: 'content', 'noise'",
                other
            ))
        }
    };

    Ok(init)
}

#[derive(Copy, Clone)]
enum Init {
    Content,
    Noise,
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The number of objective evaluations to run. Each L-BFGS step evaluates
    /// the objective several times, so the final count may overshoot slightly.
    #[structopt(long, default_value = "500")]
    iterations: usize,
    /// How strongly the Gram matrices of the output should match the style image
    #[structopt(long, default_value = "100000")]
    style_weight: f64,
    /// How strongly the features of the output should match the content image
    #[structopt(long, default_value = "1")]
    content_weight: f64,
    /// Report the current scores every N iterations
    #[structopt(long, default_value = "50")]
    report_every: usize,
    /// The layer(s) after which content probes are placed, eg. `conv_4`
    #[structopt(long = "content-layer")]
    content_layers: Vec<String>,
    /// The layer(s) after which style probes are placed, eg. `conv_1`
    #[structopt(long = "style-layer")]
    style_layers: Vec<String>,
    /// What the optimized image starts as, either `content` or `noise`
    #[structopt(
        long,
        default_value = "content",
        parse(try_from_str = parse_init)
    )]
    init: Init,
    /// A seed value for the noise used with `--init noise`
    #[structopt(long, default_value = "0")]
    seed: u64,
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of one image onto the content of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Path to the pretrained VGG19 weights, in safetensors format
    #[structopt(long, parse(from_os_str))]
    weights: PathBuf,
    /// The image whose content is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image from which the style will be be sourced
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The path to save the generated image to, the file extension of the path
    /// determines the image format used.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// Both inputs are scaled and center cropped to `size x size`
    #[structopt(long, default_value = "512")]
    size: u32,
    /// Run on the CPU even if a GPU is available
    #[structopt(long)]
    cpu: bool,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
    /// Log what each stage of the transfer is doing
    #[structopt(short, long)]
    verbose: bool,
    #[structopt(flatten)]
    tweaks: Tweaks,
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn install_logger(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::WARN })
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn real_main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Opt::from_args();

    install_logger(args.verbose)?;

    // Check the output extension before spending minutes on the transfer
    match args.output_path.extension().and_then(|ext| ext.to_str()) {
        Some("png") | Some("jpg") | Some("jpeg") | Some("bmp") => {}
        other => {
            return Err(
                Error::UnsupportedOutputFormat(other.unwrap_or_default().to_owned()).into(),
            );
        }
    }

    let device = neural_style::resolve_device(args.cpu)?;
    let model = neural_style::StyleModel::load(&args.weights, &device)?;

    let content = neural_style::load_image(&args.content, args.size, &device)?;
    let style = neural_style::load_image(&args.style, args.size, &device)?;

    let tweaks = &args.tweaks;
    let mut tb = Transfer::builder()
        .iterations(tweaks.iterations)
        .style_weight(tweaks.style_weight)
        .content_weight(tweaks.content_weight)
        .report_every(tweaks.report_every)
        .init_image(match tweaks.init {
            Init::Content => InitImage::Content,
            Init::Noise => InitImage::Noise { seed: tweaks.seed },
        });

    if !tweaks.content_layers.is_empty() {
        tb = tb.content_layers(&tweaks.content_layers);
    }

    if !tweaks.style_layers.is_empty() {
        tb = tb.style_layers(&tweaks.style_layers);
    }

    let transfer = tb.build()?;

    let progress: Option<Box<dyn neural_style::TransferProgress>> = if !args.no_progress {
        Some(Box::new(ProgressWindow::new(tweaks.iterations)))
    } else {
        None
    };

    let stylized = transfer.run(&model, &content, &style, progress)?;
    neural_style::save_image(&stylized, &args.output_path)?;

    Ok(())
}
