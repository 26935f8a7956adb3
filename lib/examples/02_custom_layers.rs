use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let device = ns::resolve_device(false)?;
    let model = ns::StyleModel::load("weights/vgg19.safetensors", &device)?;

    let content = ns::load_image(&"imgs/content.jpg", 256, &device)?;
    let style = ns::load_image(&"imgs/style.jpg", 256, &device)?;

    // list the stage names that probes can be attached to
    for stage in model.network.feature_stages()? {
        println!("{}", stage.name());
    }

    let transfer = ns::Transfer::builder()
        // only match the coarse style, and keep more of the content's detail
        .style_layers(vec!["conv_3", "conv_4", "conv_5"])
        .content_layers(vec!["conv_2"])
        .style_weight(1e6)
        // start from noise instead of the content image
        .init_image(ns::InitImage::Noise { seed: 17 })
        .iterations(500)
        .build()?;

    let stylized = transfer.run(&model, &content, &style, None)?;
    ns::save_image(&stylized, "out/02.png")
}
