use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let device = ns::resolve_device(false)?;

    // the pretrained VGG19, converted from the torchvision checkpoint
    let model = ns::StyleModel::load("weights/vgg19.safetensors", &device)?;

    // both images must be the same size, load_image crops them to a square
    let content = ns::load_image(&"imgs/content.jpg", 512, &device)?;
    let style = ns::load_image(&"imgs/style.jpg", 512, &device)?;

    let transfer = ns::Transfer::builder().iterations(300).build()?;

    // print the scores every 50 iterations
    let progress = |update: ns::ProgressUpdate| {
        println!(
            "run {}: style loss {:.4} content loss {:.4}",
            update.iteration, update.style_score, update.content_score
        );
    };

    let stylized = transfer.run(&model, &content, &style, Some(Box::new(progress)))?;
    ns::save_image(&stylized, "out/01.jpg")
}
