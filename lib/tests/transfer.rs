use neural_style as ns;
use ns::candle_core::{DType, Device, Tensor};
use std::sync::{Arc, Mutex};

fn conv(seed: usize, in_c: usize, out_c: usize) -> ns::Layer {
    // deterministic, roughly zero-centered weights
    let weights: Vec<f32> = (0..out_c * in_c * 9)
        .map(|i| (((i + seed * 131) as f32) * 0.618).sin() * 0.4)
        .collect();
    let bias: Vec<f32> = (0..out_c).map(|i| 0.02 * i as f32).collect();

    let cfg = candle_nn::Conv2dConfig {
        padding: 1,
        ..Default::default()
    };

    ns::Layer::Conv2d(candle_nn::Conv2d::new(
        Tensor::from_vec(weights, (out_c, in_c, 3, 3), &Device::Cpu).unwrap(),
        Some(Tensor::from_vec(bias, out_c, &Device::Cpu).unwrap()),
        cfg,
    ))
}

fn model() -> ns::StyleModel {
    let relu = || ns::Layer::Relu { inplace: true };
    let pool = || ns::Layer::MaxPool2d {
        kernel: 2,
        stride: 2,
    };

    let network = ns::Network::from_layers(vec![
        conv(1, 3, 4),
        relu(),
        conv(2, 4, 4),
        relu(),
        pool(),
        conv(3, 4, 8),
        relu(),
        conv(4, 8, 8),
        relu(),
        pool(),
        conv(5, 8, 8),
        relu(),
        conv(6, 8, 8),
        relu(),
    ]);

    let dev = Device::Cpu;
    ns::StyleModel::new(network, ns::Normalization::imagenet(&dev).unwrap(), dev)
}

fn uniform(value: f64, size: usize) -> Tensor {
    Tensor::ones((1, 3, size, size), DType::F32, &Device::Cpu)
        .unwrap()
        .affine(value, 0.0)
        .unwrap()
}

fn stripes(size: usize) -> Tensor {
    let data: Vec<f32> = (0..3 * size * size)
        .map(|i| if (i / 2) % 2 == 0 { 0.9 } else { 0.1 })
        .collect();
    Tensor::from_vec(data, (1, 3, size, size), &Device::Cpu).unwrap()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

type Reports = Arc<Mutex<Vec<ns::ProgressUpdate>>>;

fn recorder() -> (Reports, Box<dyn ns::TransferProgress>) {
    let reports = Reports::default();
    let sink = {
        let reports = reports.clone();
        move |update: ns::ProgressUpdate| reports.lock().unwrap().push(update)
    };

    let sink: Box<dyn ns::TransferProgress> = Box::new(sink);
    (reports, sink)
}

#[test]
fn zero_budget_on_identical_images() {
    let model = model();
    let img = uniform(0.5, 64);

    let transfer = ns::Transfer::builder().iterations(0).build().unwrap();
    let out = transfer
        .run_with_input(&model, &img, &img, img.clone(), None)
        .unwrap();

    assert_eq!(out.dims(), [1, 3, 64, 64]);
    for v in values(&out) {
        assert!((v - 0.5).abs() < 1e-6);
    }
}

#[test]
fn single_iteration_budget_never_reports() {
    let model = model();
    let content = uniform(0.3, 16);
    let style = stripes(16);

    let (reports, sink) = recorder();
    let transfer = ns::Transfer::builder().iterations(1).build().unwrap();
    let out = transfer.run(&model, &content, &style, Some(sink)).unwrap();

    assert!(reports.lock().unwrap().is_empty());
    assert_eq!(out.dims(), content.dims());
    assert!(values(&out).iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn output_is_clamped() {
    let model = model();
    let content = stripes(16);
    let style = uniform(0.8, 16);

    let transfer = ns::Transfer::builder()
        .iterations(30)
        .style_weight(1e7)
        .init_image(ns::InitImage::Noise { seed: 3 })
        .build()
        .unwrap();
    let out = transfer.run(&model, &content, &style, None).unwrap();

    assert!(values(&out).iter().all(|v| (0.0..=1.0).contains(v)));
}

fn checkpoint_totals(reports: &[ns::ProgressUpdate]) -> Vec<f64> {
    reports.iter().map(ns::ProgressUpdate::total).collect()
}

#[test]
fn loss_never_increases_across_checkpoints() {
    let model = model();
    let content = stripes(16);
    let style = uniform(0.7, 16);

    let (reports, sink) = recorder();
    let transfer = ns::Transfer::builder()
        .iterations(80)
        .report_every(10)
        .build()
        .unwrap();
    transfer.run(&model, &content, &style, Some(sink)).unwrap();

    let reports = reports.lock().unwrap();
    assert!(reports.len() >= 8);
    assert!(reports.iter().all(|r| r.iteration % 10 == 0 && r.budget == 80));

    let totals = checkpoint_totals(&reports);
    assert!(
        totals.windows(2).all(|w| w[1] <= w[0] * (1.0 + 1e-6)),
        "loss went up between checkpoints: {:?}",
        totals
    );
    assert!(totals[totals.len() - 1] < totals[0], "{:?}", totals);
}

#[test]
fn heavy_style_weight_stays_monotonic() {
    let model = model();
    let content = stripes(32);
    let style = uniform(0.2, 32);

    let (reports, sink) = recorder();
    let transfer = ns::Transfer::builder()
        .iterations(60)
        .style_weight(1e7)
        .report_every(10)
        .build()
        .unwrap();
    transfer.run(&model, &content, &style, Some(sink)).unwrap();

    let totals = checkpoint_totals(&reports.lock().unwrap());
    assert!(!totals.is_empty());
    assert!(
        totals.windows(2).all(|w| w[1] <= w[0] * (1.0 + 1e-6)),
        "loss went up between checkpoints: {:?}",
        totals
    );
}

#[test]
fn result_is_no_worse_than_last_checkpoint() {
    let model = model();
    let content = stripes(16);
    let style = uniform(0.7, 16);

    let (reports, sink) = recorder();
    let transfer = ns::Transfer::builder()
        .iterations(45)
        .report_every(10)
        .build()
        .unwrap();
    let out = transfer.run(&model, &content, &style, Some(sink)).unwrap();

    let last = reports.lock().unwrap().last().unwrap().total();

    // score the returned image with the same weights the transfer used
    let pipeline = ns::InstrumentedPipeline::build(
        &model.network,
        &model.normalization,
        &style,
        &content,
        &ns::ProbeLayers::default(),
    )
    .unwrap();
    let mut objective =
        ns::session::TransferObjective::new(pipeline, 1e5, 1.0, 1000, None).unwrap();
    let image = ns::candle_core::Var::from_tensor(&out).unwrap();
    let loss = objective.evaluate(&image).unwrap().loss;

    assert!(loss <= last * (1.0 + 1e-5), "{} > {}", loss, last);
}

#[test]
fn network_is_reusable() {
    let model = model();
    let layer_count = model.network.layers().len();
    let content = stripes(16);
    let style = uniform(0.2, 16);

    let transfer = ns::Transfer::builder().iterations(5).build().unwrap();
    let a = transfer.run(&model, &content, &style, None).unwrap();
    let b = transfer.run(&model, &content, &style, None).unwrap();

    // no probes are left behind, so the second run starts from exactly the
    // same place as the first
    assert_eq!(model.network.layers().len(), layer_count);
    assert_eq!(model.network.feature_stages().unwrap().len(), layer_count);
    assert_eq!(values(&a), values(&b));
}

#[test]
fn unsupported_layers_fail_the_transfer() {
    let mut layers = model().network.layers().to_vec();
    layers.push(ns::Layer::Flatten);

    let dev = Device::Cpu;
    let model = ns::StyleModel::new(
        ns::Network::from_layers(layers),
        ns::Normalization::imagenet(&dev).unwrap(),
        dev,
    );

    let img = uniform(0.5, 16);
    let transfer = ns::Transfer::builder().build().unwrap();

    match transfer.run(&model, &img, &img, None) {
        Err(ns::Error::UnsupportedLayer(name)) => assert_eq!(name, "Flatten"),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("transfer should have failed"),
    }
}
