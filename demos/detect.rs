use std::env;

use blazepalm::{
    detector::Resources,
    timer::FpsCounter,
    ImageFrame, PalmDetector,
};

fn main() -> anyhow::Result<()> {
    blazepalm::init_logger!();

    let mut args = env::args().skip(1);
    let (model_path, image_path) = match (args.next(), args.next()) {
        (Some(model), Some(image)) => (model, image),
        _ => anyhow::bail!("usage: detect <model.onnx> <image>"),
    };

    let mut detector = PalmDetector::new(Resources::from_model_path(&model_path)?)?;
    log::info!(
        "loaded {model_path}: {}px input, {}",
        detector.image_size(),
        if detector.is_nchw() { "NCHW" } else { "NHWC" },
    );

    let frame = ImageFrame::from(image::open(&image_path)?);

    let mut fps = FpsCounter::new("palm detection");
    detector.process_image(&frame)?;
    fps.tick_with(detector.timers());

    for det in detector.detections() {
        println!(
            "palm at ({:.3}, {:.3}), {:.3}x{:.3}, score {:.2}, rotation {:.1}°",
            det.center[0],
            det.center[1],
            det.extent[0],
            det.extent[1],
            det.score,
            det.rotation_angle().to_degrees(),
        );
    }

    detector.close();
    Ok(())
}
