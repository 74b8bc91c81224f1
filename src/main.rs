use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use video_mobilenet::config::{read_labels, DetectorConfig, VOC_LABELS};
use video_mobilenet::detector::VideoDetector;
use video_mobilenet::img_proc::ColorOrder;
use video_mobilenet::sink::{sink_for_path, FrameSink, NullSink};
use video_mobilenet::source::{FrameSource, ImageSequenceSource, VideoFileSource};

#[derive(Parser)]
#[command(name = "video_mobilenet")]
#[command(about = "Stream video frames through a MobileNet-SSD model and draw the detections")]
struct Cli {
    /// Path to the model (.onnx, or a .tar.gz holding one .onnx)
    #[arg(value_name = "MODEL", default_value = "models/mobilenet.onnx")]
    model: PathBuf,

    /// Input video file
    #[arg(long, value_name = "FILE")]
    video: Option<PathBuf>,

    /// Read frames from a directory of images instead of a video
    #[arg(long, value_name = "DIR", conflicts_with = "video")]
    images: Option<PathBuf>,

    /// Capture frames from a V4L2 camera
    #[cfg(feature = "camera")]
    #[arg(long, value_name = "INDEX", conflicts_with_all = ["video", "images"])]
    camera: Option<usize>,

    /// Where to write annotated frames: a video file (.mp4, .mkv, .avi, .mov) or a directory
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Frame rate of the output video
    #[arg(long, default_value_t = 30.)]
    fps: f32,

    /// Keep detections whose confidence is above this value
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Wait up to this many milliseconds for each frame's result instead of polling
    #[arg(long, value_name = "MS")]
    sync_ms: Option<u64>,

    /// Channel order of the network input
    #[arg(long, value_enum, default_value_t = ColorOrder::Bgr)]
    color_order: ColorOrder,

    /// Number of inference threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Bounding box line thickness
    #[arg(long, default_value_t = 2)]
    thickness: u32,

    /// Font for drawing class labels (labels are drawn only when set)
    #[arg(long, value_name = "TTF")]
    font: Option<PathBuf>,

    /// Label font size
    #[arg(long, default_value_t = 16.)]
    font_size: f32,

    /// Class names, one per line
    #[arg(long, value_name = "FILE", conflicts_with = "voc_labels")]
    labels: Option<PathBuf>,

    /// Use the PASCAL VOC class names
    #[arg(long)]
    voc_labels: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> Result<DetectorConfig> {
        let labels = match &self.labels {
            Some(path) => read_labels(path)?,
            None if self.voc_labels => VOC_LABELS.iter().map(|s| s.to_string()).collect(),
            None => Vec::new(),
        };
        Ok(DetectorConfig {
            model_path: self.model.clone(),
            color_order: self.color_order,
            confidence_threshold: self.threshold,
            num_inference_threads: self.threads,
            wait_for_result: self.sync_ms.map(Duration::from_millis),
            max_frames: self.max_frames,
            box_thickness: self.thickness,
            font_path: self.font.clone(),
            font_size: self.font_size,
            labels,
            ..DetectorConfig::default()
        })
    }

    fn open_source(&self) -> Result<Box<dyn FrameSource>> {
        #[cfg(feature = "camera")]
        {
            if let Some(index) = self.camera {
                let camera = video_mobilenet::source::CameraSource::new(index, 640, 480);
                return Ok(Box::new(camera));
            }
        }
        if let Some(dir) = &self.images {
            return Ok(Box::new(ImageSequenceSource::open(dir)?));
        }
        let video = self
            .video
            .clone()
            .unwrap_or_else(|| PathBuf::from("construction_vest.mp4"));
        Ok(Box::new(VideoFileSource::open(video)?))
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = args.to_config()?;
    info!("model: {}", config.model_path.display());
    let mut detector = VideoDetector::new(config)?;

    let mut source = args.open_source()?;
    let mut sink: Box<dyn FrameSink> = match &args.output {
        Some(path) => sink_for_path(path, args.fps)?,
        None => Box::new(NullSink::default()),
    };

    let stats = detector.run(source.as_mut(), sink.as_mut())?;
    let t = stats.elapsed.as_secs_f64();
    println!(
        "Processed {} frames ({} results) in {:.03}s, {:.1}FPS",
        stats.frames,
        stats.results,
        t,
        stats.fps()
    );

    Ok(())
}
