//! # MobileNet-SSD 動画物体検出ライブラリ
//!
//! このクレートは、動画のフレームをニューラルネットワークに流し込み、
//! 検出結果のバウンディングボックスをフレームに重ねて描画するためのRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **パイプラインの定義**: `XLinkIn -> NeuralNetwork -> XLinkOut` のようなノードの接続を記述します。
//! 2. **デバイスの実行**: パイプラインをワーカースレッドで実行し、ストリームごとのキューを提供します。
//! 3. **前処理**: フレームをリサイズし、平面 (CHW) のテンソルに変換します。
//! 4. **後処理**: SSDの出力を検出結果に変換し、フレームに描画します。
//!
//! ## Example
//! ```no_run
//! use video_mobilenet::config::DetectorConfig;
//! use video_mobilenet::detector::VideoDetector;
//! use video_mobilenet::sink::ImageDirSink;
//! use video_mobilenet::source::VideoFileSource;
//!
//! let mut detector = VideoDetector::new(DetectorConfig::default())?;
//! let mut source = VideoFileSource::open("construction_vest.mp4")?;
//! let mut sink = ImageDirSink::create("out")?;
//! let stats = detector.run(&mut source, &mut sink)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod detection_result;
pub mod detector;
pub mod device;
pub mod img_proc;
pub mod nn_data;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod source;
