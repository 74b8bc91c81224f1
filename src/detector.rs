//! 動画のフレームをニューラルネットワークに流し、検出結果を描画するモジュール

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::RgbImage;
use log::{debug, info};
use rusttype::Font;

use crate::backend::{NeuralNetworkBackend, OnnxBackend, OnnxOptions};
use crate::config::DetectorConfig;
use crate::detection_result::{parse_ssd_output, DetectionData};
use crate::device::Device;
use crate::img_proc::{self, LabelStyle};
use crate::nn_data::NnData;
use crate::pipeline::{NeuralNetwork, NodeId, Pipeline};
use crate::queue::DataQueue;
use crate::sink::FrameSink;
use crate::source::FrameSource;

/// 処理の統計
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunStats {
    /// 処理したフレーム数
    pub frames: u64,
    /// 受信した推論結果の数
    pub results: u64,
    pub elapsed: Duration,
}

impl RunStats {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0. {
            self.frames as f64 / secs
        } else {
            0.
        }
    }
}

/// `XLinkIn -> NeuralNetwork -> XLinkOut` のパイプラインを作成します。
pub fn build_pipeline(config: &DetectorConfig) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new();

    // ニューラルネットワークへの入力
    let xin_nn = pipeline.create_xlink_in();
    pipeline.xlink_in_mut(xin_nn)?.set_stream_name(&config.input_stream);

    // フレームから検出を行うニューラルネットワーク
    let detection_nn = pipeline.create_neural_network();
    pipeline
        .neural_network_mut(detection_nn)?
        .set_blob_path(&config.model_path)
        .set_num_inference_threads(config.num_inference_threads);
    pipeline.link(xin_nn, detection_nn)?;

    // 検出結果の出力
    let xout_nn = pipeline.create_xlink_out();
    pipeline.xlink_out_mut(xout_nn)?.set_stream_name(&config.output_stream);
    pipeline.link(detection_nn, xout_nn)?;

    Ok(pipeline)
}

/// 動画から物体を検出し、バウンディングボックスを描画する構造体
pub struct VideoDetector {
    config: DetectorConfig,
    q_in: DataQueue<NnData>,
    q_nn: DataQueue<NnData>,
    device: Device,
    font: Option<Font<'static>>,
    /// 最新の推論結果。新しい結果が届くまで描画し続けます
    detections: Vec<DetectionData>,
}

impl VideoDetector {
    /// ONNX モデルを読み込んで検出器を作成します。
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let options = OnnxOptions {
            input_width: config.input_width as usize,
            input_height: config.input_height as usize,
            normalization: config.normalization,
        };
        Self::with_backend_factory(config, move |_, nn| {
            let path = nn.blob_path.as_ref().context("NeuralNetwork has no blob path")?;
            Ok(Box::new(OnnxBackend::load(path, options)?) as Box<dyn NeuralNetworkBackend>)
        })
    }

    /// 任意のバックエンドで検出器を作成します。
    pub fn with_backend_factory<F>(config: DetectorConfig, factory: F) -> Result<Self>
    where
        F: FnMut(NodeId, &NeuralNetwork) -> Result<Box<dyn NeuralNetworkBackend>>,
    {
        let pipeline = build_pipeline(&config)?;
        let device = Device::with_backend_factory(pipeline, factory)?;

        let q_in = device.get_input_queue(&config.input_stream)?;
        let q_nn = device.get_output_queue(
            &config.output_stream,
            config.output_queue_size,
            config.output_queue_blocking,
        )?;

        let font = match &config.font_path {
            Some(path) => Some(img_proc::load_font(path)?),
            None => None,
        };

        Ok(Self {
            config,
            q_in,
            q_nn,
            device,
            font,
            detections: Vec::new(),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// 現在描画している検出結果
    pub fn detections(&self) -> &[DetectionData] {
        &self.detections
    }

    /// フレームをニューラルネットワークの入力メッセージに変換します。
    pub fn make_input(&self, frame: &RgbImage, seq: i64) -> Result<NnData> {
        let planar = img_proc::to_planar(
            frame,
            self.config.input_width,
            self.config.input_height,
            self.config.color_order,
        )?;
        let mut nn_data = NnData::new();
        nn_data
            .set_layer_u8(&self.config.input_layer, &planar)
            .set_sequence_num(seq);
        Ok(nn_data)
    }

    fn receive_result(&self) -> Result<Option<NnData>> {
        match self.config.wait_for_result {
            Some(timeout) => self.q_nn.get_timeout(timeout),
            None => self.q_nn.try_get(),
        }
    }

    /// 1フレームを処理します。
    ///
    /// フレームを送信し、推論結果が届いていれば検出結果を更新して、フレームに描画します。
    ///
    /// # Args
    /// * `frame` - 描画先のフレーム (in-place)
    /// * `seq` - フレーム番号
    ///
    /// # Return
    /// * 新しい推論結果を受信したか
    pub fn process_frame(&mut self, frame: &mut RgbImage, seq: i64) -> Result<bool> {
        let nn_data = self.make_input(frame, seq)?;
        self.q_in.send(nn_data)?;

        let received = match self.receive_result()? {
            Some(in_nn) => {
                let raw = in_nn.get_first_layer_fp16()?;
                self.detections = parse_ssd_output(&raw, self.config.confidence_threshold);
                debug!(
                    "frame {}: result for frame {}, {} detections",
                    seq,
                    in_nn.sequence_num(),
                    self.detections.len()
                );
                true
            }
            None => false,
        };

        self.draw(frame);
        Ok(received)
    }

    /// 現在の検出結果をフレームに描画します。
    pub fn draw(&self, frame: &mut RgbImage) {
        let (w, h) = frame.dimensions();
        let items: Vec<_> = self
            .detections
            .iter()
            .map(|d| (*d, d.frame_norm(w, h)))
            .collect();
        let boxes: Vec<_> = items.iter().map(|(_, b)| *b).collect();
        img_proc::draw_bbox(frame, &boxes, self.config.box_color, self.config.box_thickness);

        if let Some(font) = &self.font {
            let style = LabelStyle {
                font,
                font_size: self.config.font_size,
                labels: &self.config.labels,
                bg_color: self.config.box_color,
            };
            img_proc::draw_labels(frame, &items, &style);
        }
    }

    /// 読み込み元が終わるか、最大フレーム数に達するまでフレームを処理します。
    pub fn run<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<RunStats>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let start = Instant::now();
        let mut stats = RunStats::default();

        while self.config.max_frames.map_or(true, |max| stats.frames < max) {
            let Some(mut frame) = source.next_frame()? else {
                break;
            };
            let t = Instant::now();
            if self.process_frame(&mut frame, stats.frames as i64)? {
                stats.results += 1;
            }
            sink.show(&frame)?;
            stats.frames += 1;

            let ms = t.elapsed().as_secs_f64() * 1000.;
            debug!("Processing time:{:.03}ms, {:.1}FPS", ms, 1000. / ms);
        }
        sink.finish()?;

        stats.elapsed = start.elapsed();
        info!(
            "{} frames, {} results, {:.1}FPS",
            stats.frames,
            stats.results,
            stats.fps()
        );
        Ok(stats)
    }
}
