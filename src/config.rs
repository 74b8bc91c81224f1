//! 検出処理の設定

use std::path::PathBuf;
use std::time::Duration;

use image::Rgb;

use crate::backend::Normalization;
use crate::img_proc::ColorOrder;

/// [`crate::detector::VideoDetector`] の設定
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// モデルのパス (`.onnx` または `.tar.gz`)
    pub model_path: PathBuf,
    /// ニューラルネットワークの入力の幅
    pub input_width: u32,
    /// ニューラルネットワークの入力の高さ
    pub input_height: u32,
    /// 入力レイヤ名
    pub input_layer: String,
    /// 入力のチャネル順
    pub color_order: ColorOrder,
    pub normalization: Normalization,
    /// 入力ストリーム名
    pub input_stream: String,
    /// 出力ストリーム名
    pub output_stream: String,
    /// 出力キューの最大メッセージ数
    pub output_queue_size: usize,
    /// 出力キューが満杯のとき、デバイスを待たせるか
    pub output_queue_blocking: bool,
    /// コンフィデンスの閾値
    pub confidence_threshold: f32,
    /// 推論スレッド数
    pub num_inference_threads: usize,
    /// 指定した場合、各フレームで推論結果を最大この時間だけ待ちます
    pub wait_for_result: Option<Duration>,
    /// 処理する最大フレーム数
    pub max_frames: Option<u64>,
    /// バウンディングボックスの色
    pub box_color: Rgb<u8>,
    /// バウンディングボックスの線の太さ
    pub box_thickness: u32,
    /// ラベルのフォント (指定しない場合はラベルを描画しません)
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    /// クラス名
    pub labels: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/mobilenet.onnx"),
            input_width: 300,
            input_height: 300,
            input_layer: "data".to_string(),
            color_order: ColorOrder::Bgr,
            normalization: Normalization::default(),
            input_stream: "in_nn".to_string(),
            output_stream: "nn".to_string(),
            output_queue_size: 4,
            output_queue_blocking: false,
            confidence_threshold: 0.5,
            num_inference_threads: 1,
            wait_for_result: None,
            max_frames: None,
            box_color: Rgb([0, 0, 255]),
            box_thickness: 2,
            font_path: None,
            font_size: 16.,
            labels: Vec::new(),
        }
    }
}

/// MobileNet-SSD (PASCAL VOC) のクラス名
pub const VOC_LABELS: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// ラベルファイル (1行1クラス) を読み込みます。
///
/// 行番号がクラス番号になるため、空行も空の名前として残します。
pub fn read_labels<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Vec<String>> {
    use anyhow::Context;

    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("can't read labels {}", path.display()))?;
    Ok(text.lines().map(|l| l.trim().to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_video_mobilenet_demo() {
        let c = DetectorConfig::default();
        assert_eq!((c.input_width, c.input_height), (300, 300));
        assert_eq!(c.input_layer, "data");
        assert_eq!(c.output_queue_size, 4);
        assert!(!c.output_queue_blocking);
        assert_eq!(c.confidence_threshold, 0.5);
        assert_eq!(c.box_color, Rgb([0, 0, 255]));
        assert_eq!(c.box_thickness, 2);
    }

    #[test]
    fn blank_label_lines_keep_class_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "background\n\n person \r\nvest\n").unwrap();
        assert_eq!(read_labels(&path).unwrap(), vec!["background", "", "person", "vest"]);
    }
}
