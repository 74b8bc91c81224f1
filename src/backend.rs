//! 推論バックエンドのモジュール
//!
//! NeuralNetwork ノードは [`NeuralNetworkBackend`] を通して推論を実行します。
//! 標準のバックエンドは ONNX モデルを tract で実行する [`OnnxBackend`] です。

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use tract_onnx::prelude::*;

use crate::detection_result::SSD_RECORD_LEN;
use crate::nn_data::NnData;

/// 推論を実行するバックエンド
pub trait NeuralNetworkBackend: Send {
    /// 入力メッセージに対して推論を実行し、結果のメッセージを返します。
    fn infer(&mut self, input: &NnData) -> Result<NnData>;
}

impl<F> NeuralNetworkBackend for F
where
    F: FnMut(&NnData) -> Result<NnData> + Send,
{
    fn infer(&mut self, input: &NnData) -> Result<NnData> {
        self(input)
    }
}

/// U8入力をf32に変換するときの正規化 `(v - mean) * scale`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: f32,
    pub scale: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        // MobileNet-SSD の学習時の前処理
        Self {
            mean: 127.5,
            scale: 1. / 127.5,
        }
    }
}

/// [`OnnxBackend`] の設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnnxOptions {
    /// 入力の幅
    pub input_width: usize,
    /// 入力の高さ
    pub input_height: usize,
    pub normalization: Normalization,
}

impl Default for OnnxOptions {
    fn default() -> Self {
        Self {
            input_width: 300,
            input_height: 300,
            normalization: Normalization::default(),
        }
    }
}

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const DEFAULT_OUTPUT_NAME: &str = "detection_out";

/// ONNX モデルを tract で実行するバックエンド
pub struct OnnxBackend {
    plan: OnnxPlan,
    options: OnnxOptions,
    output_name: String,
}

impl OnnxBackend {
    /// モデルを読み込みます。
    ///
    /// # Args
    /// * `path` - `.onnx` ファイル、または `.onnx` を1つ含む `.tar.gz` アーカイブへのパス
    /// * `options` - 入力サイズと正規化の設定
    pub fn load<P: AsRef<Path>>(path: P, options: OnnxOptions) -> Result<Self> {
        let path = path.as_ref();
        let bytes = read_model_bytes(path)?;
        info!("loading model: {} ({} bytes)", path.display(), bytes.len());

        let proto = tract_onnx::onnx()
            .proto_model_for_read(&mut Cursor::new(bytes))
            .with_context(|| format!("failed to parse ONNX model: {}", path.display()))?;
        Self::from_proto(&proto, options)
    }

    /// 読み込み済みのONNXモデルからバックエンドを作成します。
    pub fn from_proto(proto: &tract_onnx::pb::ModelProto, options: OnnxOptions) -> Result<Self> {
        let model = tract_onnx::onnx().model_for_proto_model(proto)?;
        let output_name = output_layer_name(&model)?;
        debug!("model output layer: {}", output_name);

        let shape = [1, 3, options.input_height, options.input_width];
        let plan = model
            .with_input_fact(0, f32::fact(shape).into())?
            .into_optimized()?
            .into_runnable()?;
        Ok(Self {
            plan,
            options,
            output_name,
        })
    }

    /// 結果のレイヤ名 (モデルの出力名)
    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

/// モデルの最初の出力の名前。名前がない場合は `detection_out`
fn output_layer_name(model: &InferenceModel) -> Result<String> {
    let name = model.output_outlets()?.first().map(|outlet| {
        model
            .outlet_label(*outlet)
            .map(str::to_string)
            .unwrap_or_else(|| model.node(outlet.node).name.clone())
    });
    Ok(name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string()))
}

/// 終端レコードを含めた結果テンソルの形状
///
/// モデルの出力が `[.., N, 7]` の形 (バッチ1) であれば先頭の次元を保ち、
/// それ以外は `[1, 1, records, 7]` とします。
fn ssd_dims(shape: &[usize], records: usize) -> Vec<usize> {
    match shape {
        [lead @ .., _, last]
            if *last == SSD_RECORD_LEN && lead.iter().product::<usize>() == 1 =>
        {
            lead.iter().copied().chain([records, SSD_RECORD_LEN]).collect()
        }
        _ => vec![1, 1, records, SSD_RECORD_LEN],
    }
}

impl NeuralNetworkBackend for OnnxBackend {
    fn infer(&mut self, input: &NnData) -> Result<NnData> {
        let planar = input.get_first_layer_u8()?;
        let (h, w) = (self.options.input_height, self.options.input_width);
        ensure!(
            planar.len() == 3 * h * w,
            "input layer has {} elements, the model expects 3x{}x{}",
            planar.len(),
            h,
            w
        );

        let Normalization { mean, scale } = self.options.normalization;
        let data: Vec<f32> = planar.iter().map(|&v| (f32::from(v) - mean) * scale).collect();
        let tensor: Tensor = tract_ndarray::Array4::from_shape_vec((1, 3, h, w), data)?.into();

        let outputs = self.plan.run(tvec!(tensor.into()))?;
        let output = outputs.first().context("model produced no output")?;
        let mut flat: Vec<f32> = output.to_array_view::<f32>()?.iter().copied().collect();
        append_terminator(&mut flat);
        let dims = ssd_dims(output.shape(), flat.len() / SSD_RECORD_LEN);

        let mut result = NnData::new();
        result.add_tensor_fp16(&self.output_name, &dims, &flat)?;
        Ok(result)
    }
}

/// SSDの出力の末尾に終端レコード (image_id = -1) を追加します。
pub fn append_terminator(flat: &mut Vec<f32>) {
    flat.truncate(flat.len() / SSD_RECORD_LEN * SSD_RECORD_LEN);
    flat.push(-1.);
    flat.extend(std::iter::repeat(0.).take(SSD_RECORD_LEN - 1));
}

fn is_archive(path: &Path) -> bool {
    let name = path.file_name().and_then(OsStr::to_str).unwrap_or("");
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// モデルのバイト列を読み込みます。
///
/// gzipアーカイブの場合は、拡張子が `.onnx` のファイルを1つだけ含んでいる必要があります。
pub fn read_model_bytes(path: &Path) -> Result<Vec<u8>> {
    ensure!(path.exists(), "model not found: {}", path.display());
    if !is_archive(path) {
        return std::fs::read(path).with_context(|| format!("can't read {}", path.display()));
    }

    let file = File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut found: Option<Vec<u8>> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        if entry_path.extension() != Some(OsStr::new("onnx")) {
            debug!("skipping archive member: {}", entry_path.display());
            continue;
        }
        if found.is_some() {
            bail!("{} contains more than one .onnx model", path.display());
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        found = Some(buf);
    }
    found.with_context(|| format!("{} contains no .onnx model", path.display()))
}
