//! ニューラルネットワークの入出力テンソルを運ぶメッセージのモジュール

use std::time::Instant;

use anyhow::{ensure, Context, Result};
use half::f16;
use tract_onnx::prelude::tract_ndarray::{ArrayD, IxDyn};

/// 各レイヤの先頭アドレスのアライメント (バイト)
const DATA_ALIGNMENT: usize = 64;

/// テンソルのデータ型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    Fp16,
    Int32,
}

impl DataType {
    /// 1要素あたりのバイト数を返します。
    pub fn size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::Fp16 => 2,
            DataType::Int32 => 4,
        }
    }
}

/// レイヤ (テンソル) の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// レイヤ名
    pub name: String,
    /// データ型
    pub data_type: DataType,
    /// 生データ中のオフセット (バイト)
    pub offset: usize,
    /// 要素数
    pub num_elements: usize,
    /// 各次元の大きさ
    pub dims: Vec<usize>,
    /// 各次元のストライド (バイト)
    pub strides: Vec<usize>,
}

impl TensorInfo {
    fn new(name: &str, data_type: DataType, offset: usize, dims: &[usize]) -> Self {
        let mut strides = vec![0; dims.len()];
        let mut acc = data_type.size();
        for (stride, dim) in strides.iter_mut().zip(dims).rev() {
            *stride = acc;
            acc *= dim;
        }
        Self {
            name: name.to_string(),
            data_type,
            offset,
            num_elements: dims.iter().product(),
            dims: dims.to_vec(),
            strides,
        }
    }

    /// レイヤが占めるバイト数
    pub fn byte_len(&self) -> usize {
        self.num_elements * self.data_type.size()
    }

    /// 次元数
    pub fn num_dimensions(&self) -> usize {
        self.dims.len()
    }
}

fn aligned(len: usize) -> usize {
    (len + DATA_ALIGNMENT - 1) / DATA_ALIGNMENT * DATA_ALIGNMENT
}

fn ensure_shape(name: &str, dims: &[usize], len: usize) -> Result<()> {
    ensure!(
        dims.iter().product::<usize>() == len,
        "tensor {} has {} elements, which does not match the shape {:?}",
        name,
        len,
        dims
    );
    Ok(())
}

fn fp16_bytes<T: Copy>(data: &[T], to_f16: fn(T) -> f16) -> Vec<u8> {
    data.iter().flat_map(|&v| to_f16(v).to_le_bytes()).collect()
}

/// 名前付きのテンソルとメタデータを保持するメッセージ
///
/// すべてのレイヤは1つの生データバッファに64バイト境界で並べて格納されます。
#[derive(Debug, Clone)]
pub struct NnData {
    data: Vec<u8>,
    tensors: Vec<TensorInfo>,
    sequence_num: i64,
    timestamp: Instant,
    timestamp_device: Option<Instant>,
}

impl Default for NnData {
    fn default() -> Self {
        Self::new()
    }
}

impl NnData {
    /// 空のメッセージを作成します。
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            tensors: Vec::new(),
            sequence_num: 0,
            timestamp: Instant::now(),
            timestamp_device: None,
        }
    }

    /// 残っているレイヤだけを詰め直します。
    fn compact(&mut self) {
        let old = std::mem::take(&mut self.data);
        for t in self.tensors.iter_mut() {
            let offset = aligned(self.data.len());
            self.data.resize(offset, 0);
            self.data
                .extend_from_slice(&old[t.offset..t.offset + t.byte_len()]);
            t.offset = offset;
        }
    }

    /// 生データをアライメントして追加し、レイヤ情報を登録します。
    /// 同名のレイヤがすでにある場合は、古いデータを取り除いて同じ位置に置き換えます。
    fn push_layer(
        &mut self,
        name: &str,
        data_type: DataType,
        bytes: &[u8],
        dims: &[usize],
    ) -> &mut Self {
        let replaced = self.tensors.iter().position(|t| t.name == name);
        if let Some(pos) = replaced {
            self.tensors.remove(pos);
            self.compact();
        }

        let offset = aligned(self.data.len());
        self.data.resize(offset, 0);
        self.data.extend_from_slice(bytes);

        let info = TensorInfo::new(name, data_type, offset, dims);
        match replaced {
            Some(pos) => self.tensors.insert(pos, info),
            None => self.tensors.push(info),
        }
        self
    }

    /// U8型のレイヤを設定します。
    ///
    /// # Args
    /// * `name` - レイヤ名
    /// * `data` - 格納するデータ
    pub fn set_layer_u8(&mut self, name: &str, data: &[u8]) -> &mut Self {
        self.push_layer(name, DataType::U8, data, &[data.len()])
    }

    /// FP16型のレイヤを設定します。値は半精度浮動小数点数に変換されます。
    ///
    /// # Args
    /// * `name` - レイヤ名
    /// * `data` - 格納するデータ
    pub fn set_layer_fp16(&mut self, name: &str, data: &[f32]) -> &mut Self {
        self.push_layer(name, DataType::Fp16, &fp16_bytes(data, f16::from_f32), &[data.len()])
    }

    /// f64のデータをFP16型のレイヤとして設定します。
    pub fn set_layer_f64(&mut self, name: &str, data: &[f64]) -> &mut Self {
        self.push_layer(name, DataType::Fp16, &fp16_bytes(data, f16::from_f64), &[data.len()])
    }

    /// INT32型のレイヤを設定します。
    ///
    /// # Args
    /// * `name` - レイヤ名
    /// * `data` - 格納するデータ
    pub fn set_layer_i32(&mut self, name: &str, data: &[i32]) -> &mut Self {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.push_layer(name, DataType::Int32, &bytes, &[data.len()])
    }

    /// 形状付きのU8型テンソルを追加します。
    ///
    /// # Args
    /// * `name` - テンソル名
    /// * `dims` - 各次元の大きさ (行優先)
    /// * `data` - 格納するデータ。要素数は `dims` の積と一致する必要があります
    pub fn add_tensor_u8(&mut self, name: &str, dims: &[usize], data: &[u8]) -> Result<&mut Self> {
        ensure_shape(name, dims, data.len())?;
        Ok(self.push_layer(name, DataType::U8, data, dims))
    }

    /// 形状付きのFP16型テンソルを追加します。
    pub fn add_tensor_fp16(&mut self, name: &str, dims: &[usize], data: &[f32]) -> Result<&mut Self> {
        ensure_shape(name, dims, data.len())?;
        Ok(self.push_layer(name, DataType::Fp16, &fp16_bytes(data, f16::from_f32), dims))
    }

    /// 形状付きのINT32型テンソルを追加します。
    pub fn add_tensor_i32(&mut self, name: &str, dims: &[usize], data: &[i32]) -> Result<&mut Self> {
        ensure_shape(name, dims, data.len())?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(self.push_layer(name, DataType::Int32, &bytes, dims))
    }

    /// 追加されたすべてのレイヤ名を返します。
    pub fn layer_names(&self) -> Vec<String> {
        self.tensors.iter().map(|t| t.name.clone()).collect()
    }

    /// すべてのレイヤ情報を返します。
    pub fn layers(&self) -> &[TensorInfo] {
        &self.tensors
    }

    /// 指定した名前のレイヤがあるか
    pub fn has_layer(&self, name: &str) -> bool {
        self.tensors.iter().any(|t| t.name == name)
    }

    /// 指定したレイヤの情報を返します。
    pub fn get_layer(&self, name: &str) -> Result<&TensorInfo> {
        self.tensors
            .iter()
            .find(|t| t.name == name)
            .with_context(|| format!("layer not found: {}", name))
    }

    /// 指定したレイヤのデータ型を返します。
    pub fn layer_data_type(&self, name: &str) -> Result<DataType> {
        Ok(self.get_layer(name)?.data_type)
    }

    fn first_layer(&self) -> Result<&TensorInfo> {
        self.tensors.first().context("NnData has no layers")
    }

    fn layer_bytes(&self, info: &TensorInfo, expected: DataType) -> Result<&[u8]> {
        ensure!(
            info.data_type == expected,
            "layer {} is {:?}, not {:?}",
            info.name,
            info.data_type,
            expected
        );
        self.data
            .get(info.offset..info.offset + info.byte_len())
            .with_context(|| format!("layer {} exceeds the raw buffer", info.name))
    }

    fn decode_u8(&self, info: &TensorInfo) -> Result<Vec<u8>> {
        Ok(self.layer_bytes(info, DataType::U8)?.to_vec())
    }

    fn decode_fp16(&self, info: &TensorInfo) -> Result<Vec<f32>> {
        Ok(self
            .layer_bytes(info, DataType::Fp16)?
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect())
    }

    fn decode_i32(&self, info: &TensorInfo) -> Result<Vec<i32>> {
        Ok(self
            .layer_bytes(info, DataType::Int32)?
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// U8型のレイヤのデータを取得します。
    pub fn get_layer_u8(&self, name: &str) -> Result<Vec<u8>> {
        self.decode_u8(self.get_layer(name)?)
    }

    /// FP16型のレイヤのデータをf32に変換して取得します。
    pub fn get_layer_fp16(&self, name: &str) -> Result<Vec<f32>> {
        self.decode_fp16(self.get_layer(name)?)
    }

    /// INT32型のレイヤのデータを取得します。
    pub fn get_layer_i32(&self, name: &str) -> Result<Vec<i32>> {
        self.decode_i32(self.get_layer(name)?)
    }

    /// 最初のレイヤのデータをU8として取得します。
    pub fn get_first_layer_u8(&self) -> Result<Vec<u8>> {
        self.decode_u8(self.first_layer()?)
    }

    /// 最初のレイヤのデータをFP16からf32に変換して取得します。
    pub fn get_first_layer_fp16(&self) -> Result<Vec<f32>> {
        self.decode_fp16(self.first_layer()?)
    }

    /// 最初のレイヤのデータをINT32として取得します。
    pub fn get_first_layer_i32(&self) -> Result<Vec<i32>> {
        self.decode_i32(self.first_layer()?)
    }

    /// U8型のテンソルを形状付きで取得します。
    pub fn get_tensor_u8(&self, name: &str) -> Result<ArrayD<u8>> {
        let info = self.get_layer(name)?;
        shaped(info, self.decode_u8(info)?)
    }

    /// FP16型のテンソルをf32に変換し、形状付きで取得します。
    ///
    /// # Return
    /// * `dims` の形をした配列
    pub fn get_tensor_fp16(&self, name: &str) -> Result<ArrayD<f32>> {
        let info = self.get_layer(name)?;
        shaped(info, self.decode_fp16(info)?)
    }

    /// INT32型のテンソルを形状付きで取得します。
    pub fn get_tensor_i32(&self, name: &str) -> Result<ArrayD<i32>> {
        let info = self.get_layer(name)?;
        shaped(info, self.decode_i32(info)?)
    }

    pub fn get_first_tensor_u8(&self) -> Result<ArrayD<u8>> {
        let info = self.first_layer()?;
        shaped(info, self.decode_u8(info)?)
    }

    pub fn get_first_tensor_fp16(&self) -> Result<ArrayD<f32>> {
        let info = self.first_layer()?;
        shaped(info, self.decode_fp16(info)?)
    }

    pub fn get_first_tensor_i32(&self) -> Result<ArrayD<i32>> {
        let info = self.first_layer()?;
        shaped(info, self.decode_i32(info)?)
    }

    pub fn sequence_num(&self) -> i64 {
        self.sequence_num
    }

    pub fn set_sequence_num(&mut self, sequence_num: i64) -> &mut Self {
        self.sequence_num = sequence_num;
        self
    }

    /// ホスト側のタイムスタンプ
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Instant) -> &mut Self {
        self.timestamp = timestamp;
        self
    }

    /// デバイスが結果を出力した時刻。ホストで作ったメッセージでは `None`
    pub fn timestamp_device(&self) -> Option<Instant> {
        self.timestamp_device
    }

    pub fn set_timestamp_device(&mut self, timestamp: Instant) -> &mut Self {
        self.timestamp_device = Some(timestamp);
        self
    }

    /// 生データバッファのサイズ (バイト)
    pub fn raw_len(&self) -> usize {
        self.data.len()
    }
}

fn shaped<T>(info: &TensorInfo, data: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(&info.dims), data)
        .with_context(|| format!("layer {} does not match its shape {:?}", info.name, info.dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_are_aligned() {
        let mut nn = NnData::new();
        nn.set_layer_u8("a", &[1, 2, 3]);
        nn.set_layer_fp16("b", &[0.5, -1.0]);

        let b = nn.get_layer("b").unwrap();
        assert_eq!(b.offset % DATA_ALIGNMENT, 0);
        assert_eq!(b.offset, 64);
        assert_eq!(nn.raw_len(), 64 + 4);
    }

    #[test]
    fn fp16_values_survive_conversion() {
        let mut nn = NnData::new();
        nn.set_layer_fp16("out", &[0.0, 0.75, -1.0, 0.5]);
        assert_eq!(nn.get_layer_fp16("out").unwrap(), vec![0.0, 0.75, -1.0, 0.5]);
        assert_eq!(nn.get_first_layer_fp16().unwrap().len(), 4);
    }

    #[test]
    fn fp16_rounds_to_half_precision() {
        let mut nn = NnData::new();
        nn.set_layer_fp16("out", &[0.1]);
        let v = nn.get_layer_fp16("out").unwrap()[0];
        assert!((v - 0.1).abs() < 1e-3);
        assert_ne!(v, 0.1);
    }

    #[test]
    fn first_layer_keeps_insertion_order() {
        let mut nn = NnData::new();
        nn.set_layer_i32("ids", &[7, -3]);
        nn.set_layer_u8("data", &[9]);
        assert_eq!(nn.get_first_layer_i32().unwrap(), vec![7, -3]);
        assert_eq!(nn.layer_names(), vec!["ids".to_string(), "data".to_string()]);
    }

    #[test]
    fn replacing_a_layer_keeps_its_position() {
        let mut nn = NnData::new();
        nn.set_layer_u8("data", &[1, 2]);
        nn.set_layer_u8("other", &[3]);
        nn.set_layer_u8("data", &[4, 5, 6]);

        assert_eq!(nn.layers().len(), 2);
        assert_eq!(nn.get_first_layer_u8().unwrap(), vec![4, 5, 6]);
    }

    #[test]
    fn wrong_type_and_missing_layers_are_errors() {
        let mut nn = NnData::new();
        assert!(nn.get_first_layer_fp16().is_err());
        nn.set_layer_u8("data", &[1]);
        assert!(nn.get_layer_fp16("data").is_err());
        assert!(nn.get_layer_u8("nope").is_err());
        assert_eq!(nn.layer_data_type("data").unwrap(), DataType::U8);
        assert!(nn.has_layer("data"));
        assert!(!nn.has_layer("nope"));
    }

    #[test]
    fn replacing_a_layer_drops_its_old_bytes() {
        let mut nn = NnData::new();
        nn.set_layer_u8("data", &[0; 300]);
        nn.set_layer_u8("other", &[7]);
        nn.set_layer_u8("data", &[1, 2]);

        assert_eq!(nn.raw_len(), 64 + 2);
        assert_eq!(nn.get_layer("other").unwrap().offset, 0);
        assert_eq!(nn.get_layer_u8("other").unwrap(), vec![7]);
        assert_eq!(nn.get_first_layer_u8().unwrap(), vec![1, 2]);
    }

    #[test]
    fn tensors_keep_their_shape() {
        let mut nn = NnData::new();
        let raw: Vec<f32> = (0..14).map(|v| v as f32).collect();
        nn.add_tensor_fp16("detection_out", &[1, 1, 2, 7], &raw).unwrap();

        let info = nn.get_layer("detection_out").unwrap();
        assert_eq!(info.num_elements, 14);
        assert_eq!(info.num_dimensions(), 4);
        assert_eq!(info.strides, vec![28, 28, 14, 2]);

        let t = nn.get_tensor_fp16("detection_out").unwrap();
        assert_eq!(t.shape(), &[1, 1, 2, 7]);
        assert_eq!(t[&[0, 0, 1, 0][..]], 7.);
        assert_eq!(nn.get_first_tensor_fp16().unwrap(), t);
    }

    #[test]
    fn tensor_shape_must_match_the_data() {
        let mut nn = NnData::new();
        assert!(nn.add_tensor_u8("data", &[3, 2], &[0; 5]).is_err());
        assert!(!nn.has_layer("data"));
        nn.add_tensor_i32("ids", &[2, 1], &[4, 5]).unwrap();
        assert_eq!(nn.get_tensor_i32("ids").unwrap().shape(), &[2, 1]);
        // set_layer_* は1次元のテンソルになる
        nn.set_layer_u8("flat", &[1, 2, 3]);
        assert_eq!(nn.get_tensor_u8("flat").unwrap().shape(), &[3]);
    }

    #[test]
    fn f64_layers_are_stored_as_fp16() {
        let mut nn = NnData::new();
        nn.set_layer_f64("out", &[0.5, -2.0]);
        assert_eq!(nn.layer_data_type("out").unwrap(), DataType::Fp16);
        assert_eq!(nn.get_layer_fp16("out").unwrap(), vec![0.5, -2.0]);
    }

    #[test]
    fn device_timestamp_is_unset_on_host_messages() {
        let mut nn = NnData::new();
        assert!(nn.timestamp_device().is_none());
        let t = Instant::now();
        nn.set_timestamp_device(t);
        assert_eq!(nn.timestamp_device(), Some(t));
    }
}
