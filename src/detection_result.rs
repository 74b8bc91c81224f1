//! 物体検出の結果を処理するモジュール

/// SSDの検出結果1件あたりの要素数
/// `[image_id, label, confidence, x_min, y_min, x_max, y_max]`
pub const SSD_RECORD_LEN: usize = 7;

/// 送られてきた生の検出結果を保持するための構造体
///
/// 座標は画像サイズで正規化された <0..1> の値です。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionData {
    /// バッチ内の画像番号
    pub image_id: i32,
    /// クラス
    pub label: u16,
    /// コンフィデンス
    pub confidence: f32,
    /// バウンディングボックス左上のx
    pub x1: f32,
    /// バウンディングボックス左上のy
    pub y1: f32,
    /// バウンディングボックス右下のx
    pub x2: f32,
    /// バウンディングボックス右下のy
    pub y2: f32,
}

/// ピクセル座標系のバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.x2.abs_diff(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.abs_diff(self.y1)
    }
}

impl DetectionData {
    /// SSDの出力1件から新しいDetectionDataを作成します。
    ///
    /// # Args
    /// * `record` - 7要素の検出結果
    pub fn from_record(record: &[f32]) -> Self {
        Self {
            image_id: record[0] as i32,
            label: record[1].max(0.) as u16,
            confidence: record[2],
            x1: record[3],
            y1: record[4],
            x2: record[5],
            y2: record[6],
        }
    }

    /// 正規化された座標をフレームのピクセル座標に変換します。
    /// xはフレームの幅、yはフレームの高さでスケールし、0方向に切り捨てます。
    /// フレームから大きく外れた値は `[-サイズ, 2*サイズ]` に収め、NaN は 0 とします。
    ///
    /// # Args
    /// * `width` - フレームの幅
    /// * `height` - フレームの高さ
    pub fn frame_norm(&self, width: u32, height: u32) -> PixelBox {
        PixelBox {
            x1: to_pixel(self.x1, width),
            y1: to_pixel(self.y1, height),
            x2: to_pixel(self.x2, width),
            y2: to_pixel(self.y2, height),
        }
    }
}

fn to_pixel(v: f32, size: u32) -> i32 {
    let size = size as f32;
    let p = v * size;
    if p.is_nan() {
        return 0;
    }
    p.clamp(-size, 2. * size) as i32
}

/// SSDの DetectionOutput 層の出力を検出結果に変換します。
///
/// 最後の検出結果の後には image_id が -1 のレコードが続きます。
/// 終端レコードがない場合は、すべての完全なレコードを使います。
///
/// # Args
/// * `raw` - 出力層の値 (7要素ずつ並んだもの)
/// * `threshold` - コンフィデンスの閾値。これより大きいものだけを残します
///
/// # Return
/// * 閾値を超えた検出結果
pub fn parse_ssd_output(raw: &[f32], threshold: f32) -> Vec<DetectionData> {
    raw.chunks_exact(SSD_RECORD_LEN)
        .take_while(|record| record[0] != -1.)
        .filter(|record| record[2] > threshold)
        .map(DetectionData::from_record)
        .collect()
}
