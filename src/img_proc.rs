//! ニューラルネットワークの入力を作る前処理と、検出結果の描画に関する画像処理モジュール

use std::num::NonZeroU32;
use std::path::Path;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

use crate::detection_result::{DetectionData, PixelBox};

/// 平面化するときのチャネル順
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ColorOrder {
    Bgr,
    Rgb,
}

impl ColorOrder {
    /// 出力チャネルごとの、RGB画像内のチャネル番号
    fn source_channels(self) -> [usize; 3] {
        match self {
            ColorOrder::Bgr => [2, 1, 0],
            ColorOrder::Rgb => [0, 1, 2],
        }
    }
}

/// 画像をバイリニア補間でリサイズし、RGBのピクセル列を返します。
///
/// # Args
/// * `img` - リサイズする画像
/// * `width`, `height` - リサイズ後のサイズ
pub fn resize_rgb(img: &RgbImage, width: u32, height: u32) -> Result<Vec<u8>> {
    if img.dimensions() == (width, height) {
        return Ok(img.as_raw().clone());
    }
    let src_w = NonZeroU32::new(img.width()).context("image width is zero")?;
    let src_h = NonZeroU32::new(img.height()).context("image height is zero")?;
    let dst_w = NonZeroU32::new(width).context("target width is zero")?;
    let dst_h = NonZeroU32::new(height).context("target height is zero")?;

    let src = fr::Image::from_vec_u8(src_w, src_h, img.as_raw().clone(), fr::PixelType::U8x3)?;
    let mut dst = fr::Image::new(dst_w, dst_h, src.pixel_type());

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer.resize(&src.view(), &mut dst.view_mut())?;
    Ok(dst.buffer().to_vec())
}

/// 画像をリサイズし、HWCの並びをCHW (平面) の並びに変換します。
///
/// # Args
/// * `img` - 入力画像
/// * `width`, `height` - ニューラルネットワークの入力サイズ
/// * `order` - 出力のチャネル順
///
/// # Return
/// * `3 * width * height` 要素のデータ
pub fn to_planar(img: &RgbImage, width: u32, height: u32, order: ColorOrder) -> Result<Vec<u8>> {
    let resized = resize_rgb(img, width, height)?;
    let plane = (width * height) as usize;
    let channels = order.source_channels();

    let mut planar = vec![0u8; plane * 3];
    for (i, px) in resized.chunks_exact(3).enumerate() {
        for (c, &src) in channels.iter().enumerate() {
            planar[c * plane + i] = px[src];
        }
    }
    Ok(planar)
}

/// 画像上に水平または垂直な線を描画します。
///
/// # Args
///
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(img: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, thickness: u32, color: Rgb<u8>) {
    // 画像の外側は太さの分だけ残して切り詰める
    let margin = thickness as i32;
    let (img_w, img_h) = (img.width() as i32, img.height() as i32);
    let cx = |x: i32| x.clamp(-margin, img_w.saturating_add(margin));
    let cy = |y: i32| y.clamp(-margin, img_h.saturating_add(margin));
    let (x1, y1, x2, y2) = (cx(x1), cy(y1), cx(x2), cy(y2));

    let half = margin / 2;
    let (bx, by) = (x1.min(x2).saturating_sub(half), y1.min(y2).saturating_sub(half));

    let (w, h) = if x1 == x2 {
        (thickness, y2.abs_diff(y1).saturating_add(thickness))
    } else {
        (x2.abs_diff(x1).saturating_add(thickness), thickness)
    };

    let rect = Rect::at(bx, by).of_size(w, h);
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上に矩形を描画します。
fn draw_rect(img: &mut RgbImage, b: &PixelBox, thickness: u32, color: Rgb<u8>) {
    draw_line(img, b.x1, b.y1, b.x1, b.y2, thickness, color);
    draw_line(img, b.x1, b.y2, b.x2, b.y2, thickness, color);
    draw_line(img, b.x1, b.y1, b.x2, b.y1, thickness, color);
    draw_line(img, b.x2, b.y1, b.x2, b.y2, thickness, color);
}

/// 画像上にバウンディングボックスを描画します。
///
/// # Args
///
/// * `img` - バウンディングボックスを描画する画像 (in-place)
/// * `boxes` - ピクセル座標のバウンディングボックス
/// * `color` - 線の色
/// * `thickness` - 線の太さ (1から画像の長辺までに収めます)
pub fn draw_bbox(img: &mut RgbImage, boxes: &[PixelBox], color: Rgb<u8>, thickness: u32) {
    let thickness = thickness.clamp(1, img.width().max(img.height()).max(1));
    for b in boxes {
        draw_rect(img, b, thickness, color);
    }
}

/// フォントファイルを読み込みます。
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<Font<'static>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("can't read font {}", path.display()))?;
    Font::try_from_vec(bytes).with_context(|| format!("invalid font: {}", path.display()))
}

/// ラベル表示の設定
pub struct LabelStyle<'a> {
    pub font: &'a Font<'static>,
    pub font_size: f32,
    /// クラス名 (インデックスがクラス番号)
    pub labels: &'a [String],
    pub bg_color: Rgb<u8>,
}

/// 画像上にラベルを描画します。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `x1`, `y1` - ラベルの左下の座標
/// * `style` - フォントと背景色
/// * `text` - ラベルに表示するテキスト
fn draw_label(img: &mut RgbImage, x1: i32, y1: i32, style: &LabelStyle, text: &str) {
    let label_h = style.font_size;
    let label_y = y1 as f32 - label_h;

    let pad = 6.;
    let scale = Scale::uniform(label_h);
    let (text_w, _) = text_size(scale, style.font, text);
    let v_metrics = style.font.v_metrics(scale);
    let text_h = v_metrics.ascent - v_metrics.descent + v_metrics.line_gap;

    let rect = Rect::at(x1, label_y as i32).of_size((text_w as f32 + pad * 2.) as u32, label_h as u32);
    draw_filled_rect_mut(img, rect, style.bg_color);

    let text_y = label_y + (label_h - text_h) / 2.;
    let bg = style.bg_color;
    let text_color = if (bg[0] as i32 + bg[1] as i32 + bg[2] as i32) < 382 {
        Rgb([255u8, 255, 255])
    } else {
        Rgb([0u8, 0, 0])
    };
    draw_text_mut(img, text_color, (x1 as f32 + pad) as i32, text_y as i32, scale, style.font, text);
}

/// 検出結果のクラス名とコンフィデンスを描画します。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `detections` - 検出結果とピクセル座標のバウンディングボックスの組
/// * `style` - ラベル表示の設定
pub fn draw_labels(img: &mut RgbImage, detections: &[(DetectionData, PixelBox)], style: &LabelStyle) {
    if style.font_size < 1. {
        return;
    }
    for (d, b) in detections {
        let name = style
            .labels
            .get(d.label as usize)
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| d.label.to_string());
        let text = format!("{}: {:.2}", name, d.confidence);
        draw_label(img, b.x1.min(b.x2), b.y1.min(b.y2), style, &text);
    }
}
