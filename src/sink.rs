//! 描画したフレームの出力先のモジュール

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;
use log::info;

/// フレームの出力先
pub trait FrameSink {
    /// フレームを表示 (出力) します。
    fn show(&mut self, frame: &RgbImage) -> Result<()>;

    /// 出力を終えます。
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// フレームを捨てる出力先
#[derive(Debug, Default)]
pub struct NullSink {
    pub frames: u64,
}

impl FrameSink for NullSink {
    fn show(&mut self, _frame: &RgbImage) -> Result<()> {
        self.frames += 1;
        Ok(())
    }
}

/// フレームを連番のPNGファイルとして保存する出力先
pub struct ImageDirSink {
    dir: PathBuf,
    index: u64,
}

impl ImageDirSink {
    /// 出力ディレクトリを作成します。
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("can't create {}", dir.display()))?;
        Ok(Self { dir, index: 0 })
    }

    /// `index` 番目のフレームのファイルパス
    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{:06}.png", index))
    }
}

impl FrameSink for ImageDirSink {
    fn show(&mut self, frame: &RgbImage) -> Result<()> {
        let path = self.frame_path(self.index);
        frame
            .save(&path)
            .with_context(|| format!("can't save {}", path.display()))?;
        self.index += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        info!("saved {} frames to {}", self.index, self.dir.display());
        Ok(())
    }
}

struct Encoder {
    child: Child,
    stdin: ChildStdin,
    width: u32,
    height: u32,
}

/// `ffmpeg` の子プロセスで動画ファイルにエンコードする出力先
///
/// エンコーダは最初のフレームのサイズで起動します。
pub struct VideoFileSink {
    path: PathBuf,
    fps: f32,
    encoder: Option<Encoder>,
}

impl VideoFileSink {
    pub fn new<P: AsRef<Path>>(path: P, fps: f32) -> Result<Self> {
        ensure!(fps > 0., "fps must be positive: {}", fps);
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            fps,
            encoder: None,
        })
    }

    fn spawn_encoder(&self, width: u32, height: u32) -> Result<Encoder> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", width, height))
            .arg("-r")
            .arg(self.fps.to_string())
            .args(["-i", "-", "-pix_fmt", "yuv420p"])
            .arg(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let stdin = child.stdin.take().context("failed to capture ffmpeg stdin")?;
        info!("encoding {}x{} frames to {}", width, height, self.path.display());
        Ok(Encoder {
            child,
            stdin,
            width,
            height,
        })
    }
}

impl FrameSink for VideoFileSink {
    fn show(&mut self, frame: &RgbImage) -> Result<()> {
        if self.encoder.is_none() {
            self.encoder = Some(self.spawn_encoder(frame.width(), frame.height())?);
        }
        let Some(enc) = self.encoder.as_mut() else {
            bail!("encoder is not running");
        };
        ensure!(
            frame.dimensions() == (enc.width, enc.height),
            "frame size changed from {}x{} to {}x{}",
            enc.width,
            enc.height,
            frame.width(),
            frame.height()
        );
        enc.stdin
            .write_all(frame.as_raw())
            .context("failed to write a frame to ffmpeg")
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(enc) = self.encoder.take() {
            let Encoder { mut child, stdin, .. } = enc;
            // stdinを閉じるとffmpegはファイルを書き終えて終了する
            drop(stdin);
            let status = child.wait()?;
            ensure!(status.success(), "ffmpeg exited with {}", status);
            info!("saved {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for VideoFileSink {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// パスの拡張子から出力先を選びます。動画の拡張子ならエンコード、それ以外はディレクトリに保存します。
pub fn sink_for_path(path: &Path, fps: f32) -> Result<Box<dyn FrameSink>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4" | "mkv" | "avi" | "mov") => Ok(Box::new(VideoFileSink::new(path, fps)?)),
        _ => Ok(Box::new(ImageDirSink::create(path)?)),
    }
}
