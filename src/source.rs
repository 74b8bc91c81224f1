//! フレームの読み込み元のモジュール

use std::ffi::OsStr;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;
use log::{debug, info, warn};

/// フレームを順に返す読み込み元
pub trait FrameSource {
    /// 次のフレームを返します。終端に達した場合は `None` を返します。
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// `ffprobe` の出力 (`WIDTHxHEIGHT`) を解析します。
pub fn parse_probe_output(output: &str) -> Result<(u32, u32)> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("ffprobe printed nothing")?;
    let (w, h) = line
        .split_once('x')
        .with_context(|| format!("unexpected ffprobe output: {}", line))?;
    let w: u32 = w.trim().parse().with_context(|| format!("bad width: {}", w))?;
    let h: u32 = h.trim().parse().with_context(|| format!("bad height: {}", h))?;
    ensure!(w > 0 && h > 0, "video has zero size: {}x{}", w, h);
    Ok((w, h))
}

/// 動画のフレームサイズを `ffprobe` で調べます。
pub fn probe_frame_size(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height", "-of", "csv=p=0:s=x"])
        .arg(path)
        .output()
        .context("failed to run ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// `ffmpeg` の子プロセスで動画をデコードする読み込み元
pub struct VideoFileSource {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl VideoFileSource {
    /// 動画ファイルを開きます。
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        ensure!(path.exists(), "video not found: {}", path.display());
        let (width, height) = probe_frame_size(path)?;
        info!("opening {} ({}x{})", path.display(), width, height);

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let stdout = child.stdout.take().context("failed to capture ffmpeg stdout")?;

        Ok(Self {
            child,
            stdout,
            width,
            height,
        })
    }
}

impl FrameSource for VideoFileSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; (self.width * self.height * 3) as usize];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {
                let frame = RgbImage::from_raw(self.width, self.height, buf)
                    .context("frame buffer has the wrong size")?;
                Ok(Some(frame))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("ffmpeg reached the end of the stream");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VideoFileSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

/// ディレクトリ内の画像ファイルを名前順に返す読み込み元
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("can't read {}", dir.display()))? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(OsStr::to_str)
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        paths.sort();
        if paths.is_empty() {
            warn!("no images in {}", dir.display());
        }
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let img = image::open(path).with_context(|| format!("can't open {}", path.display()))?;
        Ok(Some(img.to_rgb8()))
    }
}

#[cfg(feature = "camera")]
pub use camera::CameraSource;

#[cfg(feature = "camera")]
mod camera {
    use std::sync::mpsc;
    use std::thread;

    use anyhow::{bail, Context, Result};
    use image::RgbImage;
    use log::error;
    use v4l::buffer::Type;
    use v4l::io::{mmap::Stream, traits::CaptureStream};
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    use super::FrameSource;

    enum Command {
        Grab,
        Stop,
    }

    /// カメラ画像を取得するための構造体
    ///
    /// 処理中にもカメラのバッファを更新する必要があるため、カメラだけ別スレッドで動かしておきます。
    pub struct CameraSource {
        thread_handle: Option<thread::JoinHandle<()>>,
        cmd_tx: mpsc::Sender<Command>,
        cam_img_rx: mpsc::Receiver<Result<RgbImage>>,
    }

    impl CameraSource {
        pub fn new(cam_device_index: usize, frame_width: u32, frame_height: u32) -> Self {
            let (cmd_tx, cmd_rx) = mpsc::channel();
            let (cam_img_tx, cam_img_rx) = mpsc::channel();

            let thread_handle = Some(thread::spawn(move || {
                if let Err(e) = Self::run_cam_thread(
                    cam_device_index,
                    &cmd_rx,
                    &cam_img_tx,
                    frame_width,
                    frame_height,
                ) {
                    error!("camera thread stopped: {:#}", e);
                    let _ = cam_img_tx.send(Err(e));
                }
            }));
            Self {
                thread_handle,
                cmd_tx,
                cam_img_rx,
            }
        }

        fn run_cam_thread(
            cam_device_index: usize,
            cmd_rx: &mpsc::Receiver<Command>,
            cam_img_tx: &mpsc::Sender<Result<RgbImage>>,
            frame_width: u32,
            frame_height: u32,
        ) -> Result<()> {
            let mut dev = Device::new(cam_device_index)?;

            let mut fmt = dev.format()?;
            fmt.width = frame_width;
            fmt.height = frame_height;
            fmt.fourcc = FourCC::new(b"MJPG");
            dev.set_format(&fmt)?;

            let mut cam_stream = Stream::with_buffers(&mut dev, Type::VideoCapture, 3)?;

            loop {
                let (frame, _meta) = CaptureStream::next(&mut cam_stream)?;

                match cmd_rx.try_recv() {
                    Ok(Command::Grab) => {
                        let img = image::load_from_memory(frame)?.to_rgb8();
                        if cam_img_tx.send(Ok(img)).is_err() {
                            break;
                        }
                    }
                    Ok(Command::Stop) | Err(mpsc::TryRecvError::Disconnected) => break,
                    Err(mpsc::TryRecvError::Empty) => {}
                }
                thread::yield_now();
            }
            Ok(())
        }

        pub fn stop(&mut self) -> Result<()> {
            if let Some(handle) = self.thread_handle.take() {
                let _ = self.cmd_tx.send(Command::Stop);
                if handle.join().is_err() {
                    bail!("Can't join camera thread");
                }
            }
            Ok(())
        }
    }

    impl FrameSource for CameraSource {
        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            if self.thread_handle.is_none() {
                return Ok(None);
            }
            self.cmd_tx.send(Command::Grab).context("camera thread is gone")?;
            match self.cam_img_rx.recv() {
                Ok(img) => img.map(Some),
                Err(_) => Ok(None),
            }
        }
    }

    impl Drop for CameraSource {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_probe_output("640x360\n").unwrap(), (640, 360));
        assert_eq!(parse_probe_output("\n1920x1080\n").unwrap(), (1920, 1080));
        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("640,360").is_err());
        assert!(parse_probe_output("0x360").is_err());
    }

    #[test]
    fn missing_video_is_an_error() {
        assert!(VideoFileSource::open("/nonexistent/construction_vest.mp4").is_err());
    }

    #[test]
    fn image_sequence_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 2, Rgb([2, 0, 0])).save(dir.path().join("b.png")).unwrap();
        RgbImage::from_pixel(4, 2, Rgb([1, 0, 0])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut src = ImageSequenceSource::open(dir.path()).unwrap();
        assert_eq!(src.len(), 2);
        assert_eq!(src.next_frame().unwrap().unwrap().get_pixel(0, 0)[0], 1);
        assert_eq!(src.next_frame().unwrap().unwrap().get_pixel(0, 0)[0], 2);
        assert!(src.next_frame().unwrap().is_none());
    }
}
