//! パイプラインを実行するデバイスのモジュール
//!
//! 各 XLinkIn と NeuralNetwork ノードはそれぞれ専用のスレッドで動作し、
//! ノードの入力キューからメッセージを取り出して、接続先のキューへ送ります。

use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::backend::{NeuralNetworkBackend, OnnxBackend, OnnxOptions};
use crate::nn_data::NnData;
use crate::pipeline::{NeuralNetwork, Node, NodeId, Pipeline};
use crate::queue::DataQueue;

/// ホスト入力キューの既定の最大メッセージ数
pub const INPUT_QUEUE_SIZE: usize = 8;
/// ホスト出力キューの既定の最大メッセージ数
pub const OUTPUT_QUEUE_SIZE: usize = 16;
/// NeuralNetwork ノードの入力キューの最大メッセージ数
pub const NN_INPUT_QUEUE_SIZE: usize = 5;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// パイプラインを実行するデバイス
pub struct Device {
    input_queues: HashMap<String, DataQueue<NnData>>,
    output_queues: HashMap<String, DataQueue<NnData>>,
    all_queues: Vec<DataQueue<NnData>>,
    pending: Vec<(String, Job)>,
    workers: Vec<JoinHandle<()>>,
}

impl Device {
    /// パイプラインを検査し、各 NeuralNetwork ノードのモデルを [`OnnxBackend`] で読み込んで開始します。
    pub fn new(pipeline: Pipeline) -> Result<Self> {
        Self::with_backend_factory(pipeline, |_, nn| {
            let path = nn.blob_path.as_ref().context("NeuralNetwork has no blob path")?;
            let backend = OnnxBackend::load(path, OnnxOptions::default())?;
            Ok(Box::new(backend) as Box<dyn NeuralNetworkBackend>)
        })
    }

    /// 任意のバックエンドでパイプラインを開始します。
    ///
    /// # Args
    /// * `pipeline` - 実行するパイプライン
    /// * `factory` - NeuralNetwork ノードの推論スレッドごとに呼ばれ、バックエンドを作成します
    pub fn with_backend_factory<F>(pipeline: Pipeline, mut factory: F) -> Result<Self>
    where
        F: FnMut(NodeId, &NeuralNetwork) -> Result<Box<dyn NeuralNetworkBackend>>,
    {
        pipeline.validate()?;

        // 各ノードの入力キューを作成
        let mut node_inputs: HashMap<NodeId, DataQueue<NnData>> = HashMap::new();
        let mut input_queues = HashMap::new();
        let mut output_queues = HashMap::new();
        for (id, node) in pipeline.nodes() {
            let q = match node {
                Node::XLinkIn(n) => {
                    let q = DataQueue::new(&n.stream_name, INPUT_QUEUE_SIZE, true);
                    input_queues.insert(n.stream_name.clone(), q.clone());
                    q
                }
                Node::NeuralNetwork(_) => {
                    DataQueue::new(&format!("nn{}", id.index()), NN_INPUT_QUEUE_SIZE, true)
                }
                Node::XLinkOut(n) => {
                    let q = DataQueue::new(&n.stream_name, OUTPUT_QUEUE_SIZE, true);
                    output_queues.insert(n.stream_name.clone(), q.clone());
                    q
                }
            };
            node_inputs.insert(id, q);
        }

        let mut pending: Vec<(String, Job)> = Vec::new();
        for (id, node) in pipeline.nodes() {
            let input = node_inputs
                .get(&id)
                .cloned()
                .with_context(|| format!("no input queue for node {}", id.index()))?;
            let dests: Vec<DataQueue<NnData>> = pipeline
                .outputs_of(id)
                .iter()
                .filter_map(|to| node_inputs.get(to).cloned())
                .collect();

            match node {
                Node::XLinkIn(n) => {
                    let max_data_size = n.max_data_size;
                    let job: Job = Box::new(move || forward_loop(input, dests, max_data_size));
                    pending.push((format!("xlink-in-{}", n.stream_name), job));
                }
                Node::NeuralNetwork(n) => {
                    for t in 0..n.num_inference_threads.max(1) {
                        let backend = factory(id, n)?;
                        let (input, dests) = (input.clone(), dests.clone());
                        let job: Job = Box::new(move || inference_loop(input, dests, backend));
                        pending.push((format!("nn{}-{}", id.index(), t), job));
                    }
                }
                Node::XLinkOut(_) => {}
            }
        }

        let mut device = Self {
            input_queues,
            output_queues,
            all_queues: node_inputs.into_values().collect(),
            pending,
            workers: Vec::new(),
        };
        device.start_pipeline()?;
        Ok(device)
    }

    /// ワーカースレッドを開始します。すでに開始している場合は何もしません。
    pub fn start_pipeline(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }
        for (name, job) in pending {
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(job)
                .with_context(|| format!("can't spawn thread {}", name))?;
            self.workers.push(handle);
        }
        info!("pipeline started: {} worker threads", self.workers.len());
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.pending.is_empty() && !self.workers.is_empty()
    }

    /// ホストからデバイスへの入力キューを取得します。
    ///
    /// # Args
    /// * `name` - XLinkIn のストリーム名
    pub fn get_input_queue(&self, name: &str) -> Result<DataQueue<NnData>> {
        self.input_queues
            .get(name)
            .cloned()
            .with_context(|| format!("no input stream named '{}'", name))
    }

    /// デバイスからホストへの出力キューを、指定したサイズと動作に設定して取得します。
    ///
    /// # Args
    /// * `name` - XLinkOut のストリーム名
    /// * `max_size` - 最大メッセージ数
    /// * `blocking` - 満杯のときにデバイスを待たせるか。falseの場合は古いメッセージを捨てます
    pub fn get_output_queue(
        &self,
        name: &str,
        max_size: usize,
        blocking: bool,
    ) -> Result<DataQueue<NnData>> {
        let q = self
            .output_queues
            .get(name)
            .with_context(|| format!("no output stream named '{}'", name))?;
        q.set_max_size(max_size)?;
        q.set_blocking(blocking)?;
        Ok(q.clone())
    }

    pub fn input_stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.input_queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn output_stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.output_queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// すべてのキューを閉じ、ワーカースレッドの終了を待ちます。
    pub fn close(&mut self) {
        for q in &self.all_queues {
            q.close();
        }
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("thread {} panicked", name);
            }
        }
    }
}

impl Drop for Device {
    // デストラクタ (スレッドを停止)
    fn drop(&mut self) {
        self.close();
    }
}

/// メッセージをすべての送信先へ送ります。
///
/// # Return
/// * 送信先のキューが閉じられていた場合は false
fn send_all(dests: &[DataQueue<NnData>], msg: NnData) -> bool {
    let Some((last, rest)) = dests.split_last() else {
        return true;
    };
    for q in rest {
        if q.send(msg.clone()).is_err() {
            return false;
        }
    }
    last.send(msg).is_ok()
}

/// XLinkIn のスレッドの中身
fn forward_loop(input: DataQueue<NnData>, dests: Vec<DataQueue<NnData>>, max_data_size: usize) {
    while let Ok(msg) = input.get() {
        if msg.raw_len() > max_data_size {
            warn!(
                "{}: dropped message {} ({} bytes > {} bytes)",
                input.name(),
                msg.sequence_num(),
                msg.raw_len(),
                max_data_size
            );
            continue;
        }
        if !send_all(&dests, msg) {
            break;
        }
    }
    debug!("{}: forwarding stopped", input.name());
}

/// NeuralNetwork のスレッドの中身
fn inference_loop(
    input: DataQueue<NnData>,
    dests: Vec<DataQueue<NnData>>,
    mut backend: Box<dyn NeuralNetworkBackend>,
) {
    while let Ok(msg) = input.get() {
        let start = Instant::now();
        let mut result = match backend.infer(&msg) {
            Ok(r) => r,
            Err(e) => {
                error!("inference failed for message {}: {:#}", msg.sequence_num(), e);
                continue;
            }
        };
        debug!(
            "inference {} took {:.03}ms",
            msg.sequence_num(),
            start.elapsed().as_secs_f64() * 1000.
        );
        result
            .set_sequence_num(msg.sequence_num())
            .set_timestamp(msg.timestamp())
            .set_timestamp_device(Instant::now());
        if !send_all(&dests, result) {
            break;
        }
    }
    debug!("{}: inference stopped", input.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn video_pipeline() -> Pipeline {
        let mut p = Pipeline::new();
        let xin = p.create_xlink_in();
        p.xlink_in_mut(xin).unwrap().set_stream_name("in_nn");
        let nn = p.create_neural_network();
        p.neural_network_mut(nn).unwrap().set_blob_path("unused.onnx");
        let xout = p.create_xlink_out();
        p.xlink_out_mut(xout).unwrap().set_stream_name("nn");
        p.link(xin, nn).unwrap();
        p.link(nn, xout).unwrap();
        p
    }

    /// 入力の要素数を FP16 レイヤで返すバックエンド
    fn counting_backend(_: NodeId, _: &NeuralNetwork) -> Result<Box<dyn NeuralNetworkBackend>> {
        Ok(Box::new(|input: &NnData| -> Result<NnData> {
            let n = input.get_first_layer_u8()?.len();
            let mut out = NnData::new();
            out.set_layer_fp16("count", &[n as f32]);
            Ok(out)
        }))
    }

    fn frame_msg(seq: i64, len: usize) -> NnData {
        let mut msg = NnData::new();
        msg.set_layer_u8("data", &vec![0; len]).set_sequence_num(seq);
        msg
    }

    #[test]
    fn runs_inference_and_keeps_sequence_numbers() {
        let device = Device::with_backend_factory(video_pipeline(), counting_backend).unwrap();
        assert!(device.is_started());
        let q_in = device.get_input_queue("in_nn").unwrap();
        let q_nn = device.get_output_queue("nn", 4, false).unwrap();

        q_in.send(frame_msg(42, 12)).unwrap();
        let out = q_nn.get_timeout(WAIT).unwrap().expect("no result");
        assert_eq!(out.sequence_num(), 42);
        assert!(out.timestamp_device().unwrap() >= out.timestamp());
        assert_eq!(out.get_first_layer_fp16().unwrap(), vec![12.]);
    }

    #[test]
    fn unknown_streams_are_errors() {
        let device = Device::with_backend_factory(video_pipeline(), counting_backend).unwrap();
        assert!(device.get_input_queue("nn").is_err());
        assert!(device.get_output_queue("in_nn", 4, false).is_err());
        assert_eq!(device.input_stream_names(), vec!["in_nn"]);
        assert_eq!(device.output_stream_names(), vec!["nn"]);
    }

    #[test]
    fn output_queue_is_reconfigured() {
        let device = Device::with_backend_factory(video_pipeline(), counting_backend).unwrap();
        let q_nn = device.get_output_queue("nn", 4, false).unwrap();
        assert_eq!(q_nn.max_size().unwrap(), 4);
        assert!(!q_nn.is_blocking().unwrap());
    }

    #[test]
    fn failed_inference_is_skipped() {
        let factory = |_: NodeId, _: &NeuralNetwork| -> Result<Box<dyn NeuralNetworkBackend>> {
            Ok(Box::new(|input: &NnData| -> Result<NnData> {
                if input.sequence_num() == 0 {
                    bail!("bad frame");
                }
                Ok(NnData::new())
            }))
        };
        let device = Device::with_backend_factory(video_pipeline(), factory).unwrap();
        let q_in = device.get_input_queue("in_nn").unwrap();
        let q_nn = device.get_output_queue("nn", 4, true).unwrap();

        q_in.send(frame_msg(0, 1)).unwrap();
        q_in.send(frame_msg(1, 1)).unwrap();
        let out = q_nn.get_timeout(WAIT).unwrap().expect("no result");
        assert_eq!(out.sequence_num(), 1);
    }

    #[test]
    fn passthrough_and_fan_out() {
        let mut p = Pipeline::new();
        let xin = p.create_xlink_in();
        p.xlink_in_mut(xin).unwrap().set_stream_name("in");
        let a = p.create_xlink_out();
        p.xlink_out_mut(a).unwrap().set_stream_name("a");
        let b = p.create_xlink_out();
        p.xlink_out_mut(b).unwrap().set_stream_name("b");
        p.link(xin, a).unwrap();
        p.link(xin, b).unwrap();

        let device = Device::with_backend_factory(p, counting_backend).unwrap();
        device.get_input_queue("in").unwrap().send(frame_msg(7, 3)).unwrap();
        for name in ["a", "b"] {
            let q = device.get_output_queue(name, 4, true).unwrap();
            let out = q.get_timeout(WAIT).unwrap().expect("no message");
            assert_eq!(out.sequence_num(), 7);
            assert_eq!(out.get_first_layer_u8().unwrap().len(), 3);
        }
    }

    #[test]
    fn oversized_messages_are_dropped() {
        let mut p = video_pipeline();
        let xin = p.nodes().find(|(_, n)| matches!(n, Node::XLinkIn(_))).unwrap().0;
        p.xlink_in_mut(xin).unwrap().set_max_data_size(16);

        let device = Device::with_backend_factory(p, counting_backend).unwrap();
        let q_in = device.get_input_queue("in_nn").unwrap();
        let q_nn = device.get_output_queue("nn", 4, true).unwrap();
        q_in.send(frame_msg(0, 100)).unwrap();
        q_in.send(frame_msg(1, 8)).unwrap();
        let out = q_nn.get_timeout(WAIT).unwrap().expect("no result");
        assert_eq!(out.sequence_num(), 1);
    }

    #[test]
    fn replaced_layers_count_only_their_new_size() {
        let mut p = video_pipeline();
        let xin = p.nodes().find(|(_, n)| matches!(n, Node::XLinkIn(_))).unwrap().0;
        p.xlink_in_mut(xin).unwrap().set_max_data_size(16);

        let device = Device::with_backend_factory(p, counting_backend).unwrap();
        let q_in = device.get_input_queue("in_nn").unwrap();
        let q_nn = device.get_output_queue("nn", 4, true).unwrap();

        let mut msg = frame_msg(3, 100);
        msg.set_layer_u8("data", &[0; 8]);
        q_in.send(msg).unwrap();
        let out = q_nn.get_timeout(WAIT).unwrap().expect("no result");
        assert_eq!(out.sequence_num(), 3);
        assert_eq!(out.get_first_layer_fp16().unwrap(), vec![8.]);
    }

    #[test]
    fn backend_factory_errors_fail_construction() {
        let factory = |_: NodeId, _: &NeuralNetwork| -> Result<Box<dyn NeuralNetworkBackend>> {
            bail!("model missing")
        };
        assert!(Device::with_backend_factory(video_pipeline(), factory).is_err());
    }

    #[test]
    fn invalid_pipeline_is_rejected() {
        let mut p = Pipeline::new();
        p.create_neural_network();
        assert!(Device::with_backend_factory(p, counting_backend).is_err());
    }

    #[test]
    fn close_stops_workers() {
        let mut device = Device::with_backend_factory(video_pipeline(), counting_backend).unwrap();
        let q_in = device.get_input_queue("in_nn").unwrap();
        device.close();
        assert!(q_in.send(frame_msg(0, 1)).is_err());
        // 2回目のstart_pipelineは何もしない
        device.start_pipeline().unwrap();
    }

    #[test]
    fn multiple_inference_threads() {
        let mut p = video_pipeline();
        let nn = p.nodes().find(|(_, n)| matches!(n, Node::NeuralNetwork(_))).unwrap().0;
        p.neural_network_mut(nn).unwrap().set_num_inference_threads(3);

        let mut created = 0;
        let device = Device::with_backend_factory(p, |id, n| {
            created += 1;
            counting_backend(id, n)
        })
        .unwrap();
        drop(device);
        assert_eq!(created, 3);
    }
}
