//! デバイス上の処理段 (ノード) とその接続を記述するパイプラインのモジュール

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

/// パイプライン内のノードを指すハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// ホストからデバイスへの入力ストリーム
#[derive(Debug, Clone)]
pub struct XLinkIn {
    pub stream_name: String,
    /// 1メッセージの最大サイズ (バイト)
    pub max_data_size: usize,
}

impl XLinkIn {
    pub fn set_stream_name(&mut self, name: &str) -> &mut Self {
        self.stream_name = name.to_string();
        self
    }

    pub fn set_max_data_size(&mut self, size: usize) -> &mut Self {
        self.max_data_size = size;
        self
    }
}

/// 推論モデルを保持するノード
#[derive(Debug, Clone)]
pub struct NeuralNetwork {
    pub blob_path: Option<PathBuf>,
    /// 推論を実行するワーカースレッドの数
    pub num_inference_threads: usize,
}

impl NeuralNetwork {
    pub fn set_blob_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.blob_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn set_num_inference_threads(&mut self, n: usize) -> &mut Self {
        self.num_inference_threads = n.max(1);
        self
    }
}

/// デバイスからホストへの出力ストリーム
#[derive(Debug, Clone)]
pub struct XLinkOut {
    pub stream_name: String,
}

impl XLinkOut {
    pub fn set_stream_name(&mut self, name: &str) -> &mut Self {
        self.stream_name = name.to_string();
        self
    }
}

/// パイプラインのノード
#[derive(Debug, Clone)]
pub enum Node {
    XLinkIn(XLinkIn),
    NeuralNetwork(NeuralNetwork),
    XLinkOut(XLinkOut),
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::XLinkIn(_) => "XLinkIn",
            Node::NeuralNetwork(_) => "NeuralNetwork",
            Node::XLinkOut(_) => "XLinkOut",
        }
    }
}

/// `from` の出力から `to` の入力への接続
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
}

const DEFAULT_MAX_DATA_SIZE: usize = 5 * 1024 * 1024;

/// ノードと接続の集合
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_xlink_in(&mut self) -> NodeId {
        self.add(Node::XLinkIn(XLinkIn {
            stream_name: String::new(),
            max_data_size: DEFAULT_MAX_DATA_SIZE,
        }))
    }

    pub fn create_neural_network(&mut self) -> NodeId {
        self.add(Node::NeuralNetwork(NeuralNetwork {
            blob_path: None,
            num_inference_threads: 1,
        }))
    }

    pub fn create_xlink_out(&mut self) -> NodeId {
        self.add(Node::XLinkOut(XLinkOut {
            stream_name: String::new(),
        }))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .with_context(|| format!("node {} does not exist", id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .with_context(|| format!("node {} does not exist", id.0))
    }

    pub fn xlink_in_mut(&mut self, id: NodeId) -> Result<&mut XLinkIn> {
        match self.node_mut(id)? {
            Node::XLinkIn(n) => Ok(n),
            other => bail!("node {} is {}, not XLinkIn", id.0, other.kind()),
        }
    }

    pub fn neural_network_mut(&mut self, id: NodeId) -> Result<&mut NeuralNetwork> {
        match self.node_mut(id)? {
            Node::NeuralNetwork(n) => Ok(n),
            other => bail!("node {} is {}, not NeuralNetwork", id.0, other.kind()),
        }
    }

    pub fn xlink_out_mut(&mut self, id: NodeId) -> Result<&mut XLinkOut> {
        match self.node_mut(id)? {
            Node::XLinkOut(n) => Ok(n),
            other => bail!("node {} is {}, not XLinkOut", id.0, other.kind()),
        }
    }

    /// すべてのノードをIDとともに返します。
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// `id` の出力がつながっているノード
    pub fn outputs_of(&self, id: NodeId) -> Vec<NodeId> {
        self.links
            .iter()
            .filter(|l| l.from == id)
            .map(|l| l.to)
            .collect()
    }

    /// `id` の入力につながっているノード
    pub fn inputs_of(&self, id: NodeId) -> Vec<NodeId> {
        self.links
            .iter()
            .filter(|l| l.to == id)
            .map(|l| l.from)
            .collect()
    }

    /// `from` の出力を `to` の入力に接続します。
    ///
    /// # Args
    /// * `from` - 送信元のノード (XLinkOut は不可)
    /// * `to` - 送信先のノード (XLinkIn は不可)
    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        ensure!(from != to, "node {} can't be linked to itself", from.0);
        if let Node::XLinkOut(_) = self.node(from)? {
            bail!("XLinkOut node {} has no output", from.0);
        }
        if let Node::XLinkIn(_) = self.node(to)? {
            bail!("XLinkIn node {} has no input", to.0);
        }
        let link = Link { from, to };
        ensure!(
            !self.links.contains(&link),
            "node {} is already linked to node {}",
            from.0,
            to.0
        );
        self.links.push(link);
        Ok(())
    }

    /// パイプラインが実行可能かを検査します。
    pub fn validate(&self) -> Result<()> {
        let mut in_names = HashSet::new();
        let mut out_names = HashSet::new();

        for (id, node) in self.nodes() {
            match node {
                Node::XLinkIn(n) => {
                    ensure!(!n.stream_name.is_empty(), "XLinkIn node {} has no stream name", id.0);
                    ensure!(
                        in_names.insert(n.stream_name.as_str()),
                        "duplicate input stream name: {}",
                        n.stream_name
                    );
                }
                Node::XLinkOut(n) => {
                    ensure!(!n.stream_name.is_empty(), "XLinkOut node {} has no stream name", id.0);
                    ensure!(
                        out_names.insert(n.stream_name.as_str()),
                        "duplicate output stream name: {}",
                        n.stream_name
                    );
                    ensure!(
                        !self.inputs_of(id).is_empty(),
                        "XLinkOut '{}' is not linked",
                        n.stream_name
                    );
                }
                Node::NeuralNetwork(n) => {
                    ensure!(n.blob_path.is_some(), "NeuralNetwork node {} has no blob path", id.0);
                    ensure!(
                        !self.inputs_of(id).is_empty(),
                        "NeuralNetwork node {} has no input",
                        id.0
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_mobilenet_pipeline() -> (Pipeline, NodeId, NodeId, NodeId) {
        let mut p = Pipeline::new();
        let xin = p.create_xlink_in();
        p.xlink_in_mut(xin).unwrap().set_stream_name("in_nn");
        let nn = p.create_neural_network();
        p.neural_network_mut(nn).unwrap().set_blob_path("models/mobilenet.onnx");
        let xout = p.create_xlink_out();
        p.xlink_out_mut(xout).unwrap().set_stream_name("nn");
        p.link(xin, nn).unwrap();
        p.link(nn, xout).unwrap();
        (p, xin, nn, xout)
    }

    #[test]
    fn valid_pipeline() {
        let (p, xin, nn, xout) = video_mobilenet_pipeline();
        p.validate().unwrap();
        assert_eq!(p.outputs_of(xin), vec![nn]);
        assert_eq!(p.inputs_of(xout), vec![nn]);
        assert_eq!(p.links().len(), 2);
    }

    #[test]
    fn invalid_links() {
        let (mut p, xin, nn, xout) = video_mobilenet_pipeline();
        assert!(p.link(xout, nn).is_err());
        assert!(p.link(nn, xin).is_err());
        assert!(p.link(nn, nn).is_err());
        assert!(p.link(xin, nn).is_err());
        assert!(p.link(xin, NodeId(42)).is_err());
    }

    #[test]
    fn typed_accessors_check_kind() {
        let (mut p, xin, nn, _) = video_mobilenet_pipeline();
        assert!(p.xlink_out_mut(xin).is_err());
        assert!(p.xlink_in_mut(nn).is_err());
    }

    #[test]
    fn validation_errors() {
        let (mut p, _, nn, _) = video_mobilenet_pipeline();
        p.neural_network_mut(nn).unwrap().blob_path = None;
        assert!(p.validate().is_err());

        let (mut p, _, _, _) = video_mobilenet_pipeline();
        let dup = p.create_xlink_in();
        p.xlink_in_mut(dup).unwrap().set_stream_name("in_nn");
        assert!(p.validate().is_err());

        let (mut p, _, _, _) = video_mobilenet_pipeline();
        let dangling = p.create_xlink_out();
        p.xlink_out_mut(dangling).unwrap().set_stream_name("other");
        assert!(p.validate().is_err());

        let (mut p, _, _, _) = video_mobilenet_pipeline();
        p.create_xlink_in();
        assert!(p.validate().is_err());
    }
}
