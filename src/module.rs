// src/module.rs
use crate::autograd::{set_inference_mode, Tensor};
use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD};
use std::collections::HashMap;

/// 带权重的层种类：测度只在这些层上聚合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Linear,
    Conv2d,
}

/// 模型参数树中的一个带权重层（共享底层 Tensor）
#[derive(Clone)]
pub struct WeightedLayer {
    pub kind: LayerKind,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// WeightedLayer 的数据快照（拥有数据，不随训练变化）
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    pub kind: LayerKind,
    pub weight: ArrayD<f32>,
    pub bias: Option<ArrayD<f32>>,
}

impl From<&WeightedLayer> for LayerWeights {
    fn from(layer: &WeightedLayer) -> Self {
        LayerWeights {
            kind: layer.kind,
            weight: layer.weight.data(),
            bias: layer.bias.as_ref().map(|b| b.data()),
        }
    }
}

impl LayerWeights {
    /// 输出单元数（卷积为输出通道数）
    pub fn n_hidden(&self) -> usize {
        self.weight.shape()[0]
    }

    /// [out, in, kh, kw] / [out, in] -> [out, in*kh*kw]
    pub fn weight_matrix(&self) -> Array2<f32> {
        let rows = self.n_hidden();
        let cols = self.weight.len() / rows.max(1);
        self.weight
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((rows, cols))
            .expect("weight element count is rows * cols")
    }

    pub fn n_param(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

pub fn snapshot_layers(module: &dyn Module) -> Vec<LayerWeights> {
    module.weighted_layers().iter().map(LayerWeights::from).collect()
}

/// 先按名字换上 `params` 再取快照，模型参数随后恢复原值
pub fn snapshot_layers_from(module: &dyn Module, params: &[(String, ArrayD<f32>)]) -> Result<Vec<LayerWeights>> {
    let lookup: HashMap<&str, &ArrayD<f32>> = params.iter().map(|(n, d)| (n.as_str(), d)).collect();
    let snapshot = ParamSnapshot::capture(module);

    for (name, param) in module.named_parameters("") {
        match lookup.get(name.as_str()) {
            Some(data) if data.shape() == param.shape().as_slice() => param.set_data((*data).clone()),
            Some(data) => {
                snapshot.restore();
                return Err(Error::Measure(format!(
                    "parameter {} has shape {:?}, expected {:?}",
                    name,
                    data.shape(),
                    param.shape()
                )));
            }
            None => {
                snapshot.restore();
                return Err(Error::Measure(format!("parameter {} missing", name)));
            }
        }
    }

    let layers = snapshot_layers(module);
    snapshot.restore();
    Ok(layers)
}

pub(crate) fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

pub trait Module {
    fn forward(&self, input: Tensor) -> Tensor;
    fn parameters(&self) -> Vec<Tensor>;

    /// 带层级前缀的参数名，例如 `features.0.weight`
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (join_name(prefix, &i.to_string()), p))
            .collect()
    }

    /// 按前向顺序列出所有 Linear / Conv 层
    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        vec![]
    }

    // 训练模式：允许构图
    fn train_mode(&mut self) {
        set_inference_mode(false);
    }

    // 推理模式：禁止构图（等价 no_grad）
    fn eval_mode(&mut self) {
        set_inference_mode(true);
    }
}

pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Sequential { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, mut input: Tensor) -> Tensor {
        for layer in &self.layers {
            input = layer.forward(input);
        }
        input
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| l.named_parameters(&join_name(prefix, &i.to_string())))
            .collect()
    }

    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        self.layers.iter().flat_map(|l| l.weighted_layers()).collect()
    }

    fn train_mode(&mut self) {
        // 先设置全局模式，再递归
        set_inference_mode(false);
        for l in &mut self.layers {
            l.train_mode();
        }
    }

    fn eval_mode(&mut self) {
        set_inference_mode(true);
        for l in &mut self.layers {
            l.eval_mode();
        }
    }
}

/// 参数数据快照：原地修改模型参数（取绝对值、加扰动……）后可整体恢复
pub struct ParamSnapshot {
    saved: Vec<(Tensor, ArrayD<f32>)>,
}

impl ParamSnapshot {
    pub fn capture(module: &dyn Module) -> Self {
        let saved = module
            .parameters()
            .into_iter()
            .map(|p| {
                let data = p.data();
                (p, data)
            })
            .collect();
        ParamSnapshot { saved }
    }

    pub fn restore(&self) {
        for (param, data) in &self.saved {
            param.set_data(data.clone());
        }
    }
}

#[macro_export]
macro_rules! sequential {
    ($($layer:expr),* $(,)?) => {
        $crate::module::Sequential::new(vec![
            $(Box::new($layer)),*
        ])
    };
}
