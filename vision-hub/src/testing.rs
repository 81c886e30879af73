//! Test helpers: tiny in-memory classifiers and scripted retrieval mechanisms.
//!
//! Available to other crates with the `test-utils` feature.

use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use prost_tract_compat::Message;
use tract_onnx::{pb, prelude::*};
use url::Url;

use crate::{
    fetch::{Retrieve, RetrieveError},
    preprocess::IMAGENET_INPUT_SHAPE,
};

const FLOAT: i32 = 1;

fn weight(c: usize, k: usize, num_classes: usize) -> f32 {
    (c * num_classes + k) as f32 * 0.1 - 0.5
}

fn bias(k: usize) -> f32 {
    k as f32 * 0.01
}

fn value_info(name: &str, dims: &[usize]) -> pb::ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| pb::tensor_shape_proto::Dimension {
            value: Some(pb::tensor_shape_proto::dimension::Value::DimValue(*d as i64)),
            ..Default::default()
        })
        .collect();
    pb::ValueInfoProto {
        name: name.to_string(),
        r#type: Some(pb::TypeProto {
            value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                elem_type: FLOAT,
                shape: Some(pb::TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn initializer(name: &str, dims: &[usize], values: Vec<f32>) -> pb::TensorProto {
    pb::TensorProto {
        name: name.to_string(),
        dims: dims.iter().map(|d| *d as i64).collect(),
        data_type: FLOAT,
        float_data: values,
        ..Default::default()
    }
}

fn node(op_type: &str, inputs: &[&str], output: &str) -> pb::NodeProto {
    pb::NodeProto {
        name: format!("{op_type}_{output}"),
        op_type: op_type.to_string(),
        input: inputs.iter().map(|i| i.to_string()).collect(),
        output: vec![output.to_string()],
        ..Default::default()
    }
}

/// Serialized ONNX classifier: global average pool, flatten, then a dense layer to
/// `num_classes` scores. Takes the ImageNet input shape.
pub fn tiny_classifier(num_classes: usize) -> anyhow::Result<Vec<u8>> {
    let weights = (0..3)
        .flat_map(|c| (0..num_classes).map(move |k| weight(c, k, num_classes)))
        .collect();
    let biases = (0..num_classes).map(bias).collect();
    let graph = pb::GraphProto {
        name: "tiny".to_string(),
        node: vec![
            node("GlobalAveragePool", &["input"], "pooled"),
            node("Flatten", &["pooled"], "flat"),
            node("Gemm", &["flat", "weight", "bias"], "scores"),
        ],
        initializer: vec![
            initializer("weight", &[3, num_classes], weights),
            initializer("bias", &[num_classes], biases),
        ],
        input: vec![value_info("input", &IMAGENET_INPUT_SHAPE)],
        output: vec![value_info("scores", &[1, num_classes])],
        ..Default::default()
    };
    let model = pb::ModelProto {
        ir_version: 7,
        producer_name: "vision-hub-tests".to_string(),
        opset_import: vec![pb::OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        graph: Some(graph),
        ..Default::default()
    };
    Ok(model.encode_to_vec())
}

pub fn write_tiny_classifier(dir: &Path, num_classes: usize) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!("tiny-{num_classes}.onnx"));
    std::fs::write(&path, tiny_classifier(num_classes)?)?;
    Ok(path)
}

/// Scores of [`tiny_classifier`] on an input where every pixel of channel `c` equals `channels[c]`.
pub fn tiny_classifier_scores(channels: [f32; 3], num_classes: usize) -> Vec<f32> {
    (0..num_classes)
        .map(|k| {
            channels
                .iter()
                .enumerate()
                .map(|(c, v)| v * weight(c, k, num_classes))
                .sum::<f32>()
                + bias(k)
        })
        .collect()
}

pub fn constant_input(channels: [f32; 3]) -> Tensor {
    let [n, c, h, w] = IMAGENET_INPUT_SHAPE;
    tract_ndarray::Array4::from_shape_fn((n, c, h, w), |(_, c, _, _)| channels[c]).into()
}

/// PNG encoding of a uniform `width`x`height` image.
pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> anyhow::Result<Vec<u8>> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Serves the same body for every URL.
pub struct ServeBytes {
    bytes: Vec<u8>,
    calls: Arc<AtomicUsize>,
}

impl ServeBytes {
    pub fn new(bytes: Vec<u8>, calls: Arc<AtomicUsize>) -> Self {
        Self { bytes, calls }
    }
}

impl Retrieve for ServeBytes {
    fn mechanism(&self) -> &'static str {
        "serve-bytes"
    }

    fn retrieve(&self, _url: &Url, dest: &mut dyn Write) -> Result<u64, RetrieveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        dest.write_all(&self.bytes)?;
        Ok(self.bytes.len() as u64)
    }
}

/// Serves each body for the URLs whose path ends with its suffix, 404 for anything else.
pub struct ServeRoutes {
    routes: Vec<(&'static str, Vec<u8>)>,
    calls: Arc<AtomicUsize>,
}

impl ServeRoutes {
    pub fn new(routes: Vec<(&'static str, Vec<u8>)>, calls: Arc<AtomicUsize>) -> Self {
        Self { routes, calls }
    }
}

impl Retrieve for ServeRoutes {
    fn mechanism(&self) -> &'static str {
        "serve-routes"
    }

    fn retrieve(&self, url: &Url, dest: &mut dyn Write) -> Result<u64, RetrieveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (_, body) = self
            .routes
            .iter()
            .find(|(suffix, _)| url.path().ends_with(suffix))
            .ok_or(RetrieveError::Status(404))?;
        dest.write_all(body)?;
        Ok(body.len() as u64)
    }
}

/// Fails every request like a host that cannot be resolved.
pub struct Unreachable;

impl Retrieve for Unreachable {
    fn mechanism(&self) -> &'static str {
        "unreachable"
    }

    fn retrieve(&self, url: &Url, _dest: &mut dyn Write) -> Result<u64, RetrieveError> {
        Err(RetrieveError::Transport(format!(
            "failed to lookup address of {}",
            url.host_str().unwrap_or_default()
        )))
    }
}
