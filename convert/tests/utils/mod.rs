#![allow(dead_code)]

use std::path::Path;

use prost::Message;
use tract_convert::tract_onnx::pb::attribute_proto::AttributeType;
use tract_convert::tract_onnx::pb::tensor_proto::DataType;
use tract_convert::tract_onnx::pb::tensor_shape_proto::{Dimension, dimension};
use tract_convert::tract_onnx::pb::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeProto, TypeProto, ValueInfoProto, type_proto,
};

pub fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("TRACT_LOG").try_init();
}

pub fn int(name: &str, i: i64) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: AttributeType::Int as i32,
        i,
        ..AttributeProto::default()
    }
}

pub fn ints(name: &str, ints: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: AttributeType::Ints as i32,
        ints: ints.to_vec(),
        ..AttributeProto::default()
    }
}

pub fn float(name: &str, f: f32) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: AttributeType::Float as i32,
        f,
        ..AttributeProto::default()
    }
}

pub fn node(op: &str, name: &str, inputs: &[&str], attributes: Vec<AttributeProto>) -> NodeProto {
    NodeProto {
        name: name.into(),
        op_type: op.into(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: vec![name.to_string()],
        attribute: attributes,
        ..NodeProto::default()
    }
}

/// A f32 initializer filled with small deterministic values.
pub fn weights(name: &str, dims: &[i64], salt: usize) -> TensorProto {
    let len = dims.iter().product::<i64>() as usize;
    let data = (0..len).map(|i| ((i * 7 + salt * 13) % 19) as f32 / 19.0 - 0.5).collect();
    floats(name, dims, data)
}

pub fn floats(name: &str, dims: &[i64], data: Vec<f32>) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: DataType::Float as i32,
        float_data: data,
        ..TensorProto::default()
    }
}

fn value_info(name: &str, dims: Option<&[i64]>) -> ValueInfoProto {
    let shape = dims.map(|dims| TensorShapeProto {
        dim: dims
            .iter()
            .map(|&d| Dimension {
                value: Some(dimension::Value::DimValue(d)),
                ..Dimension::default()
            })
            .collect(),
        ..TensorShapeProto::default()
    });
    let tensor = type_proto::Tensor {
        elem_type: DataType::Float as i32,
        shape,
        ..type_proto::Tensor::default()
    };
    let r#type =
        TypeProto { value: Some(type_proto::Value::TensorType(tensor)), ..TypeProto::default() };
    ValueInfoProto {
        name: name.into(),
        r#type: Some(r#type),
        ..ValueInfoProto::default()
    }
}

pub fn model(
    input: &str,
    input_shape: &[i64],
    nodes: Vec<NodeProto>,
    initializer: Vec<TensorProto>,
    output: &str,
) -> ModelProto {
    let graph = GraphProto {
        name: "test".into(),
        node: nodes,
        initializer,
        input: vec![value_info(input, Some(input_shape))],
        output: vec![value_info(output, None)],
        ..GraphProto::default()
    };
    ModelProto {
        ir_version: 7,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 13,
            ..OperatorSetIdProto::default()
        }],
        producer_name: "tract-convert-tests".into(),
        graph: Some(graph),
        ..ModelProto::default()
    }
}

/// A SqueezeNext-like classifier on 3x16x16 images, 10 classes.
///
/// Explicitly padded stem convolution, batch norm, depthwise convolution with a
/// residual add, max and average pooling, 1x1 convolution, global pooling,
/// flatten, fully connected and softmax.
pub fn tiny_classifier() -> ModelProto {
    tiny_classifier_with_salt(0)
}

/// [`tiny_classifier`] with other weights.
pub fn tiny_classifier_with_salt(salt: usize) -> ModelProto {
    let nodes = vec![
        node(
            "Conv",
            "stem",
            &["data", "stem.w", "stem.b"],
            vec![
                ints("kernel_shape", &[3, 3]),
                ints("strides", &[2, 2]),
                ints("pads", &[1, 1, 1, 1]),
            ],
        ),
        node(
            "BatchNormalization",
            "stem_bn",
            &["stem", "bn.g", "bn.b", "bn.m", "bn.v"],
            vec![float("epsilon", 1e-5)],
        ),
        node("Relu", "stem_relu", &["stem_bn"], vec![]),
        node(
            "Conv",
            "dw",
            &["stem_relu", "dw.w"],
            vec![ints("kernel_shape", &[3, 3]), int("group", 8), ints("pads", &[1, 1, 1, 1])],
        ),
        node("Add", "residual", &["dw", "stem_relu"], vec![]),
        node(
            "MaxPool",
            "pool",
            &["residual"],
            vec![ints("kernel_shape", &[2, 2]), ints("strides", &[2, 2])],
        ),
        node(
            "AveragePool",
            "smooth",
            &["pool"],
            vec![
                ints("kernel_shape", &[3, 3]),
                ints("pads", &[1, 1, 1, 1]),
                int("count_include_pad", 1),
            ],
        ),
        node("Conv", "squeeze", &["smooth", "sq.w", "sq.b"], vec![ints("kernel_shape", &[1, 1])]),
        node("GlobalAveragePool", "gap", &["squeeze"], vec![]),
        node("Flatten", "flat", &["gap"], vec![int("axis", 1)]),
        node("Gemm", "fc", &["flat", "fc.w", "fc.b"], vec![int("transB", 1)]),
        node("Softmax", "prob", &["fc"], vec![int("axis", 1)]),
    ];
    let initializer = vec![
        weights("stem.w", &[8, 3, 3, 3], salt),
        weights("stem.b", &[8], salt + 1),
        weights("bn.g", &[8], salt + 2),
        weights("bn.b", &[8], salt + 3),
        weights("bn.m", &[8], salt + 4),
        floats("bn.v", &[8], (0..8).map(|i| 0.5 + i as f32 / 8.0).collect()),
        weights("dw.w", &[8, 1, 3, 3], salt + 5),
        weights("sq.w", &[4, 8, 1, 1], salt + 6),
        weights("sq.b", &[4], salt + 7),
        weights("fc.w", &[10, 4], salt + 8),
        weights("fc.b", &[10], salt + 9),
    ];
    model("data", &[1, 3, 16, 16], nodes, initializer, "prob")
}

/// Parameters of [`tiny_classifier`]: (trainable, non trainable).
pub const TINY_PARAMS: (usize, usize) = (224 + 16 + 72 + 36 + 50, 16);

pub fn write_model(model: &ModelProto, path: impl AsRef<Path>) {
    std::fs::write(path, model.encode_to_vec()).unwrap();
}

pub fn int64s(name: &str, dims: &[i64], data: Vec<i64>) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: DataType::Int64 as i32,
        int64_data: data,
        ..TensorProto::default()
    }
}

pub fn tensor_attr(name: &str, t: TensorProto) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: AttributeType::Tensor as i32,
        t: Some(t),
        ..AttributeProto::default()
    }
}

pub fn str_attr(name: &str, s: &str) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: AttributeType::String as i32,
        s: s.as_bytes().to_vec(),
        ..AttributeProto::default()
    }
}
