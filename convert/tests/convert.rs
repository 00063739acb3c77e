mod utils;

use tract_convert::graph;
use tract_convert::prelude::*;
use tract_convert::tract_onnx::pb::ModelProto;

use utils::*;

fn source(proto: ModelProto, shape: InputShape) -> SourceModel {
    SourceModel::new("test", proto, shape).unwrap()
}

fn options(shape: InputShape, policy: NamePolicy) -> ConvertOptions {
    ConvertOptions::new(shape, false, policy)
}

/// Largest absolute difference between the source model and its conversion.
fn conversion_error(proto: ModelProto, shape: InputShape) -> f32 {
    setup_test_logger();
    let source = source(proto, shape);
    let mut converted = convert(&source, &options(shape, NamePolicy::Renumerate)).unwrap();
    let input = random_input(shape, Some(3)).unwrap();
    let reference = source.forward(&input).unwrap();
    let output = converted.predict(&input).unwrap();
    compare(&reference, &output).unwrap().max_abs
}

/// Gated 1x1 convolution, concatenation with the input, SAME max pooling, global
/// max pooling, flatten through a folded shape computation, then an affine map.
fn gated() -> ModelProto {
    let nodes = vec![
        node("Conv", "a", &["x", "a.w"], vec![ints("kernel_shape", &[1, 1])]),
        node("Sigmoid", "g", &["a"], vec![]),
        node("Mul", "m", &["a", "g"], vec![]),
        node("Concat", "cat", &["m", "x"], vec![int("axis", 1)]),
        node(
            "MaxPool",
            "p",
            &["cat"],
            vec![
                ints("kernel_shape", &[3, 3]),
                ints("strides", &[2, 2]),
                str_attr("auto_pad", "SAME_UPPER"),
            ],
        ),
        node("GlobalMaxPool", "gmp", &["p"], vec![]),
        node("Shape", "shape", &["gmp"], vec![]),
        node("Gather", "batch", &["shape", "zero"], vec![int("axis", 0)]),
        node("Unsqueeze", "batch1", &["batch", "axes0"], vec![]),
        node("Constant", "minus", &[], vec![tensor_attr("value", int64s("", &[1], vec![-1]))]),
        node("Concat", "target", &["batch1", "minus"], vec![int("axis", 0)]),
        node("Reshape", "flat", &["gmp", "target"], vec![]),
        node("MatMul", "mm", &["flat", "mm.w"], vec![]),
        node("Sub", "out", &["mm", "off"], vec![]),
    ];
    let initializer = vec![
        weights("a.w", &[4, 4, 1, 1], 0),
        int64s("zero", &[], vec![0]),
        int64s("axes0", &[1], vec![0]),
        weights("mm.w", &[8, 3], 1),
        weights("off", &[3], 2),
    ];
    model("x", &[1, 4, 6, 6], nodes, initializer, "out")
}

#[test]
fn tiny_classifier_is_equivalent() {
    assert!(conversion_error(tiny_classifier(), InputShape::square(16)) < 1e-4);
}

#[test]
fn gated_is_equivalent() {
    assert!(conversion_error(gated(), InputShape::new(4, 6, 6)) < 1e-4);
}

#[test]
fn layer_summary() {
    let shape = InputShape::square(16);
    let options = options(shape, NamePolicy::Renumerate);
    let converted = convert(&source(tiny_classifier(), shape), &options).unwrap();
    assert_eq!((converted.trainable_params(), converted.non_trainable_params()), TINY_PARAMS);
    assert_eq!(converted.layers[0].kind, "InputLayer");
    assert_eq!(converted.layers[0].output_shape, vec![1, 3, 16, 16]);
    let last = converted.layers.last().unwrap();
    assert_eq!(last.kind, "Softmax");
    assert_eq!(last.output_shape, vec![1, 10]);
    assert!(converted.layers.iter().any(|l| l.kind == "DepthwiseConv2D"));
    assert!(converted.layers.iter().any(|l| l.kind == "BatchNormalization"));
    assert!(converted.summary().contains("Trainable params: 398"));
}

#[test]
fn weights_are_variables() {
    let shape = InputShape::square(16);
    let options = options(shape, NamePolicy::Renumerate);
    let converted = convert(&source(tiny_classifier(), shape), &options).unwrap();
    let session = &converted.session;
    let variables = session.global_variables();
    assert_eq!(variables.len(), 11);
    for v in variables {
        assert!(v.starts_with("LAYER_"), "{}", v);
        assert!(session.variable(v).is_some(), "{} was not assigned", v);
        assert!(session.node(&format!("{}/read", v)).is_some());
        assert!(session.node(&format!("{}/Assign", v)).is_some());
    }
}

#[test]
fn kept_names() {
    let shape = InputShape::square(16);
    let options = options(shape, NamePolicy::Keep);
    let converted = convert(&source(tiny_classifier(), shape), &options).unwrap();
    let graph = converted.session.graph();
    assert!(graph::node_by_name(graph, "stem/kernel").is_ok());
    assert!(graph::node_by_name(graph, "stem_bn/gamma").is_ok());
    assert!(converted.output_names[0].starts_with("prob/"));
    assert!(!graph.node.iter().any(|n| n.name.starts_with("LAYER_")));
}

#[test]
fn frozen_graph_matches_session() {
    let shape = InputShape::new(4, 6, 6);
    let options = options(shape, NamePolicy::Renumerate);
    let mut converted = convert(&source(gated(), shape), &options).unwrap();
    let input = random_input(shape, Some(11)).unwrap();
    let expected = converted.predict(&input).unwrap();
    let frozen =
        freeze_session(&converted.session, &[] as &[&str], &converted.output_names, true).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_graph(&frozen, dir.path(), "saved_model.pb", false).unwrap();
    let output = &converted.output_names[0];
    let d = tract_convert::verify::verify_frozen(&path, output, &input, &expected).unwrap();
    assert!(d.within(1e-4), "{:?}", d);
}

#[test]
fn explicit_padding_reloads() {
    setup_test_logger();
    let shape = InputShape::square(16);
    let options = options(shape, NamePolicy::Renumerate);
    let mut converted = convert(&source(tiny_classifier(), shape), &options).unwrap();
    let graph = converted.session.graph();
    assert!(graph.node.iter().all(|n| n.op != "Pad"));
    assert!(graph::node_by_name(graph, "LAYER_0/pad_rows").is_ok());
    let input = random_input(shape, Some(5)).unwrap();
    let expected = converted.predict(&input).unwrap();
    let frozen =
        freeze_session(&converted.session, &[] as &[&str], &converted.output_names, true).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_graph(&frozen, dir.path(), "saved_model.pb", false).unwrap();
    let output = &converted.output_names[0];
    let d = tract_convert::verify::verify_frozen(&path, output, &input, &expected).unwrap();
    assert!(d.within(1e-4), "{:?}", d);
}

#[test]
fn unsupported_operator() {
    let nodes = vec![node("Tanh", "t", &["x"], vec![])];
    let shape = InputShape::new(2, 3, 3);
    let proto = model("x", &[1, 2, 3, 3], nodes, vec![], "t");
    let err = convert(&source(proto, shape), &options(shape, NamePolicy::Renumerate)).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConvertError>(),
        Some(&ConvertError::UnsupportedOp { node: "t".into(), op: "Tanh".into() })
    );
}

#[test]
fn wrong_input_shape() {
    let shape = InputShape::square(16);
    let options = options(InputShape::square(32), NamePolicy::Renumerate);
    let err = convert(&source(tiny_classifier(), shape), &options);
    assert!(err.is_err());
}
