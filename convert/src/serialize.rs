//! Writing and reading graph definitions.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use prost::Message;
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb::tensorflow::attr_value::Value;
use tract_tensorflow::tfpb::tensorflow::{
    AttrValue, DataType, GraphDef, TensorProto, TensorShapeProto,
};

/// Writes `graph` as `dir/name`, creating `dir` if needed and replacing any existing file.
pub fn write_graph(
    graph: &GraphDef,
    dir: impl AsRef<Path>,
    name: &str,
    as_text: bool,
) -> TractResult<PathBuf> {
    let dir = dir.as_ref();
    fs_err::create_dir_all(dir)?;
    let path = dir.join(name);
    let bytes = if as_text { to_text(graph).into_bytes() } else { graph.encode_to_vec() };
    fs_err::write(&path, &bytes)?;
    info!("Wrote {} ({} nodes, {} bytes)", path.display(), graph.node.len(), bytes.len());
    Ok(path)
}

/// Reads a binary graph definition.
pub fn read_graph(path: impl AsRef<Path>) -> TractResult<GraphDef> {
    let path = path.as_ref();
    let bytes = fs_err::read(path)?;
    GraphDef::decode(&*bytes)
        .with_context(|| format!("Decoding graph definition {}", path.display()))
}

fn data_type_name(dt: i32) -> String {
    match DataType::from_i32(dt) {
        Some(DataType::DtFloat) => "DT_FLOAT".to_string(),
        Some(DataType::DtDouble) => "DT_DOUBLE".to_string(),
        Some(DataType::DtInt32) => "DT_INT32".to_string(),
        Some(DataType::DtInt64) => "DT_INT64".to_string(),
        Some(DataType::DtBool) => "DT_BOOL".to_string(),
        Some(DataType::DtString) => "DT_STRING".to_string(),
        _ => dt.to_string(),
    }
}

fn escape(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'"' => s.push_str("\\\""),
            b'\\' => s.push_str("\\\\"),
            b'\n' => s.push_str("\\n"),
            0x20..=0x7e => s.push(b as char),
            _ => {
                let _ = write!(s, "\\{:03o}", b);
            }
        }
    }
    s
}

struct Printer {
    out: String,
    depth: usize,
}

impl Printer {
    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn open(&mut self, name: &str) {
        self.line(format!("{} {{", name));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth -= 1;
        self.line("}");
    }

    fn shape(&mut self, name: &str, shape: &TensorShapeProto) {
        self.open(name);
        for dim in &shape.dim {
            self.open("dim");
            self.line(format!("size: {}", dim.size));
            self.close();
        }
        if shape.unknown_rank {
            self.line("unknown_rank: true");
        }
        self.close();
    }

    fn tensor(&mut self, name: &str, t: &TensorProto) {
        self.open(name);
        self.line(format!("dtype: {}", data_type_name(t.dtype)));
        if let Some(shape) = &t.tensor_shape {
            self.shape("tensor_shape", shape);
        }
        if !t.tensor_content.is_empty() {
            self.line(format!("tensor_content: \"{}\"", escape(&t.tensor_content)));
        }
        for f in &t.float_val {
            self.line(format!("float_val: {}", f));
        }
        for i in &t.int_val {
            self.line(format!("int_val: {}", i));
        }
        for i in &t.int64_val {
            self.line(format!("int64_val: {}", i));
        }
        self.close();
    }

    fn attr_value(&mut self, value: &AttrValue) {
        self.open("value");
        match &value.value {
            Some(Value::S(s)) => self.line(format!("s: \"{}\"", escape(s))),
            Some(Value::I(i)) => self.line(format!("i: {}", i)),
            Some(Value::F(f)) => self.line(format!("f: {}", f)),
            Some(Value::B(b)) => self.line(format!("b: {}", b)),
            Some(Value::Type(t)) => self.line(format!("type: {}", data_type_name(*t))),
            Some(Value::Shape(shape)) => self.shape("shape", shape),
            Some(Value::Tensor(t)) => self.tensor("tensor", t),
            Some(Value::List(list)) => {
                self.open("list");
                for s in &list.s {
                    self.line(format!("s: \"{}\"", escape(s)));
                }
                for i in &list.i {
                    self.line(format!("i: {}", i));
                }
                for f in &list.f {
                    self.line(format!("f: {}", f));
                }
                for b in &list.b {
                    self.line(format!("b: {}", b));
                }
                for t in &list.r#type {
                    self.line(format!("type: {}", data_type_name(*t)));
                }
                for shape in &list.shape {
                    self.shape("shape", shape);
                }
                self.close();
            }
            Some(_) => warn!("Attribute value {:?} has no text form, skipped", value),
            None => (),
        }
        self.close();
    }
}

/// Protobuf text form of a graph, map entries sorted by key.
pub fn to_text(graph: &GraphDef) -> String {
    let mut p = Printer { out: String::new(), depth: 0 };
    for node in &graph.node {
        p.open("node");
        p.line(format!("name: \"{}\"", escape(node.name.as_bytes())));
        p.line(format!("op: \"{}\"", escape(node.op.as_bytes())));
        for input in &node.input {
            p.line(format!("input: \"{}\"", escape(input.as_bytes())));
        }
        if !node.device.is_empty() {
            p.line(format!("device: \"{}\"", escape(node.device.as_bytes())));
        }
        let mut keys: Vec<&String> = node.attr.keys().collect();
        keys.sort();
        for key in keys {
            p.open("attr");
            p.line(format!("key: \"{}\"", escape(key.as_bytes())));
            p.attr_value(&node.attr[key]);
            p.close();
        }
        p.close();
    }
    if let Some(versions) = &graph.versions {
        p.open("versions");
        p.line(format!("producer: {}", versions.producer));
        p.close();
    }
    p.out
}
