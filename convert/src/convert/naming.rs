use std::collections::HashSet;

use tract_onnx::pb::NodeProto;

use super::onnx::NodeProtoExt;

/// How converted layers are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    /// `LAYER_0`, `LAYER_1`, ... in graph order.
    #[default]
    Renumerate,
    /// The ONNX node names, made valid TensorFlow names.
    Keep,
}

#[derive(Debug, Clone)]
pub struct Namer {
    policy: NamePolicy,
    next: usize,
    taken: HashSet<String>,
}

impl Namer {
    pub fn new(policy: NamePolicy, reserved: &[&str]) -> Namer {
        Namer { policy, next: 0, taken: reserved.iter().map(|s| s.to_string()).collect() }
    }

    /// Scope name for the next layer. Only called for nodes that emit TensorFlow nodes.
    pub fn layer(&mut self, node: &NodeProto) -> String {
        let base = match self.policy {
            NamePolicy::Renumerate => {
                let name = format!("LAYER_{}", self.next);
                self.next += 1;
                name
            }
            NamePolicy::Keep => sanitize(node.display_name()),
        };
        self.unique(&base)
    }

    pub fn unique(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        let mut suffix = 1;
        while self.taken.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        self.taken.insert(name.clone());
        name
    }
}

/// Maps an arbitrary string to a valid single-component TensorFlow node name.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '_' }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['_', '-']);
    match cleaned.chars().next() {
        None => "layer".to_string(),
        Some(c) if c.is_ascii_alphanumeric() || c == '.' => cleaned.to_string(),
        _ => format!("layer_{}", cleaned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeProto {
        NodeProto { name: name.into(), op_type: "Relu".into(), ..NodeProto::default() }
    }

    #[test]
    fn renumerate_counts_layers() {
        let mut namer = Namer::new(NamePolicy::Renumerate, &["input_0"]);
        assert_eq!(namer.layer(&node("a")), "LAYER_0");
        assert_eq!(namer.layer(&node("a")), "LAYER_1");
    }

    #[test]
    fn keep_sanitizes_and_dedups() {
        let mut namer = Namer::new(NamePolicy::Keep, &["input_0"]);
        let conv = namer.layer(&node("/features/init_block/conv/Conv"));
        assert_eq!(conv, "features_init_block_conv_Conv");
        assert_eq!(namer.layer(&node("relu 1")), "relu_1");
        assert_eq!(namer.layer(&node("relu:1")), "relu_1_1");
        assert_eq!(namer.layer(&node("input_0")), "input_0_1");
        assert_eq!(namer.layer(&node("")), "Relu");
    }

    #[test]
    fn sanitize_edge_cases() {
        assert_eq!(sanitize("___"), "layer");
        assert_eq!(sanitize(".x"), ".x");
        assert_eq!(sanitize("12"), "12");
    }
}
