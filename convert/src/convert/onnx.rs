//! Reading ONNX nodes, on top of tract-onnx's protobuf helpers.

use anyhow::ensure;
use tract_onnx::pb::NodeProto;
use tract_onnx::pb::tensor_proto::DataType as OnnxType;
use tract_onnx::prelude::tract_ndarray::IxDyn;
use tract_onnx::prelude::*;

use super::ConvertError;

pub trait NodeProtoExt {
    /// A list of non-negative integers, or `default` when absent.
    fn usizes_or(&self, name: &str, default: Vec<usize>) -> TractResult<Vec<usize>>;
    fn unsupported(&self, detail: impl Into<String>) -> anyhow::Error;
    fn display_name(&self) -> &str;
}

impl NodeProtoExt for NodeProto {
    fn usizes_or(&self, name: &str, default: Vec<usize>) -> TractResult<Vec<usize>> {
        Ok(self.get_attr_opt_tvec::<usize>(name)?.map(|v| v.into_vec()).unwrap_or(default))
    }

    fn unsupported(&self, detail: impl Into<String>) -> anyhow::Error {
        ConvertError::UnsupportedAttribute {
            node: self.display_name().to_string(),
            op: self.op_type.clone(),
            detail: detail.into(),
        }
        .into()
    }

    fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else {
            self.output.first().map(|s| &**s).unwrap_or(&*self.op_type)
        }
    }
}

/// Datum type of an ONNX `TensorProto.DataType` code, as found in `Cast`.
pub fn datum_type(code: i32) -> TractResult<DatumType> {
    let dt = OnnxType::from_i32(code)
        .ok_or_else(|| anyhow::format_err!("Unknown ONNX data type {}", code))?;
    DatumType::try_from(dt)
}

/// Normalizes a possibly negative axis.
pub fn axis(axis: i64, rank: usize) -> TractResult<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    ensure!((0..rank as i64).contains(&resolved), "Axis {} out of range for rank {}", axis, rank);
    Ok(resolved as usize)
}

pub fn permute(t: &Tensor, perm: &[usize]) -> TractResult<Tensor> {
    ensure!(
        perm.len() == t.rank(),
        "Permutation {:?} does not match rank of {:?}",
        perm,
        t.shape()
    );
    let permuted = t.to_array_view::<f32>()?.permuted_axes(IxDyn(perm));
    Ok(permuted.as_standard_layout().into_owned().into_tensor())
}
