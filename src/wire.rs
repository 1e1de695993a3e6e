//! Wire adapters (§4.D): conversions between the generated protobuf types
//! and the internal [`Tensor`]/[`Instance`] model, plus the `PredictReply`
//! error-list merge rule.
use std::collections::HashMap;

use crate::error::ErrorCode;
use crate::instance::{ErrorSlot, Instance, Phase};
use crate::proto;
use crate::tensor::{DataType, Tensor};

/// Convert a wire [`proto::Tensor`] into an internal [`Tensor`].
pub fn tensor_from_wire(t: &proto::Tensor) -> Result<Tensor, crate::error::TensorError> {
    let dtype = DataType::from_str(&t.dtype)?;
    if dtype.is_string_like() {
        let value = t
            .bytes_val
            .first()
            .cloned()
            .ok_or(crate::error::TensorError::InvalidBytesValCount(t.bytes_val.len()))?;
        Tensor::new_string_like(dtype, t.dims.clone(), value)
    } else {
        Tensor::new_owned(dtype, t.dims.clone(), t.data.clone())
    }
}

/// Convert an internal [`Tensor`] into its wire representation.
pub fn tensor_to_wire(t: &Tensor) -> proto::Tensor {
    if t.data_type().is_string_like() {
        proto::Tensor {
            dtype: t.data_type().as_str().to_string(),
            dims: t.shape().to_vec(),
            data: Vec::new(),
            bytes_val: t.bytes_val().to_vec(),
        }
    } else {
        proto::Tensor {
            dtype: t.data_type().as_str().to_string(),
            dims: t.shape().to_vec(),
            data: t.as_bytes().to_vec(),
            bytes_val: Vec::new(),
        }
    }
}

/// Convert a wire [`proto::Instance`] into an internal [`Instance`],
/// placing every entry under [`Phase::Input`] — the only phase a request
/// instance can arrive carrying data for.
pub fn instance_from_wire(inst: &proto::Instance) -> Result<Instance, crate::error::TensorError> {
    instance_from_wire_as(inst, Phase::Input)
}

/// Convert a wire [`proto::Instance`] into an internal [`Instance`],
/// placing every entry under the given `phase` instead of always
/// [`Phase::Input`] — used when the wire instance actually represents an
/// earlier stage's output, e.g. a distributed agent's predict reply.
pub fn instance_from_wire_as(
    inst: &proto::Instance,
    phase: Phase,
) -> Result<Instance, crate::error::TensorError> {
    let mut out = Instance::new();
    for (name, t) in &inst.items {
        out.set(phase, name.clone(), tensor_from_wire(t)?);
    }
    Ok(out)
}

/// Convert a phase's named tensors back into a wire [`proto::Instance`].
pub fn instance_to_wire(inst: &Instance, phase: Phase) -> proto::Instance {
    let items: HashMap<String, proto::Tensor> = inst
        .phase_map(phase)
        .iter()
        .map(|(name, t)| (name.clone(), tensor_to_wire(t)))
        .collect();
    proto::Instance { items }
}

fn error_msg_from_slot(slot: &ErrorSlot) -> proto::ErrorMsg {
    proto::ErrorMsg {
        code: slot.code as i32,
        message: slot.message.clone(),
    }
}

/// Apply §4.D's error-list merge rule: empty when every instance
/// succeeded; a single entry (and an empty `instances` list) when every
/// failure is identical; otherwise one entry per instance, with
/// `code == Success` standing in for instances that didn't fail.
pub fn merge_errors(slots: &[Option<ErrorSlot>]) -> Vec<proto::ErrorMsg> {
    if slots.iter().all(|s| s.is_none()) {
        return Vec::new();
    }

    let first = slots.iter().find_map(|s| s.as_ref());
    let all_identical = match first {
        Some(f) => slots.iter().all(|s| match s {
            Some(e) => e.code == f.code && e.message == f.message,
            None => false,
        }),
        None => false,
    };

    if all_identical {
        if let Some(f) = first {
            return vec![error_msg_from_slot(f)];
        }
    }

    slots
        .iter()
        .map(|s| match s {
            Some(e) => error_msg_from_slot(e),
            None => proto::ErrorMsg {
                code: ErrorCode::Success as i32,
                message: String::new(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(code: ErrorCode, msg: &str) -> ErrorSlot {
        ErrorSlot {
            code,
            message: msg.to_string(),
        }
    }

    #[test]
    fn tensor_roundtrips_through_wire() {
        let t = Tensor::new_owned(DataType::F32, vec![2], vec![0, 0, 128, 63, 0, 0, 0, 64]).unwrap();
        let wire = tensor_to_wire(&t);
        let back = tensor_from_wire(&wire).unwrap();
        assert_eq!(back.as_bytes(), t.as_bytes());
        assert_eq!(back.shape(), t.shape());
    }

    #[test]
    fn string_tensor_roundtrips_through_bytes_val() {
        let t = Tensor::new_string_like(DataType::String, vec![1], b"hello".to_vec()).unwrap();
        let wire = tensor_to_wire(&t);
        assert!(wire.data.is_empty());
        let back = tensor_from_wire(&wire).unwrap();
        assert_eq!(back.bytes_val(), &[b"hello".to_vec()]);
    }

    #[test]
    fn merge_errors_empty_when_all_succeed() {
        assert!(merge_errors(&[None, None]).is_empty());
    }

    #[test]
    fn merge_errors_collapses_identical_failures() {
        let slots = vec![
            Some(slot(ErrorCode::Failed, "oom")),
            Some(slot(ErrorCode::Failed, "oom")),
        ];
        let merged = merge_errors(&slots);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].message, "oom");
    }

    #[test]
    fn merge_errors_emits_one_entry_per_instance_when_mixed() {
        let slots = vec![None, Some(slot(ErrorCode::InvalidInputs, "bad shape"))];
        let merged = merge_errors(&slots);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].code, ErrorCode::Success as i32);
        assert_eq!(merged[1].message, "bad shape");
    }
}
