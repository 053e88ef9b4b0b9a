use std::path::Path;

use super::{check_framing, dequantize, pad_byte, padding_len, ExportShape, ExportSpec, NetworkParams};
use crate::error::ExportError;

/// A parsed blob of known shape, as the inference runtime sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedNetwork {
    pub shape: ExportShape,
    pub ft_weight: Vec<i16>,
    pub ft_bias: Vec<i16>,
    pub value_weight: Vec<f32>,
    pub value_bias: f32,
    pub policy_weight: Vec<f32>,
    pub policy_bias: Vec<f32>,
}

struct Fields<'a> {
    bytes: &'a [u8],
}

impl<'a> Fields<'a> {
    fn split(&mut self, len: usize) -> &'a [u8] {
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        head
    }

    fn i16s(&mut self, count: usize) -> Vec<i16> {
        self.split(count * 2)
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn f32s(&mut self, count: usize) -> Vec<f32> {
        self.split(count * 4)
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl QuantizedNetwork {
    /// Total blob size for `shape`, padding included.
    pub fn expected_len(shape: &ExportShape, spec: &ExportSpec) -> usize {
        let payload = shape.payload_len();
        payload + padding_len(payload, spec.alignment.max(1))
    }

    pub fn from_bytes(
        bytes: &[u8],
        shape: ExportShape,
        spec: &ExportSpec,
    ) -> Result<Self, ExportError> {
        check_framing(spec)?;

        let expected = Self::expected_len(&shape, spec);
        if bytes.len() != expected {
            return Err(ExportError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let payload = shape.payload_len();
        for (i, &found) in bytes[payload..].iter().enumerate() {
            let expected = pad_byte(&spec.pad_pattern, i);
            if found != expected {
                return Err(ExportError::BadPadding {
                    offset: payload + i,
                    expected,
                    found,
                });
            }
        }

        let (input, hidden, outputs) = (shape.input_size, shape.hidden_size, shape.policy_outputs);
        let mut fields = Fields { bytes };

        Ok(Self {
            shape,
            ft_weight: fields.i16s(input * hidden),
            ft_bias: fields.i16s(hidden),
            value_weight: fields.f32s(hidden),
            value_bias: fields.f32s(1)[0],
            policy_weight: fields.f32s(outputs * hidden),
            policy_bias: fields.f32s(outputs),
        })
    }

    pub fn read(path: &Path, shape: ExportShape, spec: &ExportSpec) -> Result<Self, ExportError> {
        Self::from_bytes(&std::fs::read(path)?, shape, spec)
    }

    /// Back to full precision, with the feature transformer divided by `q`.
    pub fn dequantize(&self, q: i32) -> NetworkParams {
        NetworkParams {
            shape: self.shape,
            ft_weight: dequantize(&self.ft_weight, q),
            ft_bias: dequantize(&self.ft_bias, q),
            value_weight: self.value_weight.clone(),
            value_bias: vec![self.value_bias],
            policy_weight: self.policy_weight.clone(),
            policy_bias: self.policy_bias.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::export_bytes;

    fn shape() -> ExportShape {
        ExportShape {
            input_size: 6,
            hidden_size: 4,
            policy_outputs: 3,
        }
    }

    fn params() -> NetworkParams {
        let ramp = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|i| (i as f32 - n as f32 / 2.0) * scale).collect()
        };
        NetworkParams {
            shape: shape(),
            ft_weight: ramp(24, 0.25),
            ft_bias: ramp(4, 1.5),
            value_weight: ramp(4, 0.3),
            value_bias: vec![0.125],
            policy_weight: ramp(12, -0.7),
            policy_bias: ramp(3, 2.0),
        }
    }

    #[test]
    fn reads_back_what_was_exported() {
        let spec = ExportSpec {
            ft_q: 181,
            ft_max_weight: 5.48,
            alignment: 64,
            pad_pattern: b"STARWAY".to_vec(),
        };
        let params = params();
        let bytes = export_bytes(&params, &spec).unwrap();

        let network = QuantizedNetwork::from_bytes(&bytes, shape(), &spec).unwrap();
        assert_eq!(network.ft_weight[0], (-3.0f32 * 181.0) as i16);
        assert_eq!(network.value_bias, 0.125);
        assert_eq!(network.policy_weight, params.policy_weight);

        let restored = network.dequantize(spec.ft_q);
        for (a, b) in restored.ft_weight.iter().zip(&params.ft_weight) {
            assert!((a - b).abs() <= 1.0 / 362.0 + 1e-5);
        }
    }

    #[test]
    fn detects_corrupt_padding_and_wrong_length() {
        let spec = ExportSpec {
            ft_q: 181,
            ft_max_weight: 5.48,
            alignment: 64,
            pad_pattern: b"STARWAY".to_vec(),
        };
        let mut bytes = export_bytes(&params(), &spec).unwrap();

        let err = QuantizedNetwork::from_bytes(&bytes[..bytes.len() - 64], shape(), &spec).unwrap_err();
        assert!(matches!(err, ExportError::LengthMismatch { .. }));

        let last = bytes.len() - 1;
        bytes[last] = 0;
        let err = QuantizedNetwork::from_bytes(&bytes, shape(), &spec).unwrap_err();
        assert!(matches!(err, ExportError::BadPadding { found: 0, .. }));
    }
}
