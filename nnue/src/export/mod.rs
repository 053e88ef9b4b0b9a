//! Quantized parameter blob for the inference runtime.
//!
//! The blob has no header and no length prefixes. Producer and runtime agree
//! on the layout out of band, all little-endian:
//!
//! 1. feature transformer weights, `i16 [input × hidden]`, one row per input feature
//! 2. feature transformer bias, `i16 [hidden]`
//! 3. value head weights, `f32 [hidden]`, first half then second half
//! 4. value head bias, `f32`
//! 5. policy head weights, `f32 [outputs × hidden]`, per row first half then second half
//! 6. policy head bias, `f32 [outputs]`
//!
//! The feature transformer is stored as `round(v · Q)`. The file is padded to
//! a multiple of the alignment with a repeating byte pattern.

mod reader;

pub use reader::QuantizedNetwork;

use std::path::Path;

use crate::config::NetConfig;
use crate::error::ExportError;

pub const DEFAULT_ALIGNMENT: usize = 64;
pub const DEFAULT_PAD_PATTERN: &[u8] = b"STARWAY";

/// Quantization and framing parameters shared with the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSpec {
    pub ft_q: i32,
    /// Largest feature transformer magnitude accepted for export.
    pub ft_max_weight: f32,
    pub alignment: usize,
    pub pad_pattern: Vec<u8>,
}

impl ExportSpec {
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            ft_q: config.ft_q,
            ft_max_weight: config.ft_max_weight,
            alignment: DEFAULT_ALIGNMENT,
            pad_pattern: DEFAULT_PAD_PATTERN.to_vec(),
        }
    }
}

/// Tensor sizes the runtime hard-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportShape {
    pub input_size: usize,
    pub hidden_size: usize,
    pub policy_outputs: usize,
}

impl ExportShape {
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            input_size: config.input_size(),
            hidden_size: config.hidden_size,
            policy_outputs: config.policy_output_size,
        }
    }

    /// Payload bytes before padding.
    pub fn payload_len(&self) -> usize {
        let ft = (self.input_size * self.hidden_size + self.hidden_size) * 2;
        let value = (self.hidden_size + 1) * 4;
        let policy = (self.policy_outputs * self.hidden_size + self.policy_outputs) * 4;
        ft + value + policy
    }
}

/// Full-precision parameters, flattened row-major in export order.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParams {
    pub shape: ExportShape,
    pub ft_weight: Vec<f32>,
    pub ft_bias: Vec<f32>,
    pub value_weight: Vec<f32>,
    pub value_bias: Vec<f32>,
    pub policy_weight: Vec<f32>,
    pub policy_bias: Vec<f32>,
}

impl NetworkParams {
    fn check_shapes(&self) -> Result<(), ExportError> {
        let s = &self.shape;
        let expected = [
            ("ft.weight", self.ft_weight.len(), s.input_size * s.hidden_size),
            ("ft.bias", self.ft_bias.len(), s.hidden_size),
            ("value.weight", self.value_weight.len(), s.hidden_size),
            ("value.bias", self.value_bias.len(), 1),
            ("policy.weight", self.policy_weight.len(), s.policy_outputs * s.hidden_size),
            ("policy.bias", self.policy_bias.len(), s.policy_outputs),
        ];
        for (tensor, actual, expected) in expected {
            if actual != expected {
                return Err(ExportError::ShapeMismatch {
                    tensor,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// `round(v · q)` for every value, or the first value that is outside the
/// clamp bound or does not fit in `i16`.
pub fn quantize(
    tensor: &'static str,
    values: &[f32],
    q: i32,
    bound: f32,
) -> Result<Vec<i16>, ExportError> {
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            // NaN fails this comparison as well
            if !(value.abs() <= bound) {
                return Err(ExportError::OutOfRange {
                    tensor,
                    index,
                    value,
                    bound,
                });
            }
            let scaled = (value * q as f32).round();
            if scaled < i16::MIN as f32 || scaled > i16::MAX as f32 {
                return Err(ExportError::Overflow {
                    tensor,
                    index,
                    value,
                });
            }
            Ok(scaled as i16)
        })
        .collect()
}

pub fn dequantize(values: &[i16], q: i32) -> Vec<f32> {
    values.iter().map(|&v| v as f32 / q as f32).collect()
}

/// Bytes of padding needed to bring `len` to a multiple of `alignment`.
pub fn padding_len(len: usize, alignment: usize) -> usize {
    (alignment - len % alignment) % alignment
}

/// The `index`-th padding byte.
fn pad_byte(pattern: &[u8], index: usize) -> u8 {
    pattern[index % pattern.len()]
}

fn check_framing(spec: &ExportSpec) -> Result<(), ExportError> {
    if spec.pad_pattern.is_empty() {
        return Err(ExportError::EmptyPattern);
    }
    if spec.alignment == 0 {
        return Err(ExportError::ZeroAlignment);
    }
    Ok(())
}

/// Builds the complete blob. Every value is validated before any byte is
/// produced, so an error never leaves a partial export behind.
pub fn export_bytes(params: &NetworkParams, spec: &ExportSpec) -> Result<Vec<u8>, ExportError> {
    check_framing(spec)?;
    params.check_shapes()?;

    let ft_weight = quantize("ft.weight", &params.ft_weight, spec.ft_q, spec.ft_max_weight)?;
    let ft_bias = quantize("ft.bias", &params.ft_bias, spec.ft_q, spec.ft_max_weight)?;

    let payload = params.shape.payload_len();
    let mut out = Vec::with_capacity(payload + spec.alignment);

    for v in ft_weight.iter().chain(&ft_bias) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    let dense = [
        &params.value_weight,
        &params.value_bias,
        &params.policy_weight,
        &params.policy_bias,
    ];
    for v in dense.into_iter().flatten() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    debug_assert_eq!(out.len(), payload);

    let padding = padding_len(out.len(), spec.alignment);
    out.extend((0..padding).map(|i| pad_byte(&spec.pad_pattern, i)));

    Ok(out)
}

/// Writes the blob to `path` and returns its size in bytes.
pub fn write_quantized(
    path: &Path,
    params: &NetworkParams,
    spec: &ExportSpec,
) -> Result<usize, ExportError> {
    let bytes = export_bytes(params, spec)?;
    std::fs::write(path, &bytes)?;
    log::info!("Exported {} bytes to {:?}", bytes.len(), path);
    Ok(bytes.len())
}
