//! # Viewcalc Ext JSON
//!
//! JSON codec for the remote calculation node wire.
//!
//! This crate provides a JSON implementation of the [`Codec`] trait. Jobs,
//! job items and job results are marshalled with it before they cross to a
//! calculation node in another process.

#![warn(missing_docs)]
#![warn(clippy::all)]

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use viewcalc_traits::error::TraitError;
use viewcalc_traits::transport::Codec;

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TraitError> {
    serde_json::from_slice(bytes)
        .map_err(|e| TraitError::ParseError(format!("{} bytes of JSON: {}", bytes.len(), e)))
}

fn encoded(result: serde_json::Result<Vec<u8>>) -> Result<Bytes, TraitError> {
    result
        .map(Bytes::from)
        .map_err(|e| TraitError::SerializationError(e.to_string()))
}

/// Compact JSON codec; the default on the remote node wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, TraitError> {
        encoded(serde_json::to_vec(value))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TraitError> {
        decode_json(bytes)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Indented JSON, for capturing jobs in logs. Reads anything [`JsonCodec`] writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyJsonCodec;

impl PrettyJsonCodec {
    /// Create a new pretty JSON codec.
    pub fn new() -> Self {
        Self
    }
}

impl Codec for PrettyJsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, TraitError> {
        encoded(serde_json::to_vec_pretty(value))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TraitError> {
        decode_json(bytes)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use viewcalc_traits::*;

    fn job() -> CalculationJob {
        CalculationJob {
            specification: CalculationJobSpecification::new(
                ViewName::new("Rates"),
                CalcConfigName::new("Default"),
                BatchId(9),
                JobId(101),
            ),
            items: vec![CalculationJobItem::new(
                FunctionId::new("SwapPV"),
                ComputationTargetRef::new("SWAP-1"),
                vec![ValueSpecification::new("DiscountCurve", "USD")],
                vec![ValueSpecification::new("PresentValue", "SWAP-1")],
            )],
        }
    }

    #[test]
    fn test_job_survives_the_wire() {
        let codec = JsonCodec::new();
        let original = job();

        let encoded = codec.encode(&original).unwrap();
        let decoded: CalculationJob = codec.decode(&encoded).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn test_result_survives_the_wire() {
        let codec = PrettyJsonCodec::new();
        let result = JobResult::success(
            job().specification,
            vec![JobItemResult {
                values: vec![ComputedValue::new(
                    ValueSpecification::new("PresentValue", "SWAP-1"),
                    CalculatedValue::Decimal(dec!(1250.5)),
                )],
                execution_time_us: 12,
            }],
            "remote-1",
        );

        let encoded = codec.encode(&result).unwrap();
        assert!(std::str::from_utf8(&encoded).unwrap().contains('\n'));
        let decoded: JobResult = codec.decode(&encoded).unwrap();

        assert_eq!(decoded.specification.job_id, JobId(101));
        assert_eq!(decoded.node_name, "remote-1");
        match decoded.outcome {
            JobOutcome::Success(items) => {
                assert_eq!(items[0].values[0].value.as_f64(), Some(1250.5));
            }
            JobOutcome::Failure(f) => panic!("unexpected failure: {f}"),
        }
    }

    #[test]
    fn test_malformed_bytes() {
        let codec = JsonCodec::new();
        let err = codec.decode::<JobResult>(b"{not json").unwrap_err();
        assert!(matches!(err, TraitError::ParseError(_)));
        assert!(err.to_string().contains("9 bytes of JSON"));
    }

    #[test]
    fn test_content_type() {
        let codec = JsonCodec::new();
        assert_eq!(codec.content_type(), "application/json");
    }
}
