//! Result codec: execution outcomes on the wire

use std::sync::Arc;

use crate::errors::{FieldError, JobError, JobResult};
use crate::model::ExecutionResult;

/// Encoded result ceiling unless overridden.
pub const DEFAULT_RESULT_MAX_BYTES: usize = 32 * 1024;

/// Pluggable serialization for result payloads.
pub trait ResultCodec: Send + Sync {
    fn marshal(&self, result: &ExecutionResult) -> JobResult<Vec<u8>>;
    fn unmarshal(&self, data: &[u8]) -> JobResult<ExecutionResult>;
}

/// The default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResultCodec;

impl ResultCodec for JsonResultCodec {
    fn marshal(&self, result: &ExecutionResult) -> JobResult<Vec<u8>> {
        serde_json::to_vec(result).map_err(|e| {
            JobError::internal(crate::errors::codes::VALIDATION_FAILED, "encode result")
                .with_source(e)
        })
    }

    fn unmarshal(&self, data: &[u8]) -> JobResult<ExecutionResult> {
        serde_json::from_slice(data).map_err(|e| {
            JobError::bad_input(crate::errors::codes::VALIDATION_FAILED, "decode result")
                .with_source(e)
        })
    }
}

/// Encode/decode configuration: ceiling plus codec.
#[derive(Clone)]
pub struct ResultCodecOptions {
    max_bytes: usize,
    codec: Arc<dyn ResultCodec>,
}

impl Default for ResultCodecOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_RESULT_MAX_BYTES,
            codec: Arc::new(JsonResultCodec),
        }
    }
}

impl ResultCodecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum allowed encoded size in bytes. Zero disables
    /// the ceiling.
    pub fn with_max_bytes(mut self, limit: usize) -> Self {
        self.max_bytes = limit;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ResultCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn encode(&self, result: &ExecutionResult) -> JobResult<Vec<u8>> {
        validate_result(result)?;

        let payload = self.codec.marshal(result)?;
        self.check_size(payload.len())?;
        Ok(payload)
    }

    pub fn decode(&self, data: &[u8]) -> JobResult<ExecutionResult> {
        self.check_size(data.len())?;

        let result = self.codec.unmarshal(data)?;
        validate_result(&result)?;
        Ok(result)
    }

    fn check_size(&self, size: usize) -> JobResult<()> {
        if self.max_bytes > 0 && size > self.max_bytes {
            return Err(JobError::validation(
                "result exceeds maximum bytes",
                vec![FieldError::new(
                    "result",
                    format!(
                        "encoded result size {size} exceeds limit {} bytes",
                        self.max_bytes
                    ),
                )
                .with_value(size as i64)],
            ));
        }
        Ok(())
    }
}

fn validate_result(result: &ExecutionResult) -> JobResult<()> {
    let mut fields = Vec::new();

    if result.size < 0 {
        fields.push(
            FieldError::new("size", "must be non-negative").with_value(result.size),
        );
    }
    if result.duration < 0 {
        fields.push(
            FieldError::new("duration", "must be non-negative").with_value(result.duration),
        );
    }

    if fields.is_empty() {
        Ok(())
    } else {
        Err(JobError::validation("result validation failed", fields))
    }
}

/// Encode with the default codec configuration.
pub fn encode_result(result: &ExecutionResult) -> JobResult<Vec<u8>> {
    ResultCodecOptions::default().encode(result)
}

/// Decode with the default codec configuration.
pub fn decode_result(data: &[u8]) -> JobResult<ExecutionResult> {
    ResultCodecOptions::default().decode(data)
}
