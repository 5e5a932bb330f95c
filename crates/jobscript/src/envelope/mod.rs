//! Envelope codec: the external JSON payload for job invocations
//!
//! An [`Envelope`] carries who asked for the run (actor), on whose behalf
//! (scope), and the parameters for the invocation. Encoding and decoding
//! both enforce a size ceiling and run validation; an optional sanitizer
//! scrubs parameters, always over a defensive copy so caller-owned maps are
//! never mutated.

mod result;

pub use result::{
    decode_result, encode_result, JsonResultCodec, ResultCodec, ResultCodecOptions,
    DEFAULT_RESULT_MAX_BYTES,
};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{codes, FieldError, JobError, JobResult};
use crate::model::ExecutionMessage;

/// Encoded envelope ceiling unless overridden.
pub const DEFAULT_ENVELOPE_MAX_BYTES: usize = 64 * 1024;

/// Longest accepted idempotency key, in bytes.
pub const MAX_IDEMPOTENCY_KEY_LENGTH: usize = ExecutionMessage::MAX_IDEMPOTENCY_KEY_LEN;

/// Scrubs a parameter map before encode / after decode. Receives a defensive
/// copy and may mutate it freely.
pub type EnvelopeSanitizer =
    Arc<dyn Fn(HashMap<String, Value>) -> HashMap<String, Value> + Send + Sync>;

/// Who initiated the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Actor {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub resource_roles: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub impersonator_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_impersonated: bool,
}

/// Tenant/organization scoping for the invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub organization_id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.tenant_id.is_empty() && self.organization_id.is_empty() && self.labels.is_empty()
    }
}

/// The wire payload for one job invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(skip_serializing_if = "Scope::is_empty")]
    pub scope: Scope,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    /// Observed size of the raw payload after a decode. Not serialized.
    #[serde(skip)]
    pub raw_content_bytes: usize,
}

impl Envelope {
    /// Basic constraints: bounded idempotency key, impersonation implies an
    /// impersonator id.
    pub fn validate(&self) -> JobResult<()> {
        let mut fields = Vec::new();

        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LENGTH {
            fields.push(
                FieldError::new(
                    "idempotency_key",
                    format!("must be at most {MAX_IDEMPOTENCY_KEY_LENGTH} characters"),
                )
                .with_value(self.idempotency_key.len() as i64),
            );
        }

        if let Some(actor) = &self.actor {
            if actor.is_impersonated && actor.impersonator_id.is_empty() {
                fields.push(FieldError::new(
                    "actor.impersonator_id",
                    "must be set when actor is impersonated",
                ));
            }
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(JobError::validation("envelope validation failed", fields))
        }
    }

    /// Build an execution message for `job_id` carrying this envelope's
    /// params and idempotency key. An empty job id means no message can be
    /// formed at all.
    pub fn into_execution_message(self, job_id: &str) -> JobResult<ExecutionMessage> {
        if job_id.is_empty() {
            return Err(JobError::bad_input(
                codes::JOB_EXEC_MSG_NIL,
                "execution message required",
            ));
        }
        let mut msg = ExecutionMessage::new(job_id);
        msg.parameters = self.params;
        msg.idempotency_key = self.idempotency_key;
        Ok(msg)
    }
}

/// Encode/decode configuration: size ceiling and optional sanitizer.
#[derive(Clone)]
pub struct EnvelopeCodec {
    max_bytes: usize,
    sanitizer: Option<EnvelopeSanitizer>,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_ENVELOPE_MAX_BYTES,
            sanitizer: None,
        }
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum allowed encoded size in bytes. Zero disables
    /// the ceiling.
    pub fn with_max_bytes(mut self, limit: usize) -> Self {
        self.max_bytes = limit;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: EnvelopeSanitizer) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Marshal the envelope to JSON applying validation, sanitization, and
    /// the size ceiling. The caller's envelope is left untouched.
    pub fn encode(&self, env: &Envelope) -> JobResult<Vec<u8>> {
        env.validate()?;

        let mut working = env.clone();
        working.params = self.sanitize(&env.params);

        let payload = serde_json::to_vec(&working).map_err(|e| {
            JobError::internal(codes::VALIDATION_FAILED, "encode envelope").with_source(e)
        })?;

        self.check_size(payload.len())?;
        Ok(payload)
    }

    /// Unmarshal JSON into an [`Envelope`], enforcing the size ceiling and
    /// validation, and recording the observed raw size.
    pub fn decode(&self, data: &[u8]) -> JobResult<Envelope> {
        self.check_size(data.len())?;

        let mut env: Envelope = serde_json::from_slice(data).map_err(|e| {
            JobError::bad_input(codes::VALIDATION_FAILED, "decode envelope").with_source(e)
        })?;

        env.raw_content_bytes = data.len();
        env.params = self.sanitize(&env.params);
        env.validate()?;

        Ok(env)
    }

    /// The sanitizer always runs over a fresh copy; callers never observe
    /// mutation of the map they handed in.
    fn sanitize(&self, params: &HashMap<String, Value>) -> HashMap<String, Value> {
        let copy = params.clone();
        match &self.sanitizer {
            Some(sanitizer) => sanitizer(copy),
            None => copy,
        }
    }

    fn check_size(&self, size: usize) -> JobResult<()> {
        if self.max_bytes > 0 && size > self.max_bytes {
            return Err(JobError::validation(
                "envelope exceeds maximum bytes",
                vec![FieldError::new(
                    "envelope",
                    format!(
                        "encoded envelope size {size} exceeds limit {} bytes",
                        self.max_bytes
                    ),
                )
                .with_value(size as i64)],
            ));
        }
        Ok(())
    }
}

/// Encode with the default codec configuration.
pub fn encode_envelope(env: &Envelope) -> JobResult<Vec<u8>> {
    EnvelopeCodec::default().encode(env)
}

/// Decode with the default codec configuration.
pub fn decode_envelope(data: &[u8]) -> JobResult<Envelope> {
    EnvelopeCodec::default().decode(data)
}
