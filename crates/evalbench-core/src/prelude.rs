//! Common imports for typical evaluation code.
pub use crate::{
    BatchEvent, BatchRequest, BatchStatus, CallOutcome, CallStatus, ComparisonEvent,
    ComparisonGroupSpec, ComparisonStatus, EvalConfig, EvalError, Evaluator, GenerationParams,
    Group, InputPayload, MediaRef, Modality, ModelTarget, StreamEvent,
};
