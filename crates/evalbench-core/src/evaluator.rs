use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{Instrument as _, info_span, warn};

use crate::batch::{BatchRequest, BatchSequencer, BatchStream, KEYWORD_PLACEHOLDER};
use crate::compare::{ComparisonGroupSpec, ComparisonOrchestrator, ComparisonStream};
use crate::config::{DEFAULT_BASE_URL, DEFAULT_CALL_TIMEOUT, DEFAULT_STREAM_BUFFER, EvalConfig};
use crate::content::InputPayload;
use crate::credentials::{CredentialStore, Credentials, KeyStatus};
use crate::driver::{CallDriver, CallStream};
use crate::errors::EvalError;
use crate::media::{FsMediaStore, MediaMaterializer};
use crate::model::{ApiKey, GenerationParams, ModelTarget};
use crate::persist::{CallRecord, NoopSink, RecordSink, log_persist_failure};
use crate::provider::ChatProvider;
use crate::suggest::{DEFAULT_SUGGEST_MODEL, Suggester};
use crate::vendors::openai::OpenAiCompatProvider;

/// Entry point for single, comparison and batch evaluation runs.
#[derive(Clone)]
pub struct Evaluator {
    driver: CallDriver,
    credentials: Arc<CredentialStore>,
    sink: Arc<dyn RecordSink>,
    suggester: Suggester,
}

impl Evaluator {
    pub fn builder() -> EvaluatorBuilder {
        EvaluatorBuilder::default()
    }

    /// Wires the OpenAI-compatible provider, a filesystem media store and
    /// credentials from `config`.
    pub fn from_config(config: &EvalConfig) -> Result<EvaluatorBuilder, EvalError> {
        config.validate()?;
        Ok(Self::builder()
            .provider(Arc::new(OpenAiCompatProvider::new()?))
            .credentials(Arc::new(CredentialStore::from_config(config)))
            .media(Arc::new(FsMediaStore::new(config.upload_dir.clone())))
            .call_timeout(config.call_timeout)
            .stream_buffer_capacity(config.stream_buffer_capacity)
            .suggest_model(config.suggest_model.clone()))
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn set_runtime_key(&self, key: Option<ApiKey>) {
        self.credentials.set_runtime_key(key);
    }

    pub fn key_status(&self) -> KeyStatus {
        self.credentials.key_status()
    }

    /// Streams one call. A `CallRecord` is persisted once the call ends.
    pub async fn infer(
        &self,
        target: &ModelTarget,
        input: &InputPayload,
        params: &GenerationParams,
        explicit: Option<&Credentials>,
    ) -> Result<CallStream, EvalError> {
        validate_input(target, input)?;
        let mut call = self.driver.run(target, input, params, explicit).await?;

        let call_id = call.call_id();
        let target_name = target.name.clone();
        let model_id = target.model_id.clone();
        let input_text = input.text.clone();
        let media_count = input.media.len();
        let params = params.merged_over(&target.default_params);
        let (relay_tx, relay_rx) = oneshot::channel();
        let upstream = std::mem::replace(&mut call.outcome_rx, relay_rx);
        let sink = self.sink.clone();
        tokio::spawn(
            async move {
                let Ok(outcome) = upstream.await else {
                    return;
                };
                let record = CallRecord {
                    call_id,
                    target_name,
                    model_id,
                    input_text,
                    media_count,
                    params,
                    outcome: outcome.clone(),
                    recorded_at: Utc::now(),
                };
                log_persist_failure("call", sink.persist_call(&record).await);
                let _ = relay_tx.send(outcome);
            }
            .instrument(info_span!("persist_call", %call_id)),
        );
        Ok(call)
    }

    /// Runs two groups side by side on `input`.
    ///
    /// Exactly two groups are required.
    pub async fn compare(
        &self,
        groups: Vec<ComparisonGroupSpec>,
        input: &InputPayload,
    ) -> Result<ComparisonStream, EvalError> {
        let groups: [ComparisonGroupSpec; 2] = groups.try_into().map_err(|g: Vec<_>| {
            EvalError::Validation(format!("comparison needs exactly 2 groups, got {}", g.len()))
        })?;
        for group in &groups {
            validate_input(&group.target, input)?;
        }
        ComparisonOrchestrator::new(self.driver.clone(), self.sink.clone())
            .run(groups, input)
            .await
    }

    /// Starts a sequential batch.
    ///
    /// Credentials are checked up front so a missing key fails the whole
    /// batch instead of every item.
    pub fn batch(&self, request: BatchRequest) -> Result<BatchStream, EvalError> {
        if request.template.trim().is_empty() {
            return Err(EvalError::Validation("batch prompt template is empty".into()));
        }
        if !request.template.contains(KEYWORD_PLACEHOLDER) {
            warn!(template = %request.template, placeholder = KEYWORD_PLACEHOLDER, "batch template has no placeholder");
        }
        self.credentials
            .resolve(&request.target, request.credentials.as_ref())?;
        Ok(BatchSequencer::new(self.driver.clone(), self.sink.clone()).run(request))
    }

    /// Suggests up to `max_suggestions` continuations of a half-typed prompt.
    /// Never fails; any problem yields an empty list.
    pub async fn suggest(&self, text: &str, max_suggestions: usize) -> Vec<String> {
        self.suggester.suggest(text, max_suggestions).await
    }
}

fn validate_input(target: &ModelTarget, input: &InputPayload) -> Result<(), EvalError> {
    if input.is_empty() {
        return Err(EvalError::Validation("input has neither text nor media".into()));
    }
    if let Some(modality) = target.unsupported_modality(input) {
        return Err(EvalError::Validation(format!(
            "target {} does not accept {modality} input",
            target.name
        )));
    }
    Ok(())
}

/// Builder collecting the collaborators of an `Evaluator`.
pub struct EvaluatorBuilder {
    provider: Option<Arc<dyn ChatProvider>>,
    credentials: Option<Arc<CredentialStore>>,
    media: Option<Arc<dyn MediaMaterializer>>,
    sink: Arc<dyn RecordSink>,
    call_timeout: Duration,
    stream_buffer_capacity: usize,
    suggest_model: String,
}

impl Default for EvaluatorBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            credentials: None,
            media: None,
            sink: Arc::new(NoopSink),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER,
            suggest_model: DEFAULT_SUGGEST_MODEL.to_string(),
        }
    }
}

impl EvaluatorBuilder {
    /// Required.
    pub fn provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Defaults to a store with no key and the default base URL.
    pub fn credentials(mut self, credentials: Arc<CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Defaults to an `FsMediaStore` rooted at `uploads`.
    pub fn media(mut self, media: Arc<dyn MediaMaterializer>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn suggest_model(mut self, model_id: impl Into<String>) -> Self {
        self.suggest_model = model_id.into();
        self
    }

    pub fn build(self) -> Result<Evaluator, EvalError> {
        let provider = self
            .provider
            .ok_or_else(|| EvalError::Config("no chat provider registered".into()))?;
        if self.stream_buffer_capacity == 0 {
            return Err(EvalError::Config("stream buffer capacity must be > 0".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(EvalError::Config("call timeout must be > 0".into()));
        }
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(CredentialStore::new(None, DEFAULT_BASE_URL)));
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(FsMediaStore::new("uploads")));
        let suggester = Suggester::new(provider.clone(), credentials.clone(), self.suggest_model);
        let driver = CallDriver::new(
            provider,
            credentials.clone(),
            media,
            self.call_timeout,
            self.stream_buffer_capacity,
        );
        Ok(Evaluator {
            driver,
            credentials,
            sink: self.sink,
            suggester,
        })
    }
}
