//! Breaker-guarded access to a [`PredictionProvider`].
//!
//! Two independent breakers sit in front of the provider: `login` guards
//! session establishment and `api` guards predict/train. Every call also
//! carries a hard timeout, and an elapsed timeout is reported to the
//! breaker as a transport failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use handover_common::models::UeSnapshot;
use handover_common::protocol::{PredictionRequest, TrainingRequest};
use quanta::Clock;
use tracing::{debug, info, warn};

use super::{
    PredictionError, PredictionProvider, PredictionResult, ProviderError, TrainingReport,
    TransportFailure,
};
use crate::breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::queue::{Operation, OperationExecutor, OperationOutput};

pub struct PredictionClient {
    provider: Arc<dyn PredictionProvider>,
    login_breaker: CircuitBreaker,
    api_breaker: CircuitBreaker,
    call_timeout: Duration,
    /// Training runs far longer than a prediction.
    train_timeout: Duration,
    /// `true` while the provider session is believed valid.
    session: tokio::sync::Mutex<bool>,
    metrics: Arc<EngineMetrics>,
    clock: Clock,
}

impl PredictionClient {
    pub fn new(
        provider: Arc<dyn PredictionProvider>,
        config: &EngineConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self::with_clock(provider, config, metrics, Clock::new())
    }

    /// Construct with an injected clock (breaker timing uses it).
    pub fn with_clock(
        provider: Arc<dyn PredictionProvider>,
        config: &EngineConfig,
        metrics: Arc<EngineMetrics>,
        clock: Clock,
    ) -> Self {
        Self {
            provider,
            login_breaker: CircuitBreaker::with_clock("login", config.breakers.login, clock.clone()),
            api_breaker: CircuitBreaker::with_clock("api", config.breakers.api, clock.clone()),
            call_timeout: config.provider.call_timeout,
            train_timeout: config.queue.training_timeout,
            session: tokio::sync::Mutex::new(false),
            metrics,
            clock,
        }
    }

    pub fn login_breaker(&self) -> &CircuitBreaker {
        &self.login_breaker
    }

    pub fn api_breaker(&self) -> &CircuitBreaker {
        &self.api_breaker
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Ask the provider for a target cell for `snapshot`.
    pub async fn predict(&self, snapshot: &UeSnapshot) -> Result<PredictionResult, PredictionError> {
        let start = self.clock.now();
        let request = PredictionRequest::from(snapshot);
        let result = self.predict_inner(&request).await;
        self.metrics
            .prediction_latency
            .record(self.clock.now().saturating_duration_since(start));

        match &result {
            Ok(r) => {
                self.metrics.record_prediction_ok();
                debug!(
                    ue_id = %snapshot.ue_id,
                    target = %r.target_cell_id,
                    confidence = r.confidence,
                    "prediction received"
                );
            }
            Err(e) => {
                self.metrics
                    .record_prediction_failed(matches!(e, PredictionError::MalformedResponse(_)));
                warn!(ue_id = %snapshot.ue_id, error = %e, kind = e.kind(), "prediction failed");
            }
        }
        result
    }

    async fn predict_inner(
        &self,
        request: &PredictionRequest,
    ) -> Result<PredictionResult, PredictionError> {
        self.ensure_session().await?;
        let provider = &self.provider;
        let result = self
            .api_breaker
            .call(|| {
                with_timeout(self.call_timeout, async move {
                    let raw = provider.predict(request).await?;
                    PredictionResult::try_from(raw)
                })
            })
            .await
            .map_err(PredictionError::from);
        self.after_api_call(result).await
    }

    /// Run a model training job on the provider.
    pub async fn train(&self, request: &TrainingRequest) -> Result<TrainingReport, PredictionError> {
        self.ensure_session().await?;
        let provider = &self.provider;
        let result = self
            .api_breaker
            .call(|| {
                with_timeout(self.train_timeout, async move {
                    let raw = provider.train(request).await?;
                    TrainingReport::try_from(raw)
                })
            })
            .await
            .map_err(PredictionError::from);
        let result = self.after_api_call(result).await;
        match &result {
            Ok(report) => info!(
                model = %request.model,
                version = %report.model_version,
                samples = report.samples,
                "training finished"
            ),
            Err(e) => warn!(model = %request.model, error = %e, "training failed"),
        }
        result
    }

    async fn after_api_call<T>(
        &self,
        result: Result<T, PredictionError>,
    ) -> Result<T, PredictionError> {
        if matches!(result, Err(PredictionError::Unauthorized)) {
            self.invalidate_session().await;
        }
        result
    }

    /// Log in through the `login` breaker unless a session is already held.
    async fn ensure_session(&self) -> Result<(), PredictionError> {
        if !self.provider.requires_login() {
            return Ok(());
        }
        let mut logged_in = self.session.lock().await;
        if *logged_in {
            return Ok(());
        }
        let provider = &self.provider;
        self.login_breaker
            .call(|| with_timeout(self.call_timeout, provider.login()))
            .await?;
        *logged_in = true;
        info!("provider session established");
        Ok(())
    }

    async fn invalidate_session(&self) {
        let mut logged_in = self.session.lock().await;
        if *logged_in {
            warn!("provider rejected session token, will log in again");
        }
        *logged_in = false;
    }
}

async fn with_timeout<T, F>(budget: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(r) => r,
        Err(_) => Err(TransportFailure::Timeout(budget).into()),
    }
}

#[async_trait]
impl OperationExecutor for PredictionClient {
    async fn execute(&self, operation: Operation) -> Result<OperationOutput, PredictionError> {
        match operation {
            Operation::Predict(snapshot) => {
                self.predict(&snapshot).await.map(OperationOutput::Prediction)
            }
            Operation::Train(request) => self.train(&request).await.map(OperationOutput::Training),
        }
    }
}
