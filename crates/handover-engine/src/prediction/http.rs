//! HTTP/JSON prediction provider.
//!
//! `POST {base}/login` trades credentials for a bearer token;
//! `POST {base}/predict` and `POST {base}/train` carry it. Status codes are
//! classified so that only availability problems reach the breakers.
//!
//! Timeouts are set per request: login and predict use the provider call
//! timeout, train uses the training budget.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use handover_common::protocol::{
    LoginRequest, LoginResponse, PredictionRequest, RawPrediction, RawTrainingReport,
    TrainingRequest,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{PredictionProvider, ProviderError, TransportFailure};
use crate::config::{ProviderConfig, QueueConfig};

pub struct HttpPredictionProvider {
    http: reqwest::Client,
    base_url: String,
    call_timeout: Duration,
    train_timeout: Duration,
    credentials: Option<LoginRequest>,
    token: Mutex<Option<String>>,
}

impl HttpPredictionProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportFailure::Connection(e.to_string()))?;

        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(LoginRequest {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            call_timeout: config.call_timeout,
            train_timeout: QueueConfig::default().training_timeout,
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Budget for `POST /train`, normally the queue's training timeout.
    pub fn with_training_timeout(mut self, budget: Duration) -> Self {
        self.train_timeout = budget;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn bearer(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    async fn post<B, R>(&self, path: &str, body: &B, budget: Duration) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(self.url(path)).json(body).timeout(budget);
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| transport(e, budget))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let err = classify_status(status, message);
            if matches!(err, ProviderError::Unauthorized) {
                self.set_token(None);
            }
            return Err(err);
        }

        let bytes = response.bytes().await.map_err(|e| transport(e, budget))?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

fn transport(e: reqwest::Error, budget: Duration) -> ProviderError {
    if e.is_timeout() {
        TransportFailure::Timeout(budget).into()
    } else {
        TransportFailure::Connection(e.to_string()).into()
    }
}

fn classify_status(status: StatusCode, message: String) -> ProviderError {
    if status.is_server_error() {
        TransportFailure::ServerError(status.as_u16()).into()
    } else if status == StatusCode::UNAUTHORIZED {
        ProviderError::Unauthorized
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl PredictionProvider for HttpPredictionProvider {
    fn requires_login(&self) -> bool {
        self.credentials.is_some()
    }

    async fn login(&self) -> Result<(), ProviderError> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        self.set_token(None);
        let response: LoginResponse = self.post("login", credentials, self.call_timeout).await?;
        let token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::Malformed("login response has no access_token".into()))?;
        debug!(base_url = %self.base_url, "provider login succeeded");
        self.set_token(Some(token));
        Ok(())
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, ProviderError> {
        self.post("predict", request, self.call_timeout).await
    }

    async fn train(&self, request: &TrainingRequest) -> Result<RawTrainingReport, ProviderError> {
        self.post("train", request, self.train_timeout).await
    }
}
