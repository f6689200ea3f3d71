use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::{InvokeResponse, RemoteInvoker};
use crate::errors::InvocationError;

/// Invokes a function by POSTing the payload to `<endpoint>/<function_name>`.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    url: String,
}

impl HttpInvoker {
    pub fn new(endpoint: &str, function_name: &str) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, function_name)
    }

    pub fn with_client(client: reqwest::Client, endpoint: &str, function_name: &str) -> Self {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), function_name);
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteInvoker for HttpInvoker {
    async fn invoke(
        &self,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<InvokeResponse, InvocationError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(deadline)
            .body(payload)
            .send()
            .await
            .map_err(|err| map_request_error(err, deadline))?;

        let status_code = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| map_request_error(err, deadline))?;
        debug!(url = %self.url, status_code, bytes = body.len(), "remote function responded");

        Ok(InvokeResponse {
            status_code,
            payload: (!body.is_empty()).then(|| body.to_vec()),
        })
    }
}

fn map_request_error(err: reqwest::Error, deadline: Duration) -> InvocationError {
    if err.is_timeout() {
        InvocationError::Timeout { deadline }
    } else {
        InvocationError::Transport {
            reason: err.to_string(),
        }
    }
}
