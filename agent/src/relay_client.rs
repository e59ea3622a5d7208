use std::time::Duration;

use anyhow::Context;
use reqwest::header::HOST;
use tracing::{debug, info, warn};

use thermorelay_common::{RelayCommand, RelayEndpoint, RelayFailure, RelayOutcome, RelayResponse};

use crate::host::Relay;

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    endpoint: RelayEndpoint,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(endpoint: RelayEndpoint, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()
            .context("failed to build relay http client")?;

        Ok(Self {
            http,
            endpoint,
            timeout,
        })
    }

    // dropping the exchange on expiry closes the connection and the partial body
    pub async fn call(&self, command: RelayCommand) -> RelayOutcome {
        let outcome = match tokio::time::timeout(self.timeout, self.exchange(command)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RelayFailure::Timeout),
        };

        match &outcome {
            Ok(body) => info!(
                command = command.as_str(),
                bytes = body.len(),
                "relay acknowledged"
            ),
            Err(err) => warn!(command = command.as_str(), "relay call failed: {err}"),
        }
        outcome
    }

    async fn exchange(&self, command: RelayCommand) -> RelayOutcome {
        let url = self.endpoint.url(command);
        debug!("relay request GET {url}");

        let mut response = self
            .http
            .get(&url)
            .header(HOST, self.endpoint.host_header())
            .send()
            .await
            .map_err(transport_failure)?;

        let mut body = RelayResponse::accept(response.status().as_u16())?;
        while let Some(chunk) = response.chunk().await.map_err(transport_failure)? {
            body.push_chunk(&chunk);
        }
        Ok(body.finish())
    }
}

impl Relay for RelayClient {
    async fn call(&self, command: RelayCommand) -> RelayOutcome {
        RelayClient::call(self, command).await
    }
}

fn transport_failure(err: reqwest::Error) -> RelayFailure {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    RelayFailure::Transport(message)
}
