use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, trace};

use super::{DeviceTransport, TransportError, TransportKind};

/// Body marker of a live controller's `/version` page.
pub const VERSION_MARKER: &str = "firmware_version";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Commands tunnelled through `GET /serial?cmd=...`; one request per command.
pub struct HttpTransport {
    host: String,
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(host: &str, settings: &HttpSettings) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| TransportError::Open {
                target: host.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            host: host.to_string(),
            client,
            timeout: settings.request_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl DeviceTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn send_line(&mut self, command: &str) -> Result<String, TransportError> {
        let url = format!("http://{}/serial", self.host);
        let response = self
            .client
            .get(&url)
            .query(&[("cmd", command)])
            .send()
            .map_err(|err| map_request_error(err, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| map_request_error(err, self.timeout))?;
        if status != StatusCode::OK {
            return Err(TransportError::Http(format!(
                "{url} answered {status}: {}",
                body.trim()
            )));
        }
        debug!(host = %self.host, command, reply = %body.trim(), "http exchange");
        Ok(body.trim().to_string())
    }
}

fn map_request_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            err.to_string(),
        ))
    } else {
        TransportError::Http(err.to_string())
    }
}

/// Liveness check used by discovery: `/version` answers 200 with the marker.
pub fn version_responds(client: &Client, host: &str, timeout: Duration) -> bool {
    let url = format!("http://{host}/version");
    let result = client
        .get(&url)
        .timeout(timeout)
        .send()
        .and_then(|response| {
            let status = response.status();
            response.text().map(|body| (status, body))
        });
    match result {
        Ok((status, body)) => {
            let alive = status == StatusCode::OK && body.contains(VERSION_MARKER);
            trace!(host, %status, alive, "version check");
            alive
        }
        Err(err) => {
            trace!(host, error = %err, "version check failed");
            false
        }
    }
}
