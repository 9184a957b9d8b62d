use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use tracing::{info, warn};

use super::error::VSphereError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const SESSION_HEADER: &str = "vmware-api-session-id";

/// An authenticated vSphere Automation API session.
///
/// Owns the HTTP client and the session token. vCenter invalidates idle
/// sessions server-side, so callers probe with `reconnect_if_needed` before
/// operating; a `true` return means cached VM handles are stale and must be
/// re-resolved by name.
pub struct Session {
    host: String,
    user: String,
    password: String,
    port: u16,
    client: Client,
    token: Option<String>,
}

impl Session {
    /// Open a session against vCenter. Fails on auth or network errors.
    pub fn connect(host: &str, user: &str, password: &str, port: u16) -> Result<Self, VSphereError> {
        // Lab vCenters run self-signed PKI; certificate checks stay off.
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| VSphereError::Connect {
                host: host.to_string(),
                details: e.to_string(),
            })?;

        let mut session = Self {
            host: host.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            port,
            client,
            token: None,
        };
        session.login()?;
        Ok(session)
    }

    fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    fn login(&mut self) -> Result<(), VSphereError> {
        let url = format!("{}/api/session", self.base_url());
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .map_err(|e| VSphereError::Connect {
                host: self.host.clone(),
                details: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(VSphereError::Connect {
                host: self.host.clone(),
                details: format!("session create returned HTTP {}", resp.status()),
            });
        }

        let token: String = resp.json().map_err(|e| VSphereError::Connect {
            host: self.host.clone(),
            details: format!("malformed session token: {}", e),
        })?;
        self.token = Some(token);
        info!(host = %self.host, "connected to vCenter");
        Ok(())
    }

    /// Probe the session with a cheap authenticated call; reopen it when the
    /// server reports the token is no longer valid.
    ///
    /// Returns `true` after a reconnect, signalling that VM handles resolved
    /// under the old session must be re-resolved by name. Idempotent and
    /// safe to call before every operation.
    pub fn reconnect_if_needed(&mut self) -> Result<bool, VSphereError> {
        let resp = self.request(reqwest::Method::GET, "/api/appliance/system/time", &[], None)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            warn!(host = %self.host, "vCenter session expired, reconnecting");
            self.login()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response, VSphereError> {
        let url = format!("{}{}", self.base_url(), path);
        let mut req = self.client.request(method, &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.header(SESSION_HEADER, token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().map_err(|e| VSphereError::Api {
            path: path.to_string(),
            details: e.to_string(),
        })
    }

    /// Issue an API call and parse the JSON body (Null for empty replies).
    /// Non-2xx statuses surface as `Api` errors carrying the response text.
    pub fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, VSphereError> {
        let resp = self.request(method, path, query, body)?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(VSphereError::Api {
                path: path.to_string(),
                details: format!("HTTP {}: {}", status, text.trim()),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| VSphereError::Api {
            path: path.to_string(),
            details: format!("malformed response: {}", e),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}
