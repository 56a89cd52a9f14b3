use super::wire::*;
use super::RobotLink;
use crate::error::{GymError, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::RwLock;
use std::time::Duration;

/// [`RobotLink`] over the robot-control server's JSON HTTP API.
#[derive(Debug)]
pub struct HttpLink {
    base_url: String,
    api_url: String,
    timeout: Duration,
    token: RwLock<String>,
    client: Client,
}

impl HttpLink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = base_url.replace("//localhost:", "//127.0.0.1:");
        if base_url.ends_with('/') {
            _ = base_url.remove(base_url.len() - 1);
        }

        let api_url = format!("{base_url}/v1/robot/");
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(Self::construct_common_headers())
            .build()
            .map_err(|e| GymError::Config(format!("http client: {e}")))?;

        Ok(Self {
            base_url,
            api_url,
            timeout,
            token: RwLock::new(String::new()),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn make_api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().map(|t| t.clone()).unwrap_or_default();
        if token.is_empty() {
            req
        } else {
            req.bearer_auth(token)
        }
    }

    fn http_get<T: DeserializeOwned>(&self, op: &'static str, path: &str) -> Result<T> {
        let req = self.authorized(self.client.get(self.make_api_url(path)));
        let res = req.send().map_err(|e| self.transport_error(op, e))?;
        self.decode(op, res)
    }

    fn http_post<B: Serialize, T: DeserializeOwned>(
        &self,
        op: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let req = self.authorized(self.client.post(self.make_api_url(path)).json(body));
        let res = req.send().map_err(|e| self.transport_error(op, e))?;
        self.decode(op, res)
    }

    fn decode<T: DeserializeOwned>(&self, op: &'static str, res: Response) -> Result<T> {
        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(error_for_status(op, status, body, self.timeout));
        }
        res.json::<T>()
            .map_err(|e| GymError::Protocol(format!("{op}: {e}")))
    }

    fn transport_error(&self, op: &'static str, e: reqwest::Error) -> GymError {
        if e.is_timeout() {
            GymError::Timeout {
                op,
                after: self.timeout,
            }
        } else if e.is_connect() {
            GymError::Network(format!("{op}: {e}"))
        } else {
            GymError::Link(format!("{op}: {e}"))
        }
    }

    fn construct_common_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }
}

/// Maps a non-success reply onto the error taxonomy.
pub(crate) fn error_for_status(
    op: &'static str,
    status: StatusCode,
    body: String,
    timeout: Duration,
) -> GymError {
    let detail = if body.is_empty() {
        format!("{op}: {status}")
    } else {
        format!("{op}: {status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED if op == "connect" => GymError::Auth(detail),
        StatusCode::UNAUTHORIZED => GymError::InvalidToken(detail),
        StatusCode::FORBIDDEN => GymError::SlotNotActive(detail),
        StatusCode::CONFLICT => GymError::RobotBusy(detail),
        StatusCode::GONE => GymError::SessionExpired,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GymError::Timeout {
            op,
            after: timeout,
        },
        s if s.is_server_error() => GymError::Link(detail),
        _ => GymError::Protocol(detail),
    }
}

impl RobotLink for HttpLink {
    fn connect(&self, token: &str) -> Result<()> {
        if let Ok(mut t) = self.token.write() {
            *t = token.to_string();
        }
        let _: serde_json::Value = self.http_get("connect", "status/")?;
        Ok(())
    }

    fn validate_token(&self, token: &str) -> Result<BookingInfo> {
        let body = serde_json::json!({ "token": token });
        self.http_post("validate_token", "bookings/validate/", &body)
    }

    fn open_session(&self, request: &SessionRequest) -> Result<SessionGrant> {
        self.http_post("open_session", "sessions/", request)
    }

    fn send_command(&self, message: &CommandMessage) -> Result<CommandAck> {
        let path = format!("sessions/{}/commands/", message.session_id);
        self.http_post("send_command", &path, message)
    }

    fn fetch_frame(&self, session_id: &str, seq: u64) -> Result<Option<FrameMessage>> {
        let url = self.make_api_url(&format!("sessions/{session_id}/frames/{seq}/"));
        let res = self
            .authorized(self.client.get(url))
            .send()
            .map_err(|e| self.transport_error("fetch_frame", e))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.decode("fetch_frame", res).map(Some)
    }

    fn heartbeat(&self, message: &HeartbeatMessage) -> Result<HeartbeatAck> {
        let path = format!("sessions/{}/heartbeat/", message.session_id);
        self.http_post("heartbeat", &path, message)
    }

    fn close_session(&self, session_id: &str) -> Result<()> {
        let url = self.make_api_url(&format!("sessions/{session_id}/"));
        let res = self
            .authorized(self.client.delete(url))
            .send()
            .map_err(|e| self.transport_error("close_session", e))?;
        let status = res.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = res.text().unwrap_or_default();
            Err(error_for_status("close_session", status, body, self.timeout))
        }
    }
}
