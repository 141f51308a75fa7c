//! Authoritative read/write API. The client never mutates appointments over
//! the push channel; every write goes through here first.

use crate::{
    channel::{hub_base, ChannelStatus},
    error::SyncError,
    session::SessionTokenProvider,
};
use async_trait::async_trait;
use carelink_core::{
    wire::{CONNECTION_HEADER, REQUEST_ID_HEADER},
    Appointment, AppointmentUpdate, NewAppointment, RescheduleProposal, Role,
    StatusChangeRequest,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::watch;
use url::Url;

#[async_trait]
pub trait AppointmentReader: Send + Sync + 'static {
    async fn list_appointments(&self, role: Role) -> Result<Vec<Appointment>, SyncError>;
}

#[async_trait]
pub trait AppointmentWriter: Send + Sync + 'static {
    async fn create(&self, draft: &NewAppointment) -> Result<Appointment, SyncError>;
    async fn update(&self, id: &str, update: &AppointmentUpdate) -> Result<Appointment, SyncError>;
    async fn change_status(
        &self,
        id: &str,
        request: &StatusChangeRequest,
    ) -> Result<Appointment, SyncError>;
    async fn request_reschedule(
        &self,
        id: &str,
        proposal: &RescheduleProposal,
    ) -> Result<Appointment, SyncError>;
    async fn delete(&self, id: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct HttpAppointmentApi {
    client: reqwest::Client,
    base: Url,
    tokens: Arc<dyn SessionTokenProvider>,
    origin: Mutex<Option<watch::Receiver<ChannelStatus>>>,
}

impl HttpAppointmentApi {
    pub fn new(base: Url, tokens: Arc<dyn SessionTokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: hub_base(&base),
            tokens,
            origin: Mutex::new(None),
        }
    }

    /// Names the push connection acks should be addressed to.
    pub fn set_origin(&self, status: Option<watch::Receiver<ChannelStatus>>) {
        let mut origin = match self.origin.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *origin = status;
    }

    fn origin_session(&self) -> Option<String> {
        let origin = match self.origin.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let status = origin.as_ref()?.borrow().clone();
        let connected = status.is_connected();
        status.session_id.filter(|_| connected)
    }

    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| SyncError::Transport(format!("invalid api path {path}: {err}")))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SyncError> {
        let token = self.tokens.current_token().ok_or(SyncError::NoSession)?;
        let mut request = self
            .client
            .request(method, self.url(path)?)
            .bearer_auth(token);
        if let Some(session_id) = self.origin_session() {
            request = request.header(CONNECTION_HEADER, session_id);
        }
        Ok(request)
    }

    fn write(&self, method: Method, path: &str, request_id: &str) -> Result<RequestBuilder, SyncError> {
        Ok(self
            .request(method, path)?
            .header(REQUEST_ID_HEADER, request_id))
    }
}

// Correlation ids only need to be unique per client process.
fn request_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "req-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed) + 1
    )
}

async fn check(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(SyncError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl AppointmentReader for HttpAppointmentApi {
    async fn list_appointments(&self, role: Role) -> Result<Vec<Appointment>, SyncError> {
        let response = self
            .request(Method::GET, "/api/appointments")?
            .query(&[("role", role.as_str())])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

#[async_trait]
impl AppointmentWriter for HttpAppointmentApi {
    async fn create(&self, draft: &NewAppointment) -> Result<Appointment, SyncError> {
        let response = self
            .write(Method::POST, "/api/appointments", &request_id())?
            .json(draft)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn update(&self, id: &str, update: &AppointmentUpdate) -> Result<Appointment, SyncError> {
        let response = self
            .write(Method::PATCH, &format!("/api/appointments/{id}"), &request_id())?
            .json(update)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn change_status(
        &self,
        id: &str,
        request: &StatusChangeRequest,
    ) -> Result<Appointment, SyncError> {
        let response = self
            .write(
                Method::POST,
                &format!("/api/appointments/{id}/status"),
                &request_id(),
            )?
            .json(request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn request_reschedule(
        &self,
        id: &str,
        proposal: &RescheduleProposal,
    ) -> Result<Appointment, SyncError> {
        let response = self
            .write(
                Method::POST,
                &format!("/api/appointments/{id}/reschedule"),
                &request_id(),
            )?
            .json(proposal)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let response = self
            .write(Method::DELETE, &format!("/api/appointments/{id}"), &request_id())?
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticToken;

    #[test]
    fn requests_need_a_session() {
        let api = HttpAppointmentApi::new(
            Url::parse("http://127.0.0.1:4780").expect("url"),
            Arc::new(StaticToken::none()),
        );
        assert!(matches!(
            api.request(Method::GET, "/api/appointments"),
            Err(SyncError::NoSession)
        ));
    }

    #[test]
    fn origin_header_only_while_connected() {
        let api = HttpAppointmentApi::new(
            Url::parse("http://127.0.0.1:4780").expect("url"),
            Arc::new(StaticToken::new("tok-1")),
        );
        assert_eq!(api.origin_session(), None);

        let (tx, rx) = watch::channel(ChannelStatus::default());
        api.set_origin(Some(rx));
        tx.send_modify(|status| status.session_id = Some("conn-3".to_string()));
        assert_eq!(api.origin_session(), None);
        tx.send_modify(|status| status.state = crate::channel::ConnectionState::Connected);
        assert_eq!(api.origin_session().as_deref(), Some("conn-3"));
    }

    #[test]
    fn api_paths_keep_the_hub_path_prefix() {
        let api = HttpAppointmentApi::new(
            Url::parse("https://care.example/carelink").expect("url"),
            Arc::new(StaticToken::new("tok-1")),
        );
        assert_eq!(
            api.url("/api/appointments/a-1/status").expect("url").as_str(),
            "https://care.example/carelink/api/appointments/a-1/status"
        );

        let bare = HttpAppointmentApi::new(
            Url::parse("http://127.0.0.1:4780").expect("url"),
            Arc::new(StaticToken::new("tok-1")),
        );
        assert_eq!(
            bare.url("/api/appointments").expect("url").as_str(),
            "http://127.0.0.1:4780/api/appointments"
        );
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(request_id(), request_id());
    }
}
