//! REST transport to a Jupyter server: kernelspecs, kernel lifecycle, and
//! session lifecycle.
//!
//! [`RestTransport`] is the injection seam: production code uses
//! [`ReqwestTransport`], tests substitute an in-memory fake so the manager
//! layer and session coordinator can be exercised without a server,
//! generalizing the same dependency-injection shape used for the
//! WebSocket [`SocketFactory`](crate::socket::SocketFactory).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{header, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use url::Url;

use crate::error::Error;
use crate::kernelspec::SpecsBundle;

/// A raw, method-agnostic HTTP response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The raw response body.
    pub body: Bytes,
}

/// Executes a single HTTP request against a Jupyter server.
pub trait RestTransport: Send + Sync {
    /// Issue a request. `path` is relative to the server's base URL;
    /// `body`, when present, is sent as a `application/json` request body.
    fn execute<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<Vec<u8>>,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, Error>> + Send + 'a>>;
}

/// Production [`RestTransport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// Build a transport against `base_url`, authenticating with `token`
    /// (sent as `Authorization: token {tok}`) and `xsrf_token` (sent as
    /// `X-XSRFToken`) when provided.
    pub fn new(
        base_url: Url,
        token: Option<&str>,
        xsrf_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = format!("token {token}")
                .parse()
                .map_err(|err: header::InvalidHeaderValue| Error::KernelConnect(err.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        if let Some(xsrf) = xsrf_token {
            let value = xsrf
                .parse()
                .map_err(|err: header::InvalidHeaderValue| Error::KernelConnect(err.to_string()))?;
            headers.insert("X-XSRFToken", value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(ReqwestTransport { client, base_url })
    }
}

impl RestTransport for ReqwestTransport {
    fn execute<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<Vec<u8>>,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, Error>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.base_url.join(path)?;
            let mut req = self.client.request(method, url);
            if let Some(body) = body {
                req = req.header(header::CONTENT_TYPE, "application/json").body(body);
            }
            let resp = req.send().await.map_err(|err| {
                if err.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Reqwest(err)
                }
            })?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok(RawResponse { status, body })
        })
    }
}

/// A running kernel, as returned by the kernels REST endpoints.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KernelModel {
    /// The kernel's unique id.
    pub id: String,
    /// The kernelspec name it was started from.
    pub name: String,
    /// Timestamp of the kernel's last observed activity.
    #[serde(with = "time::serde::iso8601")]
    pub last_activity: OffsetDateTime,
    /// The kernel's last known execution state.
    pub execution_state: String,
    /// The number of clients currently connected to the kernel.
    pub connections: u32,
}

/// A session, as returned by the sessions REST endpoints.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SessionModel {
    /// The session's unique id.
    pub id: String,
    /// The path of the document the session is attached to.
    pub path: String,
    /// A display name for the session.
    pub name: String,
    /// The session type, e.g. `notebook` or `console`.
    #[serde(rename = "type")]
    pub session_type: String,
    /// The kernel currently backing this session.
    pub kernel: SessionKernel,
}

/// The `kernel` sub-object of a [`SessionModel`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SessionKernel {
    /// The kernel's unique id.
    pub id: String,
    /// The kernelspec name it was started from.
    pub name: String,
}

/// Typed REST client for a Jupyter server, built on a [`RestTransport`].
#[derive(Clone)]
pub struct JupyterRestClient {
    transport: Arc<dyn RestTransport>,
}

impl JupyterRestClient {
    /// Build a client around the given transport.
    pub fn new(transport: Arc<dyn RestTransport>) -> Self {
        JupyterRestClient { transport }
    }

    /// `GET /api/kernelspecs`, validated so `default` always names an
    /// entry in `kernelspecs`.
    pub async fn kernelspecs(&self) -> Result<SpecsBundle, Error> {
        let bundle: SpecsBundle = self.get_json("api/kernelspecs").await?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// `GET /api/kernels`.
    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>, Error> {
        self.get_json("api/kernels").await
    }

    /// `GET /api/kernels/{id}`. Returns `None` on a 404.
    pub async fn get_kernel(&self, id: &str) -> Result<Option<KernelModel>, Error> {
        let resp = self
            .transport
            .execute(Method::GET, &format!("api/kernels/{id}"), None)
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        Self::decode(resp).map(Some)
    }

    /// `POST /api/kernels`, starting a new kernel from `name` (or the
    /// server's default kernelspec, if `None`).
    pub async fn start_kernel(&self, name: Option<&str>) -> Result<KernelModel, Error> {
        self.send_json(Method::POST, "api/kernels", &json!({ "name": name }))
            .await
    }

    /// `POST /api/kernels/{id}/interrupt`.
    pub async fn interrupt_kernel(&self, id: &str) -> Result<(), Error> {
        let resp = self
            .transport
            .execute(
                Method::POST,
                &format!("api/kernels/{id}/interrupt"),
                Some(b"{}".to_vec()),
            )
            .await?;
        Self::expect_success(resp)
    }

    /// `POST /api/kernels/{id}/restart`.
    pub async fn restart_kernel(&self, id: &str) -> Result<KernelModel, Error> {
        let resp = self
            .transport
            .execute(
                Method::POST,
                &format!("api/kernels/{id}/restart"),
                Some(b"{}".to_vec()),
            )
            .await?;
        Self::decode(resp)
    }

    /// `DELETE /api/kernels/{id}`.
    pub async fn delete_kernel(&self, id: &str) -> Result<(), Error> {
        let resp = self
            .transport
            .execute(Method::DELETE, &format!("api/kernels/{id}"), None)
            .await?;
        Self::expect_success(resp)
    }

    /// `GET /api/sessions`.
    pub async fn list_sessions(&self) -> Result<Vec<SessionModel>, Error> {
        self.get_json("api/sessions").await
    }

    /// `GET /api/sessions/{id}`. Returns `None` on a 404.
    pub async fn get_session(&self, id: &str) -> Result<Option<SessionModel>, Error> {
        let resp = self
            .transport
            .execute(Method::GET, &format!("api/sessions/{id}"), None)
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        Self::decode(resp).map(Some)
    }

    /// `POST /api/sessions`, creating a session and its backing kernel
    /// together.
    pub async fn create_session(
        &self,
        path: &str,
        name: &str,
        session_type: &str,
        kernel_name: Option<&str>,
    ) -> Result<SessionModel, Error> {
        self.send_json(
            Method::POST,
            "api/sessions",
            &json!({
                "path": path,
                "name": name,
                "type": session_type,
                "kernel": { "name": kernel_name },
            }),
        )
        .await
    }

    /// `PATCH /api/sessions/{id}`, changing one or more of `path`, `name`,
    /// and `type`. Callers build the patch body themselves so they only
    /// send the fields that actually changed.
    pub async fn patch_session(&self, id: &str, patch: &Value) -> Result<SessionModel, Error> {
        self.send_json(Method::PATCH, &format!("api/sessions/{id}"), patch)
            .await
    }

    /// `DELETE /api/sessions/{id}`. A 404 is treated as already-deleted
    /// success; a 410 means the kernel was deleted out from under the
    /// session but the session record itself survived, which callers need
    /// to know about to reconcile their state.
    pub async fn delete_session(&self, id: &str) -> Result<(), Error> {
        let resp = self
            .transport
            .execute(Method::DELETE, &format!("api/sessions/{id}"), None)
            .await?;
        match resp.status {
            200..=299 | 404 => Ok(()),
            410 => Err(Error::KernelDeletedSessionRemains),
            status => Err(Error::InvalidResponse {
                status,
                body: String::from_utf8_lossy(&resp.body).into_owned(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let resp = self.transport.execute(Method::GET, path, None).await?;
        Self::decode(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, Error> {
        let bytes =
            serde_json::to_vec(body).map_err(|err| Error::MalformedModel(err.to_string()))?;
        let resp = self.transport.execute(method, path, Some(bytes)).await?;
        Self::decode(resp)
    }

    fn decode<T: DeserializeOwned>(resp: RawResponse) -> Result<T, Error> {
        if !(200..300).contains(&resp.status) {
            return Err(Error::InvalidResponse {
                status: resp.status,
                body: String::from_utf8_lossy(&resp.body).into_owned(),
            });
        }
        serde_json::from_slice(&resp.body).map_err(|err| Error::MalformedModel(err.to_string()))
    }

    fn expect_success(resp: RawResponse) -> Result<(), Error> {
        if (200..300).contains(&resp.status) {
            Ok(())
        } else {
            Err(Error::InvalidResponse {
                status: resp.status,
                body: String::from_utf8_lossy(&resp.body).into_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory fake transport driven by a queue of canned responses,
    /// recording every request it receives.
    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<Vec<RawResponse>>,
        requests: Mutex<Vec<(Method, String)>>,
    }

    impl FakeTransport {
        fn push(&self, status: u16, body: Value) {
            self.responses.lock().unwrap().push(RawResponse {
                status,
                body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            });
        }
    }

    impl RestTransport for FakeTransport {
        fn execute<'a>(
            &'a self,
            method: Method,
            path: &'a str,
            _body: Option<Vec<u8>>,
        ) -> Pin<Box<dyn Future<Output = Result<RawResponse, Error>> + Send + 'a>> {
            self.requests
                .lock()
                .unwrap()
                .push((method, path.to_string()));
            let resp = self.responses.lock().unwrap().remove(0);
            Box::pin(async move { Ok(resp) })
        }
    }

    #[tokio::test]
    async fn kernelspecs_rejects_inconsistent_default() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(200, json!({"default": "python3", "kernelspecs": {}}));
        let client = JupyterRestClient::new(fake);
        assert!(client.kernelspecs().await.is_err());
    }

    #[tokio::test]
    async fn get_kernel_maps_404_to_none() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(404, json!({"message": "not found"}));
        let client = JupyterRestClient::new(fake);
        assert_eq!(client.get_kernel("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_session_maps_410_to_specific_error() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(410, json!({"message": "kernel already deleted"}));
        let client = JupyterRestClient::new(fake);
        assert!(matches!(
            client.delete_session("s1").await,
            Err(Error::KernelDeletedSessionRemains)
        ));
    }

    #[tokio::test]
    async fn delete_session_maps_404_to_success() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(404, json!({}));
        let client = JupyterRestClient::new(fake);
        assert!(client.delete_session("s1").await.is_ok());
    }

    #[tokio::test]
    async fn start_kernel_decodes_model() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(
            201,
            json!({
                "id": "k1",
                "name": "python3",
                "last_activity": "2024-01-01T00:00:00.000000Z",
                "execution_state": "starting",
                "connections": 0,
            }),
        );
        let client = JupyterRestClient::new(fake);
        let kernel = client.start_kernel(Some("python3")).await.unwrap();
        assert_eq!(kernel.id, "k1");
    }
}
