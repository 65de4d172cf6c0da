//! CouchDB-compatible store client.
//!
//! Conditional fetches send the known revision in `If-None-Match`; the store
//! answers `304 Not Modified` when the document has not changed. The caller's
//! `Authorization` and `Cookie` headers ride along on every call.

use actionhost_common::{ActionError, Credentials, Result, Revision, TenantId};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE, ETAG, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use url::Url;

use crate::store::{validate_path, DocumentStore, FetchOutcome, StoreMethod, StoreRequest, UserContext};

/// HTTP client for a CouchDB-style document store.
#[derive(Clone)]
pub struct HttpStore {
    base: Url,
    client: Client,
}

impl HttpStore {
    /// Creates a store client rooted at `base_url` (e.g. `http://127.0.0.1:5984`).
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: &str, client: Client) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| ActionError::Config(format!("invalid store url {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ActionError::Config(format!("invalid store url {}", base_url)));
        }
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `<base>/<tenant>/<path>`, with `path` appended as already-encoded text.
    /// The parsed result must still lie under the tenant's database.
    fn database_url(&self, tenant: &TenantId, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ActionError::Config("store url cannot be a base".into()))?
            .pop_if_empty()
            .push(tenant.as_str());

        if path.is_empty() {
            return Ok(url);
        }

        let joined = format!("{}/{}", url.as_str().trim_end_matches('/'), path);
        let resolved = Url::parse(&joined)
            .map_err(|e| ActionError::Upstream(format!("invalid store path {}: {}", path, e)))?;

        let database = format!("{}/", url.path());
        if !resolved.path().starts_with(&database) {
            return Err(ActionError::Upstream(format!("invalid store path {}", path)));
        }
        Ok(resolved)
    }

    fn authorized(builder: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
        let mut builder = builder;
        if let Some(auth) = &credentials.authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if let Some(cookie) = &credentials.cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder
    }

    fn method(method: StoreMethod) -> Method {
        match method {
            StoreMethod::Get => Method::GET,
            StoreMethod::Post => Method::POST,
            StoreMethod::Put => Method::PUT,
            StoreMethod::Delete => Method::DELETE,
            StoreMethod::Head => Method::HEAD,
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::Upstream(format!("failed to read store response: {}", e)))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            Ok(body)
        } else {
            Err(ActionError::Upstream(describe_failure(status, &body)))
        }
    }
}

fn describe_failure(status: StatusCode, body: &Value) -> String {
    let reason = body
        .get("reason")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    format!("{} {}", status.as_u16(), reason)
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn fetch_with_revision(
        &self,
        credentials: &Credentials,
        tenant: &TenantId,
        doc_id: &str,
        known: Option<&Revision>,
    ) -> Result<FetchOutcome> {
        let url = self.database_url(tenant, &validate_path(doc_id)?)?;
        let mut builder = Self::authorized(self.client.get(url), credentials);
        if let Some(rev) = known {
            builder = builder.header(IF_NONE_MATCH, format!("\"{}\"", rev.as_str()));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ActionError::Upstream(format!("fetch {} failed: {}", doc_id, e)))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
            StatusCode::NOT_FOUND => return Ok(FetchOutcome::NotFound),
            _ => {}
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        let fields = Self::read_json(response).await?;
        let revision = etag
            .or_else(|| fields.get("_rev").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| ActionError::Upstream(format!("document {} has no revision", doc_id)))?;

        Ok(FetchOutcome::Document {
            revision: Revision::new(revision),
            fields,
        })
    }

    async fn request(
        &self,
        credentials: &Credentials,
        tenant: &TenantId,
        request: StoreRequest,
    ) -> Result<Value> {
        let url = self.database_url(tenant, request.path())?;
        tracing::debug!("store {} {}", request.method, url);

        let mut builder = Self::authorized(
            self.client.request(Self::method(request.method), url),
            credentials,
        );
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ActionError::Upstream(format!("{} {} failed: {}", request.method, request.path(), e)))?;

        Self::read_json(response).await
    }

    async fn session(&self, credentials: &Credentials) -> Result<UserContext> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ActionError::Config("store url cannot be a base".into()))?
            .pop_if_empty()
            .push("_session");

        let response = Self::authorized(self.client.get(url), credentials)
            .send()
            .await
            .map_err(|e| ActionError::Upstream(format!("session lookup failed: {}", e)))?;

        let body = Self::read_json(response).await?;
        let user = body
            .get("userCtx")
            .cloned()
            .ok_or_else(|| ActionError::Upstream("session response has no userCtx".into()))?;
        serde_json::from_value(user).map_err(|e| ActionError::Upstream(format!("bad userCtx: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use serde_json::json;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn fake_couch(req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let if_none_match = req
            .headers()
            .get("if-none-match")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let method = req.method().clone();
        let query = req.uri().query().map(str::to_string);
        let body = req.into_body().collect().await.unwrap().to_bytes();

        let (status, etag, payload) = match path.as_str() {
            "/db1/_design/datamanager" if if_none_match.as_deref() == Some("\"2-b\"") => {
                (304, None, json!(null))
            }
            "/db1/_design/datamanager" => (
                200,
                Some("\"2-b\""),
                json!({"_id": "_design/datamanager", "_rev": "2-b", "server": {"action": {}}}),
            ),
            "/_session" => (
                200,
                None,
                json!({"ok": true, "userCtx": {"name": auth.map(|_| "alice"), "roles": ["_admin"]}}),
            ),
            "/db1/doc1" if method == hyper::Method::PUT => {
                let doc: Value = serde_json::from_slice(&body).unwrap();
                (201, None, json!({"ok": true, "id": "doc1", "echo": doc}))
            }
            "/db1/_all_docs" => (200, None, json!({"query": query})),
            _ => (404, None, json!({"error": "not_found", "reason": "missing"})),
        };

        let mut response = Response::new(Full::new(Bytes::from(payload.to_string())));
        *response.status_mut() = hyper::StatusCode::from_u16(status).unwrap();
        if let Some(tag) = etag {
            response.headers_mut().insert("etag", tag.parse().unwrap());
        }
        Ok(response)
    }

    async fn start_fake_couch() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(fake_couch))
                        .await;
                });
            }
        });
        addr
    }

    fn tenant() -> TenantId {
        TenantId::new("db1").unwrap()
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(HttpStore::new("not a url").is_err());
        assert!(HttpStore::new("mailto:someone").is_err());
    }

    #[test]
    fn test_database_url() {
        let store = HttpStore::new("http://127.0.0.1:5984/").unwrap();
        let url = store.database_url(&tenant(), "_design/app/_view/all").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5984/db1/_design/app/_view/all");
        let root = store.database_url(&tenant(), "").unwrap();
        assert_eq!(root.as_str(), "http://127.0.0.1:5984/db1");
    }

    #[test]
    fn test_database_url_stays_in_database() {
        let store = HttpStore::new("http://127.0.0.1:5984/").unwrap();
        for path in [".\t./other_db/secret", ".\n./other_db/secret", ".\r./other_db/secret"] {
            assert!(store.database_url(&tenant(), path).is_err(), "{:?}", path);
        }
    }

    #[tokio::test]
    async fn test_request_rejects_control_character_traversal() {
        let addr = start_fake_couch().await;
        let store = HttpStore::new(&format!("http://{}", addr)).unwrap();

        for path in [".\t./other_db/secret", ".\n./other_db/secret", ".\r./other_db/secret"] {
            assert!(StoreRequest::get(path).is_err(), "{:?}", path);
            let err = store
                .fetch_with_revision(&Credentials::anonymous(), &tenant(), path, None)
                .await
                .unwrap_err();
            assert!(matches!(err, ActionError::Upstream(_)));
        }
    }

    #[tokio::test]
    async fn test_conditional_fetch() {
        let addr = start_fake_couch().await;
        let store = HttpStore::new(&format!("http://{}", addr)).unwrap();
        let creds = Credentials::anonymous();

        let first = store
            .fetch_with_revision(&creds, &tenant(), "_design/datamanager", None)
            .await
            .unwrap();
        let rev = match first {
            FetchOutcome::Document { revision, fields } => {
                assert_eq!(fields["_id"], "_design/datamanager");
                revision
            }
            other => panic!("expected document, got {:?}", other),
        };
        assert_eq!(rev.as_str(), "2-b");

        let second = store
            .fetch_with_revision(&creds, &tenant(), "_design/datamanager", Some(&rev))
            .await
            .unwrap();
        assert_eq!(second, FetchOutcome::NotModified);

        let missing = store
            .fetch_with_revision(&creds, &tenant(), "_design/other", None)
            .await
            .unwrap();
        assert_eq!(missing, FetchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_request_forwards_body_and_query() {
        let addr = start_fake_couch().await;
        let store = HttpStore::new(&format!("http://{}", addr)).unwrap();
        let creds = Credentials::anonymous();

        let put = StoreRequest::new(StoreMethod::Put, "doc1")
            .unwrap()
            .with_body(json!({"value": 1}));
        let result = store.request(&creds, &tenant(), put).await.unwrap();
        assert_eq!(result["echo"]["value"], 1);

        let list = StoreRequest::get("_all_docs").unwrap().with_query("limit", "5");
        let result = store.request(&creds, &tenant(), list).await.unwrap();
        assert_eq!(result["query"], "limit=5");
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_error() {
        let addr = start_fake_couch().await;
        let store = HttpStore::new(&format!("http://{}", addr)).unwrap();

        let err = store
            .request(&Credentials::anonymous(), &tenant(), StoreRequest::get("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Upstream(ref msg) if msg.contains("404 missing")));
    }

    #[tokio::test]
    async fn test_session_forwards_credentials() {
        let addr = start_fake_couch().await;
        let store = HttpStore::new(&format!("http://{}", addr)).unwrap();
        let creds = Credentials {
            authorization: Some("Basic YWxpY2U6cHc=".into()),
            cookie: None,
        };

        let user = store.session(&creds).await.unwrap();
        assert_eq!(user.name.as_deref(), Some("alice"));
        assert_eq!(user.roles, vec!["_admin".to_string()]);

        let anonymous = store.session(&Credentials::anonymous()).await.unwrap();
        assert_eq!(anonymous.name, None);
    }
}
