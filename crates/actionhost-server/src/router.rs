//! Request router.
//!
//! Turns an inbound method, path, query and body into a dispatch target.
//!
//! # Path Shapes
//!
//! | path | bundle | action |
//! |------|--------|--------|
//! | `/<tenant>/<action>` | `design/datamanager` | `<action>` |
//! | `/<tenant>/<selector>/<action>[/...]` | `design/<selector>` | `<action>` |
//! | `/<tenant>/_admin_db/<adminAction>` | - | forwarded to the admin handler |

use actionhost_common::{ActionError, BundleId, Credentials, Result, TenantId};
use hyper::body::Bytes;
use serde_json::{Map, Value};

/// Path segment that marks an administrative request.
pub const ADMIN_SEGMENT: &str = "_admin_db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

impl RequestMethod {
    pub fn parse(method: &str) -> Result<Self> {
        match method {
            "GET" => Ok(RequestMethod::Get),
            "POST" => Ok(RequestMethod::Post),
            other => Err(ActionError::BadRequest(format!("method {} not allowed", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
        }
    }
}

/// A request as the HTTP layer hands it over.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: RequestMethod,
    pub path: String,
    pub query: Option<String>,
    pub body: Bytes,
    pub credentials: Credentials,
    pub host: Option<String>,
}

impl InboundRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: RequestMethod::Get,
            path: path.into(),
            query: None,
            body: Bytes::new(),
            credentials: Credentials::anonymous(),
            host: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: RequestMethod::Post,
            body: body.into(),
            ..Self::get(path)
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub tenant: TenantId,
    pub bundle: BundleId,
    pub action: String,
    /// Every segment after the leading slash, verbatim.
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTarget {
    pub tenant: TenantId,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Action(DispatchTarget),
    Admin(AdminTarget),
}

fn bad_url() -> ActionError {
    ActionError::BadRequest("bad url".into())
}

fn non_empty(segment: Option<&&str>) -> Result<String> {
    match segment {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(bad_url()),
    }
}

/// Selects the target of `path`.
///
/// # Example
///
/// ```
/// use actionhost_server::router::{route, Route};
///
/// let Route::Action(target) = route("/db1/custom/list").unwrap() else { panic!() };
/// assert_eq!(target.bundle.to_string(), "design/custom");
/// assert_eq!(target.action, "list");
/// ```
pub fn route(path: &str) -> Result<Route> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.first() != Some(&"") {
        return Err(bad_url());
    }

    let tenant = TenantId::new(non_empty(parts.get(1))?)?;

    if parts.get(2) == Some(&ADMIN_SEGMENT) {
        let action = non_empty(parts.get(3))?;
        return Ok(Route::Admin(AdminTarget { tenant, action }));
    }

    let (bundle, action) = if parts.len() >= 4 {
        let bundle = BundleId::named(non_empty(parts.get(2))?)?;
        (bundle, non_empty(parts.get(3))?)
    } else {
        (BundleId::default(), non_empty(parts.get(2))?)
    };

    Ok(Route::Action(DispatchTarget {
        tenant,
        bundle,
        action,
        segments: parts[1..].iter().map(|s| s.to_string()).collect(),
    }))
}

/// Decodes a query string into an object. A key that appears more than once
/// maps to an array of its values in order.
pub fn parse_query(query: Option<&str>) -> Value {
    let mut out = Map::new();
    let Some(query) = query else {
        return Value::Object(out);
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match out.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                out.insert(key.into_owned(), value);
            }
        }
    }
    Value::Object(out)
}

/// The body as tenant code sees it: parsed JSON when well-formed, the raw
/// text otherwise (an empty POST body is `""`), `null` for GET.
pub fn parse_body(method: RequestMethod, body: &[u8]) -> Value {
    if method == RequestMethod::Get {
        return Value::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
