//! Dispatcher.
//!
//! Drives one request from routing to its final response event:
//!
//! 1. route the path (action or admin)
//! 2. revalidate the bundle through the document cache
//! 3. allocate a store pool scoped to the tenant and the caller
//! 4. run the action on a blocking thread under the execution deadline
//! 5. report any error the action did not turn into a response itself

use std::future::Future;
use std::sync::Arc;

use actionhost_client::{DocumentStore, StorePool};
use actionhost_common::{ActionError, BundleKey, ResponseEvent, Result};
use serde_json::json;
use tokio::runtime::Handle;

use crate::admin::{merge_params, AdminHandler, DisabledAdmin};
use crate::config::ServerConfig;
use crate::context::DispatchContext;
use crate::document_cache::{CacheOutcome, DocumentCache};
use crate::response::{DispatchState, ResponseChannel, ResponseReceiver};
use crate::router::{parse_body, parse_query, route, AdminTarget, DispatchTarget, InboundRequest, Route};
use crate::runtime::Sandbox;

pub struct Dispatcher {
    store: Arc<dyn DocumentStore>,
    cache: DocumentCache,
    admin: Arc<dyn AdminHandler>,
    config: ServerConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: DocumentCache::new(Arc::clone(&store), config.cache.clone()),
            store,
            admin: Arc::new(DisabledAdmin),
            config,
        })
    }

    /// Forwards `/<tenant>/_admin_db/...` requests to `admin`.
    pub fn with_admin(mut self, admin: Arc<dyn AdminHandler>) -> Self {
        self.admin = admin;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    /// Starts processing `request` and returns the stream of its response
    /// events. Must be called from within a tokio runtime.
    pub fn dispatch(self: &Arc<Self>, request: InboundRequest) -> ResponseReceiver {
        let (channel, receiver) = ResponseChannel::new(self.config.stream_buffer);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            tracing::debug!("dispatch {} {}", request.method.as_str(), request.path);
            if let Err(err) = this.process(request, Arc::clone(&channel)).await {
                if err.is_request_error() {
                    tracing::debug!("request failed: {}", err);
                } else {
                    tracing::error!("request failed: {}", err);
                }
                channel.fail(&err).await;
            }
        });

        receiver
    }

    async fn process(&self, request: InboundRequest, channel: Arc<ResponseChannel>) -> Result<()> {
        match route(&request.path)? {
            Route::Action(target) => self.process_action(target, request, channel).await,
            Route::Admin(target) => self.process_admin(target, request, channel).await,
        }
    }

    async fn with_store_deadline<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let deadline = self.config.limits.store_call_timeout;
        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| ActionError::Timeout(deadline))?
    }

    async fn process_action(
        &self,
        target: DispatchTarget,
        request: InboundRequest,
        channel: Arc<ResponseChannel>,
    ) -> Result<()> {
        channel.advance(DispatchState::Resolving)?;

        let key = BundleKey::new(target.tenant.clone(), target.bundle.clone());
        let bundle = match self
            .with_store_deadline(self.cache.resolve(&key, &request.credentials))
            .await?
        {
            CacheOutcome::Unchanged(bundle) | CacheOutcome::Fresh(bundle) => bundle,
            CacheOutcome::NotFound => return Err(ActionError::NotATenant(key.to_string())),
        };

        let pool = StorePool::new(
            Arc::clone(&self.store),
            target.tenant.clone(),
            request.credentials.clone(),
            self.config.pool_config(),
        );
        let dispatch = Arc::new(DispatchContext::new(
            request.method,
            target,
            parse_query(request.query.as_deref()),
            parse_body(request.method, &request.body),
            request.host,
            channel,
            pool,
        ));

        let sandbox = Sandbox::new(self.config.limits.clone(), Handle::current());
        let job = {
            let dispatch = Arc::clone(&dispatch);
            tokio::task::spawn_blocking(move || sandbox.run(bundle, dispatch))
        };

        let deadline = self.config.limits.execution_timeout;
        match tokio::time::timeout(deadline, job).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => Err(ActionError::Runtime(format!("action aborted: {}", join_err))),
            Err(_) => {
                tracing::warn!(
                    "action {} on {} exceeded {:?}, cancelling",
                    dispatch.target.action,
                    dispatch.target.tenant,
                    deadline
                );
                dispatch.cancel();
                Err(ActionError::Timeout(deadline))
            }
        }
    }

    async fn process_admin(
        &self,
        target: AdminTarget,
        request: InboundRequest,
        channel: Arc<ResponseChannel>,
    ) -> Result<()> {
        let user = match self.with_store_deadline(self.store.session(&request.credentials)).await {
            Ok(user) => user,
            Err(err) => {
                tracing::warn!("reading user context for {} failed: {}", target.tenant, err);
                return channel
                    .reply(ResponseEvent::error(json!("error reading user context")))
                    .await;
            }
        };

        let params = merge_params(
            parse_query(request.query.as_deref()),
            parse_body(request.method, &request.body),
        );

        tracing::info!(
            "admin action {} on {} by {}",
            target.action,
            target.tenant,
            user.name.as_deref().unwrap_or("anonymous")
        );
        let result = self
            .admin
            .process_admin_action(&target.action, &target.tenant, user.name.as_deref(), &user.roles, params)
            .await?;
        channel.reply(ResponseEvent::ok(result)).await
    }
}
