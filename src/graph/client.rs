//! Microsoft Graph client
//!
//! Thin HTTP layer: every request is authorized through the shared
//! [`TokenManager`] and answers are decoded into [`GraphCollection`]s.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{AuthResult, GraphApiError, OutlookMcpError, Result};
use crate::graph::query::{EventQuery, GraphParams, Query};
use crate::graph::reconcile::{plan_events, plan_messages, CollectionRequest, QueryOutcome, ResultReconciler};
use crate::graph::token_manager::TokenManager;
use crate::graph::types::{EventSummary, GraphCollection, GraphItem, MessageSummary};

/// Microsoft Graph client
pub struct GraphClient {
    /// HTTP client
    http_client: reqwest::Client,

    /// Shared token manager
    token_manager: Arc<TokenManager>,

    /// Base URL without trailing slash
    base_url: String,
}

impl GraphClient {
    /// Create a client with a client-wide request timeout
    pub fn new(token_manager: Arc<TokenManager>, base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            token_manager,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config, token_manager: Arc<TokenManager>) -> Result<Self> {
        Self::new(token_manager, &config.graph_base_url, config.request_timeout)
    }

    /// GET one page of a collection
    pub async fn get_collection<T: GraphItem>(
        &self,
        url: &str,
        params: Option<&GraphParams>,
    ) -> Result<GraphCollection<T>> {
        let token = self.token_manager.get_token().await?;

        let mut request = self.http_client.get(url).bearer_auth(&token);
        if let Some(params) = params {
            request = request.query(params);
        }

        let response = request.send().await.map_err(|e| {
            OutlookMcpError::Graph(GraphApiError::Request {
                message: e.to_string(),
            })
        })?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(OutlookMcpError::Graph(GraphApiError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        serde_json::from_str(&body).map_err(|e| {
            OutlookMcpError::Graph(GraphApiError::MalformedResponse {
                message: e.to_string(),
            })
        })
    }

    /// Issue a planned request
    pub async fn fetch<T: GraphItem>(&self, request: &CollectionRequest) -> Result<GraphCollection<T>> {
        let url = format!("{}{}", self.base_url, request.endpoint.path());
        self.get_collection(&url, Some(&request.params)).await
    }

    /// GET a continuation link as-is, after checking it targets this client's
    /// Graph endpoint
    pub async fn follow<T: GraphItem>(&self, next_link: &str) -> Result<GraphCollection<T>> {
        let prefix = format!("{}/", self.base_url);
        if !next_link.starts_with(&prefix) {
            return Err(OutlookMcpError::Graph(GraphApiError::ForeignContinuation {
                base_url: self.base_url.clone(),
            }));
        }
        self.get_collection(next_link, None).await
    }

    pub fn reconciler(&self) -> ResultReconciler<'_> {
        ResultReconciler::new(self)
    }

    /// Search messages, reconciling `$search` and `$filter` when both apply
    pub async fn search_messages(&self, query: &Query) -> AuthResult<QueryOutcome<MessageSummary>> {
        self.reconciler().execute(&plan_messages(query)).await
    }

    /// Search events, reconciling calendarView with `$filter` when both apply
    pub async fn search_events(&self, query: &EventQuery) -> AuthResult<QueryOutcome<EventSummary>> {
        self.reconciler().execute(&plan_events(query)).await
    }

    pub async fn next_messages(&self, token: &str) -> AuthResult<QueryOutcome<MessageSummary>> {
        self.reconciler().next_page(token).await
    }

    pub async fn next_events(&self, token: &str) -> AuthResult<QueryOutcome<EventSummary>> {
        self.reconciler().next_page(token).await
    }
}
