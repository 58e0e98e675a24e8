//! Result reconciliation
//!
//! Graph rejects requests that mix `$search` with `$filter`. A query that
//! needs both is split into two requests and the results are intersected by
//! id. Every vendor-communication failure is folded into a [`QueryFailure`]
//! here; only [`AuthError`] escapes.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::graph::USER_PATH;
use crate::error::{AuthResult, GraphApiError, OutlookMcpError};
use crate::graph::client::GraphClient;
use crate::graph::query::{
    build_event_params, build_filter_params, build_search_params, param, EventQuery, GraphParams,
    Query,
};
use crate::graph::types::{GraphCollection, GraphItem, Identified, Page};

/// Collection a request is issued against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// All messages, or one mail folder's messages
    Messages { folder_id: Option<String> },
    /// All events of the default calendar, or of one calendar
    Events { calendar_id: Option<String> },
    /// Occurrences inside a time window
    CalendarView { calendar_id: Option<String> },
}

impl Endpoint {
    /// Path relative to the Graph base URL
    pub fn path(&self) -> String {
        match self {
            Endpoint::Messages { folder_id: None } => format!("{}/messages", USER_PATH),
            Endpoint::Messages {
                folder_id: Some(id),
            } => format!("{}/mailFolders/{}/messages", USER_PATH, urlencoding::encode(id)),
            Endpoint::Events { calendar_id: None } => format!("{}/events", USER_PATH),
            Endpoint::Events {
                calendar_id: Some(id),
            } => format!("{}/calendars/{}/events", USER_PATH, urlencoding::encode(id)),
            Endpoint::CalendarView { calendar_id: None } => format!("{}/calendarView", USER_PATH),
            Endpoint::CalendarView {
                calendar_id: Some(id),
            } => format!("{}/calendars/{}/calendarView", USER_PATH, urlencoding::encode(id)),
        }
    }
}

/// One GET against a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
    pub endpoint: Endpoint,
    pub params: GraphParams,
}

/// How a query is turned into requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPlan {
    /// One request; its continuation link is passed through
    Single(CollectionRequest),
    /// Two independent requests whose results are intersected by id
    Intersect {
        search: CollectionRequest,
        filter: CollectionRequest,
    },
}

impl RequestPlan {
    pub fn is_intersect(&self) -> bool {
        matches!(self, RequestPlan::Intersect { .. })
    }
}

/// Plan a message query.
///
/// With neither search nor filter criteria the request carries only paging
/// and newest-first ordering.
pub fn plan_messages(query: &Query) -> RequestPlan {
    let top = query.page_size.to_string();
    let endpoint = Endpoint::Messages {
        folder_id: query.container_id.clone(),
    };
    let request = |params: GraphParams| CollectionRequest {
        endpoint: endpoint.clone(),
        params: params.with(param::TOP, top.clone()),
    };

    match (query.has_search(), query.has_filter()) {
        (true, true) => RequestPlan::Intersect {
            search: request(build_search_params(query.search.as_ref())),
            filter: request(build_filter_params(&query.filters)),
        },
        (true, false) => RequestPlan::Single(request(build_search_params(query.search.as_ref()))),
        (false, true) => RequestPlan::Single(request(build_filter_params(&query.filters))),
        (false, false) => RequestPlan::Single(request(
            GraphParams::new().with(param::ORDER_BY, "receivedDateTime desc"),
        )),
    }
}

/// Plan an event query.
///
/// A bounded date range is served by calendarView, which cannot take a
/// `$filter`; other criteria then go to the events collection and the two
/// results are intersected with calendarView in the search role.
pub fn plan_events(query: &EventQuery) -> RequestPlan {
    let params = build_event_params(query);
    let calendar_id = query.calendar_id.clone();
    let has_filter = params.has_filter();

    let events = CollectionRequest {
        endpoint: Endpoint::Events {
            calendar_id: calendar_id.clone(),
        },
        params: params.filter,
    };

    match params.window {
        Some(window) => {
            let view = CollectionRequest {
                endpoint: Endpoint::CalendarView { calendar_id },
                params: window,
            };
            if has_filter {
                RequestPlan::Intersect {
                    search: view,
                    filter: events,
                }
            } else {
                RequestPlan::Single(view)
            }
        }
        None => RequestPlan::Single(events),
    }
}

/// Category of a folded vendor failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Graph answered with a non-2xx status
    Status,
    /// The request never completed
    Transport,
    /// The body was not the expected JSON
    MalformedResponse,
    /// A continuation token pointed somewhere else
    InvalidContinuation,
}

/// Structured error payload returned instead of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub error: String,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl QueryFailure {
    pub fn invalid_continuation(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            kind: FailureKind::InvalidContinuation,
            status: None,
        }
    }

    fn from_error(err: &OutlookMcpError) -> Self {
        let (kind, status) = match err {
            OutlookMcpError::Graph(GraphApiError::Status { status, .. }) => {
                (FailureKind::Status, Some(*status))
            }
            OutlookMcpError::Graph(GraphApiError::MalformedResponse { .. })
            | OutlookMcpError::Json(_) => (FailureKind::MalformedResponse, None),
            OutlookMcpError::Graph(GraphApiError::ForeignContinuation { .. }) => {
                (FailureKind::InvalidContinuation, None)
            }
            _ => (FailureKind::Transport, None),
        };
        Self {
            error: err.to_string(),
            kind,
            status,
        }
    }
}

/// Which projection a collection's items are read into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Emails,
    Events,
}

impl CollectionKind {
    /// Infer the collection from the last segment of a link's path
    pub fn from_link(link: &str) -> Option<Self> {
        let path = link.split(['?', '#']).next().unwrap_or(link);
        match path.trim_end_matches('/').rsplit('/').next()? {
            "messages" => Some(CollectionKind::Emails),
            "events" | "calendarView" => Some(CollectionKind::Events),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Emails => "emails",
            CollectionKind::Events => "events",
        }
    }
}

/// Decide how to read a continuation page.
///
/// The link's own path decides; `requested` only fills in when the path is
/// not recognized, and is refused when it contradicts the path.
pub fn continuation_kind(
    token: &str,
    requested: Option<CollectionKind>,
) -> Result<CollectionKind, QueryFailure> {
    match (CollectionKind::from_link(token), requested) {
        (Some(found), Some(asked)) if found != asked => Err(QueryFailure::invalid_continuation(
            format!(
                "Continuation token belongs to {}, not {}",
                found.as_str(),
                asked.as_str()
            ),
        )),
        (Some(found), _) => Ok(found),
        (None, Some(asked)) => Ok(asked),
        (None, None) => Err(QueryFailure::invalid_continuation(
            "Continuation token does not name a messages or events collection",
        )),
    }
}

/// Either a page of items or a folded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryOutcome<T> {
    Page(Page<T>),
    Failed(QueryFailure),
}

impl<T> QueryOutcome<T> {
    pub fn page(&self) -> Option<&Page<T>> {
        match self {
            QueryOutcome::Page(page) => Some(page),
            QueryOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&QueryFailure> {
        match self {
            QueryOutcome::Page(_) => None,
            QueryOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Keep the first occurrence of each id. Items without an id are dropped.
pub fn dedupe_by_id<T: Identified>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| match item.id() {
            Some(id) => seen.insert(id.to_string()),
            None => false,
        })
        .collect()
}

/// Items of `filter` whose id also appears in `search`, in filter order.
///
/// When `filter` repeats an id, the position of its first occurrence is kept
/// and the value of its last occurrence wins.
pub fn intersect_by_id<T: Identified>(search: &[T], filter: Vec<T>) -> Vec<T> {
    let search_ids: HashSet<&str> = search.iter().filter_map(Identified::id).collect();

    let mut order = Vec::new();
    let mut latest: HashMap<String, T> = HashMap::new();
    for item in filter {
        let Some(id) = item.id().filter(|id| search_ids.contains(id)).map(str::to_string) else {
            continue;
        };
        if latest.insert(id.clone(), item).is_none() {
            order.push(id);
        }
    }

    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

/// Executes request plans against Graph
pub struct ResultReconciler<'a> {
    client: &'a GraphClient,
}

impl<'a> ResultReconciler<'a> {
    pub fn new(client: &'a GraphClient) -> Self {
        Self { client }
    }

    /// Run a plan. Auth failures are returned as `Err`; every other failure
    /// comes back as [`QueryOutcome::Failed`].
    pub async fn execute<T: GraphItem>(&self, plan: &RequestPlan) -> AuthResult<QueryOutcome<T>> {
        match plan {
            RequestPlan::Single(request) => {
                tracing::debug!("Single request to {}", request.endpoint.path());
                let collection = match settle(self.client.fetch::<T>(request).await)? {
                    Ok(collection) => collection,
                    Err(failure) => return Ok(QueryOutcome::Failed(failure)),
                };
                Ok(QueryOutcome::Page(Page::new(
                    dedupe_by_id(collection.value),
                    collection.next_link,
                )))
            }
            RequestPlan::Intersect { search, filter } => {
                tracing::debug!(
                    "Intersecting {} with {}",
                    search.endpoint.path(),
                    filter.endpoint.path()
                );
                let (search_result, filter_result) = tokio::join!(
                    self.client.fetch::<T>(search),
                    self.client.fetch::<T>(filter)
                );
                let search_result = settle(search_result)?;
                let filter_result = settle(filter_result)?;

                let (search_page, filter_page) = match (search_result, filter_result) {
                    (Ok(s), Ok(f)) => (s, f),
                    (Err(failure), _) | (_, Err(failure)) => {
                        return Ok(QueryOutcome::Failed(failure))
                    }
                };

                let items = intersect_by_id(&search_page.value, filter_page.value);
                tracing::debug!("Intersection kept {} items", items.len());
                Ok(QueryOutcome::Page(Page::new(items, None)))
            }
        }
    }

    /// Follow a continuation token from an earlier page
    pub async fn next_page<T: GraphItem>(&self, token: &str) -> AuthResult<QueryOutcome<T>> {
        match settle(self.client.follow::<T>(token).await)? {
            Ok(collection) => Ok(QueryOutcome::Page(Page::new(
                dedupe_by_id(collection.value),
                collection.next_link,
            ))),
            Err(failure) => Ok(QueryOutcome::Failed(failure)),
        }
    }
}

/// Split a fetch result into auth failures, which escape, and folded
/// vendor failures
fn settle<T>(
    result: crate::error::Result<GraphCollection<T>>,
) -> AuthResult<Result<GraphCollection<T>, QueryFailure>> {
    match result {
        Ok(collection) => Ok(Ok(collection)),
        Err(OutlookMcpError::Auth(err)) => Err(err),
        Err(err) => {
            tracing::warn!("Graph request failed: {}", err);
            Ok(Err(QueryFailure::from_error(&err)))
        }
    }
}
