//! Query composition for Graph collection requests
//!
//! Pure translation of structured search and filter criteria into OData query
//! parameters. Nothing here performs I/O.
//!
//! Graph cannot combine `$search` and `$filter` on the messages collection,
//! so search and filter parameters are built separately and the caller
//! decides how to combine the results (see [`crate::graph::reconcile`]).

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Query parameter names
pub mod param {
    pub const FILTER: &str = "$filter";
    pub const SEARCH: &str = "$search";
    pub const TOP: &str = "$top";
    pub const ORDER_BY: &str = "$orderby";
    pub const START_DATE_TIME: &str = "startDateTime";
    pub const END_DATE_TIME: &str = "endDateTime";
}

/// Page size used when the caller does not pick one
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Ordered query parameters.
///
/// A parameter is either present with a non-empty value or absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GraphParams(BTreeMap<String, String>);

impl GraphParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter; empty values leave the key absent
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.0.remove(key);
        } else {
            self.0.insert(key.to_string(), value);
        }
    }

    /// Builder form of [`GraphParams::insert`]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Inclusive time window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Parse optional bounds given as RFC 3339 timestamps or `YYYY-MM-DD`.
    ///
    /// A bare start date means the start of that day and a bare end date the
    /// last second of it.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, ValidationError> {
        Ok(Self {
            start: start.map(|s| parse_bound("startDate", s, false)).transpose()?,
            end: end.map(|s| parse_bound("endDate", s, true)).transpose()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }
}

fn parse_bound(name: &str, raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, ValidationError> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        ValidationError::InvalidParameter {
            name: name.to_string(),
            message: format!("expected an RFC 3339 timestamp or YYYY-MM-DD, got '{}'", raw),
        }
    })?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| ValidationError::InvalidParameter {
            name: name.to_string(),
            message: format!("'{}' is out of range", raw),
        })
}

/// Render a timestamp the way OData comparison clauses expect it
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Message or event importance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Normal,
    High,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Normal => "normal",
            Importance::High => "high",
        }
    }
}

/// Free-text search. Only one term is honored; `keyword` wins over `subject`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchSpec {
    pub keyword: Option<String>,
    pub subject: Option<String>,
}

impl SearchSpec {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: Some(keyword.into()),
            subject: None,
        }
    }

    pub fn subject(subject: impl Into<String>) -> Self {
        Self {
            keyword: None,
            subject: Some(subject.into()),
        }
    }

    /// Whether a search term would be emitted
    pub fn is_active(&self) -> bool {
        non_empty(&self.keyword).is_some() || non_empty(&self.subject).is_some()
    }
}

/// Structured message filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub date: Option<DateRange>,
    pub importance: Option<Importance>,
    pub sender: Option<String>,
    pub unread_only: bool,
    pub has_attachments: bool,
    pub categories: Vec<String>,
}

impl FilterSpec {
    /// Whether at least one clause would be emitted
    pub fn has_criteria(&self) -> bool {
        !self.clauses().is_empty()
    }

    fn clauses(&self) -> Vec<String> {
        let mut clauses = Vec::new();
        if let Some(date) = &self.date {
            clauses.extend(date_clauses("receivedDateTime", date));
        }
        if let Some(importance) = self.importance {
            clauses.push(format!("importance eq '{}'", importance.as_str()));
        }
        if let Some(sender) = non_empty(&self.sender) {
            clauses.push(format!("from/emailAddress/address eq '{}'", sender));
        }
        if self.unread_only {
            clauses.push("isRead eq false".to_string());
        }
        if self.has_attachments {
            clauses.push("hasAttachments eq true".to_string());
        }
        if let Some(group) = categories_clause(&self.categories) {
            clauses.push(group);
        }
        clauses
    }
}

/// A message query as handed over by a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub filters: FilterSpec,
    pub search: Option<SearchSpec>,
    pub page_size: u32,
    /// Mail folder to scope the query to
    pub container_id: Option<String>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            filters: FilterSpec::default(),
            search: None,
            page_size: DEFAULT_PAGE_SIZE,
            container_id: None,
        }
    }
}

impl Query {
    pub fn has_search(&self) -> bool {
        self.search.as_ref().is_some_and(SearchSpec::is_active)
    }

    pub fn has_filter(&self) -> bool {
        self.filters.has_criteria()
    }
}

/// Build the `$search` parameter.
///
/// A keyword becomes a quoted phrase; otherwise a subject becomes a quoted
/// `subject:` phrase. The two are never combined.
pub fn build_search_params(search: Option<&SearchSpec>) -> GraphParams {
    let mut params = GraphParams::new();
    let Some(search) = search else {
        return params;
    };

    if let Some(keyword) = non_empty(&search.keyword) {
        params.insert(param::SEARCH, format!("\"{}\"", keyword));
    } else if let Some(subject) = non_empty(&search.subject) {
        params.insert(param::SEARCH, format!("\"subject:{}\"", subject));
    }
    params
}

/// Build the `$filter` parameter as a conjunction of the set criteria.
///
/// Only category names are quote-escaped. Importance is an enum, but sender
/// text is interpolated as given.
pub fn build_filter_params(filters: &FilterSpec) -> GraphParams {
    let mut params = GraphParams::new();
    params.insert(param::FILTER, filters.clauses().join(" and "));
    params
}

/// Free-text matching for events, expressed as `contains()` filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSearchSpec {
    pub subject: Option<String>,
    pub body: Option<String>,
}

/// Structured event filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilterSpec {
    pub date: Option<DateRange>,
    pub importance: Option<Importance>,
    pub is_all_day: Option<bool>,
    pub has_attachments: Option<bool>,
    pub categories: Vec<String>,
    pub is_cancelled: Option<bool>,
}

/// An event query as handed over by a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub filters: EventFilterSpec,
    pub search: Option<EventSearchSpec>,
    pub page_size: u32,
    pub calendar_id: Option<String>,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            filters: EventFilterSpec::default(),
            search: None,
            page_size: DEFAULT_PAGE_SIZE,
            calendar_id: None,
        }
    }
}

/// Parameters for the two event requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParams {
    /// Parameters for the events collection (`$filter` when any clause is set)
    pub filter: GraphParams,
    /// Parameters for calendarView, present only for a fully bounded range
    pub window: Option<GraphParams>,
}

impl EventParams {
    pub fn has_filter(&self) -> bool {
        self.filter.contains_key(param::FILTER)
    }
}

/// Build event parameters.
///
/// calendarView needs both bounds, so a half-open range is expressed as a
/// comparison on the event's own start or end instead.
///
/// Categories form the same OR group as for messages: an event matches when
/// it carries any of the names, not all of them.
pub fn build_event_params(query: &EventQuery) -> EventParams {
    let filters = &query.filters;
    let top = query.page_size.to_string();
    let mut clauses = Vec::new();

    let window = match &filters.date {
        Some(range) if range.is_bounded() => {
            let mut window = GraphParams::new().with(param::TOP, top.clone());
            if let (Some(start), Some(end)) = (range.start, range.end) {
                window.insert(param::START_DATE_TIME, format_timestamp(&start));
                window.insert(param::END_DATE_TIME, format_timestamp(&end));
            }
            Some(window)
        }
        Some(range) => {
            if let Some(start) = range.start {
                clauses.push(format!("start/dateTime ge '{}'", naive_timestamp(&start)));
            }
            if let Some(end) = range.end {
                clauses.push(format!("end/dateTime le '{}'", naive_timestamp(&end)));
            }
            None
        }
        None => None,
    };

    if let Some(importance) = filters.importance {
        clauses.push(format!("importance eq '{}'", importance.as_str()));
    }
    if let Some(all_day) = filters.is_all_day {
        clauses.push(format!("isAllDay eq {}", all_day));
    }
    if let Some(has_attachments) = filters.has_attachments {
        clauses.push(format!("hasAttachments eq {}", has_attachments));
    }
    if let Some(group) = categories_clause(&filters.categories) {
        clauses.push(group);
    }
    if let Some(cancelled) = filters.is_cancelled {
        clauses.push(format!("isCancelled eq {}", cancelled));
    }
    if let Some(search) = &query.search {
        if let Some(subject) = non_empty(&search.subject) {
            clauses.push(format!("contains(subject, '{}')", subject));
        }
        if let Some(body) = non_empty(&search.body) {
            clauses.push(format!("contains(body/content, '{}')", body));
        }
    }

    let mut filter = GraphParams::new().with(param::TOP, top);
    filter.insert(param::FILTER, clauses.join(" and "));

    EventParams { filter, window }
}

/// Comparison clauses for a date range on `field`
fn date_clauses(field: &str, range: &DateRange) -> Vec<String> {
    let mut clauses = Vec::new();
    if let Some(start) = &range.start {
        clauses.push(format!("{} ge {}", field, format_timestamp(start)));
    }
    if let Some(end) = &range.end {
        clauses.push(format!("{} le {}", field, format_timestamp(end)));
    }
    clauses
}

/// `(categories/any(c:c eq 'A') or ...)`, or `None` when no usable names
fn categories_clause(categories: &[String]) -> Option<String> {
    let conditions: Vec<String> = categories
        .iter()
        .filter(|c| !c.is_empty())
        .map(|c| format!("categories/any(c:c eq '{}')", escape_literal(c)))
        .collect();

    if conditions.is_empty() {
        None
    } else {
        Some(format!("({})", conditions.join(" or ")))
    }
}

/// OData string literals escape `'` by doubling it
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Event `dateTime` fields are zone-less strings
fn naive_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
