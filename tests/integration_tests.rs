//! Integration tests for Outlook MCP Server
//!
//! Graph and the identity platform are mocked with wiremock; no real API
//! calls are made.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_string_contains, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use outlook_mcp_server_rust::error::{AuthError, AuthResult};
use outlook_mcp_server_rust::graph::client::GraphClient;
use outlook_mcp_server_rust::graph::query::{FilterSpec, Query, SearchSpec};
use outlook_mcp_server_rust::graph::reconcile::{FailureKind, QueryOutcome};
use outlook_mcp_server_rust::graph::token_cache::{CacheLock, CachedCredential, TokenCache};
use outlook_mcp_server_rust::graph::token_manager::{unix_now, TokenManager, TokenSource};
use outlook_mcp_server_rust::mcp::server::McpServer;

/// Writes `token-N` to the cache on each call; fails from call `fail_from` on
struct CountingSource {
    cache: TokenCache,
    calls: AtomicUsize,
    fail_from: Option<usize>,
}

#[async_trait]
impl TokenSource for CountingSource {
    async fn acquire(&self) -> AuthResult<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|from| n >= from) {
            return Err(AuthError::TokenRefreshFailed {
                message: "invalid_grant: refresh token revoked".to_string(),
            });
        }
        let token = format!("token-{}", n);
        self.cache
            .upsert("default", CachedCredential::new(&token, unix_now() + 3600))?;
        Ok(token)
    }
}

struct Harness {
    _dir: TempDir,
    server: MockServer,
    client: Arc<GraphClient>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_manager(|builder| builder, None).await
    }

    async fn with_manager(
        configure: impl FnOnce(
            outlook_mcp_server_rust::graph::token_manager::TokenManagerBuilder,
        ) -> outlook_mcp_server_rust::graph::token_manager::TokenManagerBuilder,
        fail_from: Option<usize>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("token_cache.json"));
        let source = Arc::new(CountingSource {
            cache: cache.clone(),
            calls: AtomicUsize::new(0),
            fail_from,
        });

        let manager = configure(TokenManager::builder(cache, source).account("default"))
            .build()
            .await
            .unwrap();

        let server = MockServer::start().await;
        let base_url = format!("{}/v1.0", server.uri());
        let client = GraphClient::new(Arc::new(manager), &base_url, Duration::from_secs(5)).unwrap();

        Self {
            _dir: dir,
            server,
            client: Arc::new(client),
        }
    }

    fn base_url(&self) -> String {
        format!("{}/v1.0", self.server.uri())
    }
}

fn message(id: &str, subject: &str) -> Value {
    json!({
        "id": id,
        "subject": subject,
        "from": {"emailAddress": {"name": "Sender", "address": "sender@contoso.com"}},
        "isRead": false,
        "bodyPreview": format!("preview of {}", subject)
    })
}

/// Helper to create a JSON-RPC request line
fn make_request(id: i64, method: &str, params: Option<Value>) -> String {
    let mut request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(p) = params {
        request["params"] = p;
    }
    request.to_string()
}

/// Call a tool and return `(is_error, text)`
async fn call_tool(server: &mut McpServer, name: &str, arguments: Value) -> (bool, String) {
    let line = make_request(1, "tools/call", Some(json!({"name": name, "arguments": arguments})));
    let response = server.handle_message(&line).await.unwrap();
    let result = serde_json::to_value(response.result.unwrap()).unwrap();
    (
        result["isError"].as_bool().unwrap_or(false),
        result["content"][0]["text"].as_str().unwrap().to_string(),
    )
}

mod mcp_protocol_tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let harness = Harness::new().await;
        let mut server = McpServer::new(harness.client.clone());

        let response = server
            .handle_message(&make_request(1, "initialize", Some(json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": {"name": "test-client", "version": "1.0.0"},
                "capabilities": {}
            }))))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "outlook");
        assert!(result["capabilities"]["tools"].is_object());

        let response = server
            .handle_message(&make_request(2, "tools/list", None))
            .await
            .unwrap();
        let names: Vec<String> = response.result.unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["search_emails", "search_events", "next_page"]);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let harness = Harness::new().await;
        let mut server = McpServer::new(harness.client.clone());

        let notification = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(server.handle_message(notification).await.is_none());
        assert!(server.is_initialized());
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let harness = Harness::new().await;
        let mut server = McpServer::new(harness.client.clone());

        let response = server.handle_message("{not json").await.unwrap();
        assert_eq!(response.error.unwrap().code, -32700);
        assert!(response.id.is_none());

        let response = server
            .handle_message(&make_request(5, "resources/list", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);

        let (is_error, text) = call_tool(&mut server, "send_email", json!({})).await;
        assert!(is_error);
        assert!(text.contains("Unknown tool"));

        let (is_error, text) = call_tool(&mut server, "search_emails", json!({"pageSize": 0})).await;
        assert!(is_error);
        assert!(text.contains("pageSize"));
    }
}

mod reconciliation_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_request_passes_continuation_through() {
        let harness = Harness::new().await;
        let next_link = format!("{}/me/messages?$skip=10", harness.base_url());

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$search", "\"invoice\""))
            .and(query_param_is_missing("$filter"))
            .and(header("authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [message("a", "Invoice 1"), message("a", "Invoice 1"), message("b", "Invoice 2")],
                "@odata.nextLink": next_link
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        let query = Query {
            search: Some(SearchSpec::keyword("invoice")),
            ..Default::default()
        };
        let outcome = assert_ok!(harness.client.search_messages(&query).await);
        let page = outcome.page().unwrap();

        let ids: Vec<_> = page.items.iter().map(|m| m.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(page.continuation_token.as_deref(), Some(next_link.as_str()));
    }

    #[tokio::test]
    async fn test_keyword_and_unread_intersects_in_filter_order() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$search", "\"invoice\""))
            .and(query_param("$top", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [message("1", "one"), message("2", "two"), message("3", "three")],
                "@odata.nextLink": format!("{}/me/messages?$skip=3", harness.base_url())
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$filter", "isRead eq false"))
            .and(query_param_is_missing("$search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [message("3", "Y"), message("2", "X"), message("4", "Z")]
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        let query = Query {
            search: Some(SearchSpec::keyword("invoice")),
            filters: FilterSpec {
                unread_only: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let outcome = assert_ok!(harness.client.search_messages(&query).await);
        let page = outcome.page().unwrap();

        let subjects: Vec<_> = page.items.iter().map(|m| m.subject.clone().unwrap()).collect();
        assert_eq!(subjects, vec!["Y", "X"]);
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_plain_query_orders_newest_first() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages"))
            .and(query_param("$orderby", "receivedDateTime desc"))
            .and(query_param("$top", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&harness.server)
            .await;

        let query = Query {
            page_size: 5,
            container_id: Some("inbox".to_string()),
            ..Default::default()
        };
        let outcome = assert_ok!(harness.client.search_messages(&query).await);
        let page = outcome.page().unwrap();
        assert!(page.items.is_empty());
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_transport_failures_become_payloads() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$filter", "hasAttachments eq true"))
            .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
            .mount(&harness.server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$search", "\"report\""))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html>", "text/html"))
            .mount(&harness.server)
            .await;

        let filtered = Query {
            filters: FilterSpec {
                has_attachments: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let outcome = assert_ok!(harness.client.search_messages(&filtered).await);
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Status);
        assert_eq!(failure.status, Some(503));
        assert!(failure.error.contains("service unavailable"));

        let searched = Query {
            search: Some(SearchSpec::keyword("report")),
            ..Default::default()
        };
        let outcome = assert_ok!(harness.client.search_messages(&searched).await);
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::MalformedResponse);

        // One failing half fails the whole intersection
        let both = Query {
            search: Some(SearchSpec::keyword("report")),
            ..filtered
        };
        let outcome = assert_ok!(harness.client.search_messages(&both).await);
        assert!(matches!(outcome, QueryOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_auth_failure_escapes() {
        // A margin longer than the token lifetime forces a refresh per call
        let harness = Harness::with_manager(|b| b.margin_seconds(7200), Some(1)).await;

        let err = assert_err!(harness.client.search_messages(&Query::default()).await);
        assert!(matches!(err, AuthError::TokenRefreshFailed { .. }));
        assert!(harness.server.received_requests().await.unwrap().is_empty());

        let mut server = McpServer::new(harness.client.clone());
        let (is_error, text) = call_tool(&mut server, "search_emails", json!({})).await;
        assert!(is_error);
        assert!(text.contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_next_page_follows_graph_links_only() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$skip", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [message("c", "Page two")]
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        let token = format!("{}/me/messages?$skip=10", harness.base_url());
        let outcome = assert_ok!(harness.client.next_messages(&token).await);
        assert_eq!(outcome.page().unwrap().items[0].id.as_deref(), Some("c"));

        let outcome = assert_ok!(
            harness
                .client
                .next_messages("https://attacker.example/v1.0/me/messages")
                .await
        );
        assert_eq!(
            outcome.failure().unwrap().kind,
            FailureKind::InvalidContinuation
        );
    }
}

mod tool_tests {
    use super::*;

    #[tokio::test]
    async fn test_search_emails_tool_payload() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param(
                "$filter",
                "(categories/any(c:c eq 'A') or categories/any(c:c eq 'B'))",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [message("m1", "Categorized")]
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        let mut server = McpServer::new(harness.client.clone());
        let (is_error, text) =
            call_tool(&mut server, "search_emails", json!({"categories": ["A", "B"]})).await;
        assert!(!is_error);

        let payload: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["items"][0]["id"], "m1");
        assert_eq!(payload["items"][0]["from"]["address"], "sender@contoso.com");
        assert!(payload.get("continuation_token").is_none());
    }

    #[tokio::test]
    async fn test_search_events_tool_uses_calendar_view() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/calendarView"))
            .and(query_param("startDateTime", "2025-03-01T00:00:00Z"))
            .and(query_param("endDateTime", "2025-03-07T23:59:59Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "id": "e1",
                    "subject": "Planning",
                    "start": {"dateTime": "2025-03-03T10:00:00.0000000", "timeZone": "UTC"},
                    "end": {"dateTime": "2025-03-03T11:00:00.0000000", "timeZone": "UTC"}
                }]
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        let mut server = McpServer::new(harness.client.clone());
        let (is_error, text) = call_tool(
            &mut server,
            "search_events",
            json!({"startDate": "2025-03-01", "endDate": "2025-03-07"}),
        )
        .await;
        assert!(!is_error, "{}", text);

        let payload: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["items"][0]["subject"], "Planning");
        assert_eq!(payload["items"][0]["start"], "2025-03-03T10:00:00.0000000");
    }

    #[tokio::test]
    async fn test_failure_payload_is_not_a_tool_error() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/events"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Access denied"))
            .mount(&harness.server)
            .await;

        let mut server = McpServer::new(harness.client.clone());
        let (is_error, text) = call_tool(&mut server, "search_events", json!({})).await;
        assert!(!is_error);

        let payload: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["kind"], "status");
        assert_eq!(payload["status"], 403);
    }

    #[tokio::test]
    async fn test_next_page_reads_event_links_as_events() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/calendarView"))
            .and(query_param("$skip", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "id": "e2",
                    "subject": "Retro",
                    "start": {"dateTime": "2025-03-05T15:00:00.0000000", "timeZone": "UTC"},
                    "end": {"dateTime": "2025-03-05T16:00:00.0000000", "timeZone": "UTC"},
                    "location": {"displayName": "Room 4"}
                }]
            })))
            .expect(1)
            .mount(&harness.server)
            .await;

        let mut server = McpServer::new(harness.client.clone());
        let token = format!("{}/me/calendarView?$skip=10", harness.base_url());
        let (is_error, text) =
            call_tool(&mut server, "next_page", json!({"continuationToken": token})).await;
        assert!(!is_error, "{}", text);

        let payload: Value = serde_json::from_str(&text).unwrap();
        let event = &payload["items"][0];
        assert_eq!(event["subject"], "Retro");
        assert_eq!(event["start"], "2025-03-05T15:00:00.0000000");
        assert_eq!(event["end"], "2025-03-05T16:00:00.0000000");
        assert_eq!(event["location"], "Room 4");
        assert!(event.get("receivedDateTime").is_none());
    }

    #[tokio::test]
    async fn test_next_page_refuses_contradicting_kind() {
        let harness = Harness::new().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(0)
            .mount(&harness.server)
            .await;

        let mut server = McpServer::new(harness.client.clone());
        let token = format!("{}/me/events?$skip=10", harness.base_url());
        let (is_error, text) = call_tool(
            &mut server,
            "next_page",
            json!({"continuationToken": token, "kind": "emails"}),
        )
        .await;
        assert!(!is_error);

        let payload: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["kind"], "invalid_continuation");
        assert!(payload.get("items").is_none());
    }
}

mod authenticator_tests {
    use super::*;
    use outlook_mcp_server_rust::config::Config;
    use outlook_mcp_server_rust::graph::auth::MicrosoftAuthenticator;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::new().unwrap();
        config.client_id = Some("client-123".to_string());
        config.client_secret = None;
        config.token_cache_path = dir.path().join("token_cache.json");
        config.account = "default".to_string();
        config.interactive = false;
        config
    }

    #[tokio::test]
    async fn test_refresh_grant_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let config = config(&dir);

        let mut seeded = CachedCredential::new("old-token", 0);
        seeded.refresh_token = Some("refresh-1".to_string());
        TokenCache::new(&config.token_cache_path)
            .upsert("default", seeded)
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .and(body_string_contains("client_id=client-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": "new-token",
                "refresh_token": "refresh-2",
                "expires_in": 3599,
                "scope": "Mail.ReadWrite User.Read"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let authenticator = MicrosoftAuthenticator::new(config)
            .unwrap()
            .with_token_url(format!("{}/common/oauth2/v2.0/token", server.uri()));

        let token = assert_ok!(authenticator.acquire().await);
        assert_eq!(token, "new-token");

        let cached = authenticator.cache().credential(Some("default")).unwrap().unwrap();
        assert_eq!(cached.token, "new-token");
        assert_eq!(cached.refresh_token.as_deref(), Some("refresh-2"));
        assert!(cached.expires_at > unix_now() + 3000);
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let config = config(&dir);

        let mut seeded = CachedCredential::new("old-token", 0);
        seeded.refresh_token = Some("revoked".to_string());
        TokenCache::new(&config.token_cache_path)
            .upsert("default", seeded)
            .unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: The refresh token has been revoked."
            })))
            .mount(&server)
            .await;

        let authenticator = MicrosoftAuthenticator::new(config)
            .unwrap()
            .with_token_url(format!("{}/token", server.uri()));

        let err = assert_err!(authenticator.acquire().await);
        match err {
            AuthError::TokenRefreshFailed { message } => assert!(message.starts_with("invalid_grant")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_code_exchange_waits_for_cache_lock() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let mut config = config(&dir);
        config.lock_wait = Duration::from_secs(5);

        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "from-code",
                "refresh_token": "refresh-code",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let authenticator = MicrosoftAuthenticator::new(config)
            .unwrap()
            .with_token_url(format!("{}/token", server.uri()));

        let held = CacheLock::acquire(&authenticator.cache().lock_path(), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        // Still waiting on the lock, so nothing is sent or written
        let blocked = tokio::time::timeout(
            Duration::from_millis(300),
            authenticator.exchange_code("auth-code"),
        )
        .await;
        assert!(blocked.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(authenticator.cache().credential(Some("default")).unwrap().is_none());

        drop(held);
        let credential = assert_ok!(authenticator.exchange_code("auth-code").await);
        assert_eq!(credential.token, "from-code");

        let cached = authenticator.cache().credential(Some("default")).unwrap().unwrap();
        assert_eq!(cached.refresh_token.as_deref(), Some("refresh-code"));
    }

    #[tokio::test]
    async fn test_manager_over_authenticator_reuses_token() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let config = config(&dir);

        let mut seeded = CachedCredential::new("old-token", 0);
        seeded.refresh_token = Some("refresh-1".to_string());
        let cache = TokenCache::new(&config.token_cache_path);
        cache.upsert("default", seeded).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let authenticator = Arc::new(
            MicrosoftAuthenticator::new(config)
                .unwrap()
                .with_token_url(format!("{}/token", server.uri())),
        );
        let manager = TokenManager::builder(cache.clone(), authenticator)
            .account("default")
            .build()
            .await
            .unwrap();

        assert_eq!(assert_ok!(manager.get_token().await), "fresh");
        assert_eq!(assert_ok!(manager.get_token().await), "fresh");

        // The refresh token is kept when the response does not rotate it
        let cached = cache.credential(Some("default")).unwrap().unwrap();
        assert_eq!(cached.refresh_token.as_deref(), Some("refresh-1"));
    }
}
