use chrono::{Duration as ChronoDuration, Utc};
use forgeledger_auth::{JwtClaims, Role};
use forgeledger_core::{TenantId, UserId};
use forgeledger_infra::{EngineSettings, LedgerEngine};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over an in-memory engine, bound to an ephemeral port.
        let engine = LedgerEngine::in_memory(EngineSettings::default());
        let app = forgeledger_api::app::build_router(engine, JWT_SECRET.to_string());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(tenant_id: TenantId, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: UserId::new(),
        tenant_id,
        roles,
        issued_at: now - ChronoDuration::minutes(1),
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

async fn send_json(
    req: reqwest::RequestBuilder,
    token: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let req = req.bearer_auth(token);
    let req = match body {
        Some(body) => req.json(&body),
        None => req,
    };
    let res = req.send().await.unwrap();
    let status = res.status();
    let body = res.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

/// Creates Cash (asset) and Sales (revenue); returns their ids.
async fn seed_accounts(srv: &TestServer, client: &reqwest::Client, token: &str) -> (String, String) {
    let mut ids = Vec::new();
    for (code, name, kind) in [("101", "Cash", "asset"), ("401", "Sales", "revenue")] {
        let (status, body) = send_json(
            client.post(srv.url("/accounts")),
            token,
            Some(json!({ "code": code, "name": name, "account_type": kind })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "create account {code}: {body}");
        ids.push(body["id"].as_str().unwrap().to_string());
    }
    (ids[0].clone(), ids[1].clone())
}

async fn create_sale(
    srv: &TestServer,
    client: &reqwest::Client,
    token: &str,
    cash: &str,
    sales: &str,
    debit: i64,
    credit: i64,
) -> String {
    let (status, body) = send_json(
        client.post(srv.url("/vouchers")),
        token,
        Some(json!({
            "date": "2024-03-15",
            "description": "cash sale",
            "entries": [
                { "account_id": cash, "debit": debit },
                { "account_id": sales, "credit": credit },
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create voucher: {body}");
    assert_eq!(body["status"], "draft");
    body["id"].as_str().unwrap().to_string()
}

async fn advance(
    srv: &TestServer,
    client: &reqwest::Client,
    token: &str,
    id: &str,
    steps: &[&str],
) {
    for step in steps {
        let (status, body) = send_json(
            client.post(srv.url(&format!("/vouchers/{id}/{step}"))),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{step}: {body}");
    }
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_context_is_derived_from_token() {
    let srv = TestServer::spawn().await;

    let tenant_id = TenantId::new();
    let token = mint_jwt(tenant_id, vec![Role::admin()]);

    let client = reqwest::Client::new();
    let (status, body) = send_json(client.get(srv.url("/whoami")), &token, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"].as_str().unwrap(), tenant_id.to_string());
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "admin"));
}

#[tokio::test]
async fn voucher_lifecycle_posts_and_reports() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(TenantId::new(), vec![Role::admin()]);
    let client = reqwest::Client::new();

    let (cash, sales) = seed_accounts(&srv, &client, &token).await;
    let id = create_sale(&srv, &client, &token, &cash, &sales, 1_000, 1_000).await;
    advance(&srv, &client, &token, &id, &["submit", "approve"]).await;

    let (status, body) = send_json(
        client.post(srv.url(&format!("/vouchers/{id}/post"))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "post: {body}");
    assert_eq!(body["voucher"]["status"], "posted");
    assert_eq!(body["balances"].as_array().unwrap().len(), 2);

    let (status, body) = send_json(
        client.get(srv.url(&format!("/accounts/{cash}/balance?period=2024-03"))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 1_000);

    let (status, body) = send_json(
        client.get(srv.url("/reports/trial-balance?period=2024-03")),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_balanced"], true);
    assert_eq!(body["total_debit"], 1_000);

    let (status, body) = send_json(
        client.get(srv.url(&format!(
            "/accounts/{cash}/ledger?from=2024-03-01&to=2024-03-31"
        ))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lines"][0]["running_balance"], 1_000);

    let (status, body) = send_json(
        client.get(srv.url(&format!("/vouchers/{id}/history"))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 4);

    // Posting twice is a state conflict.
    let (status, body) = send_json(
        client.post(srv.url(&format!("/vouchers/{id}/post"))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state");
}

#[tokio::test]
async fn unbalanced_voucher_is_a_validation_error() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(TenantId::new(), vec![Role::admin()]);
    let client = reqwest::Client::new();

    let (cash, sales) = seed_accounts(&srv, &client, &token).await;
    let id = create_sale(&srv, &client, &token, &cash, &sales, 1_000, 900).await;

    let (status, body) = send_json(
        client.post(srv.url(&format!("/vouchers/{id}/submit"))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("1000"));
}

#[tokio::test]
async fn closed_period_refuses_posting() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(TenantId::new(), vec![Role::admin()]);
    let client = reqwest::Client::new();

    let (cash, sales) = seed_accounts(&srv, &client, &token).await;
    let id = create_sale(&srv, &client, &token, &cash, &sales, 500, 500).await;
    advance(&srv, &client, &token, &id, &["submit", "approve"]).await;

    let (status, body) = send_json(client.post(srv.url("/periods/2024-03/close")), &token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["open"], false);

    let (status, body) = send_json(
        client.post(srv.url(&format!("/vouchers/{id}/post"))),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "policy_violation");

    let (_, body) = send_json(client.get(srv.url(&format!("/vouchers/{id}"))), &token, None).await;
    assert_eq!(body["status"], "approved");
}

#[tokio::test]
async fn missing_role_is_forbidden() {
    let srv = TestServer::spawn().await;
    let tenant_id = TenantId::new();
    let viewer = mint_jwt(tenant_id, vec![Role::new("viewer")]);

    let client = reqwest::Client::new();
    let (status, body) = send_json(
        client.post(srv.url("/accounts")),
        &viewer,
        Some(json!({ "code": "101", "name": "Cash", "account_type": "asset" })),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn tenant_isolation_blocks_cross_tenant_reads_and_writes() {
    let srv = TestServer::spawn().await;
    let token1 = mint_jwt(TenantId::new(), vec![Role::admin()]);
    let token2 = mint_jwt(TenantId::new(), vec![Role::admin()]);
    let client = reqwest::Client::new();

    let (cash, sales) = seed_accounts(&srv, &client, &token1).await;
    let id = create_sale(&srv, &client, &token1, &cash, &sales, 100, 100).await;

    let (status, _) = send_json(client.get(srv.url(&format!("/vouchers/{id}"))), &token2, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        client.post(srv.url(&format!("/vouchers/{id}/submit"))),
        &token2,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(
        client.get(srv.url(&format!("/accounts/{cash}/balance?period=2024-03"))),
        &token2,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "tenant_isolation");

    let (status, body) = send_json(client.get(srv.url("/vouchers")), &token2, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_ids_and_periods_are_bad_requests() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(TenantId::new(), vec![Role::admin()]);
    let client = reqwest::Client::new();

    let (status, _) = send_json(client.get(srv.url("/vouchers/not-a-uuid")), &token, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        client.get(srv.url("/reports/balance-sheet?period=2024-13")),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
