use crate::errors::{ApiError, Result};
use crate::models::{
    AddResponse, AmountRequest, BalanceResponse, DeductResponse, EntryView, HistoryQuery,
    HistoryResponse, TransferCoinsRequest, TransferResponse,
};
use actix_web::{web, HttpResponse};
use coin_ledger::{Ledger, LedgerError, Reconciler, TransferRequest, WarriorId};
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

const INSUFFICIENT_BALANCE: &str = "insufficient balance";

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub reconciler: Arc<Reconciler>,
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "coin-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Get balance endpoint
pub async fn get_balance(
    state: web::Data<AppState>,
    warrior_id: web::Path<WarriorId>,
) -> Result<HttpResponse> {
    let warrior_id = warrior_id.into_inner();
    let balance = state.ledger.balance(warrior_id).await?;

    Ok(HttpResponse::Ok().json(BalanceResponse {
        warrior_id,
        balance,
    }))
}

/// Add coins endpoint
pub async fn add_coins(
    state: web::Data<AppState>,
    warrior_id: web::Path<WarriorId>,
    request: web::Json<AmountRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let warrior_id = warrior_id.into_inner();
    let request = request.into_inner();

    let outcome = state
        .ledger
        .add(warrior_id, request.amount, request.reason)
        .await?;

    Ok(HttpResponse::Ok().json(AddResponse {
        warrior_id,
        balance_before: outcome.balance_before,
        balance: outcome.balance_after,
    }))
}

/// Deduct coins endpoint
///
/// An unaffordable deduct is a normal answer, not an error.
pub async fn deduct_coins(
    state: web::Data<AppState>,
    warrior_id: web::Path<WarriorId>,
    request: web::Json<AmountRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let warrior_id = warrior_id.into_inner();
    let request = request.into_inner();

    let response = match state
        .ledger
        .deduct(warrior_id, request.amount, request.reason)
        .await
    {
        Ok(outcome) => DeductResponse {
            success: true,
            warrior_id,
            balance_before: outcome.balance_before,
            balance_after: outcome.balance_after,
            message: "ok".to_string(),
        },
        Err(LedgerError::InsufficientFunds { balance, .. }) => DeductResponse {
            success: false,
            warrior_id,
            balance_before: balance,
            balance_after: balance,
            message: INSUFFICIENT_BALANCE.to_string(),
        },
        Err(err) => return Err(err.into()),
    };

    Ok(HttpResponse::Ok().json(response))
}

/// Transfer coins endpoint
pub async fn transfer_coins(
    state: web::Data<AppState>,
    request: web::Json<TransferCoinsRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let request = request.into_inner();

    let mut transfer = TransferRequest::new(
        request.from_warrior_id,
        request.to_warrior_id,
        request.amount,
        request.reason,
    );
    if let Some(key) = request.idempotency_key {
        transfer = transfer.with_key(key);
    }

    let response = match state.ledger.transfer(transfer).await {
        Ok(outcome) if outcome.replayed => {
            return Err(LedgerError::DuplicateEntry(request.from_warrior_id).into());
        }
        Ok(outcome) => TransferResponse {
            success: true,
            from_warrior_id: request.from_warrior_id,
            to_warrior_id: request.to_warrior_id,
            from_before: outcome.from_before,
            from_after: outcome.from_after,
            to_before: outcome.to_before,
            to_after: outcome.to_after,
            idempotency_key: Some(outcome.idempotency_key),
            message: "ok".to_string(),
        },
        Err(LedgerError::InsufficientFunds { balance, .. }) => {
            let receiver = state.ledger.balance(request.to_warrior_id).await?;
            TransferResponse {
                success: false,
                from_warrior_id: request.from_warrior_id,
                to_warrior_id: request.to_warrior_id,
                from_before: balance,
                from_after: balance,
                to_before: receiver,
                to_after: receiver,
                idempotency_key: None,
                message: INSUFFICIENT_BALANCE.to_string(),
            }
        }
        Err(err) => return Err(err.into()),
    };

    Ok(HttpResponse::Ok().json(response))
}

/// Ledger history endpoint
pub async fn get_history(
    state: web::Data<AppState>,
    warrior_id: web::Path<WarriorId>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse> {
    let warrior_id = warrior_id.into_inner();
    let page = state
        .ledger
        .history(
            warrior_id,
            query.limit.unwrap_or(0),
            query.offset.unwrap_or(0),
        )
        .await?;

    Ok(HttpResponse::Ok().json(HistoryResponse {
        warrior_id,
        entries: page.entries.into_iter().map(EntryView::from).collect(),
        total_count: page.total_count,
        limit: page.limit,
        offset: page.offset,
    }))
}

/// Lift a reconciliation quarantine
pub async fn clear_quarantine(
    state: web::Data<AppState>,
    warrior_id: web::Path<WarriorId>,
) -> Result<HttpResponse> {
    let warrior_id = warrior_id.into_inner();
    match state.reconciler.clear_quarantine(warrior_id) {
        Some(record) => Ok(HttpResponse::Ok().json(json!({
            "warrior_id": warrior_id,
            "cleared": true,
            "reason": record.reason,
            "since": record.since
        }))),
        None => Ok(HttpResponse::Ok().json(json!({
            "warrior_id": warrior_id,
            "cleared": false
        }))),
    }
}

/// Currently quarantined accounts
pub async fn list_quarantine(state: web::Data<AppState>) -> HttpResponse {
    let records = state.ledger.context().quarantine.list();
    HttpResponse::Ok().json(json!({
        "total": records.len(),
        "accounts": records
    }))
}

/// Run one reconciliation sweep now
pub async fn run_reconciliation(state: web::Data<AppState>) -> Result<HttpResponse> {
    let report = state.reconciler.sweep().await?;
    Ok(HttpResponse::Ok().json(report))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(state: web::Data<AppState>) -> Result<HttpResponse> {
    let body = state
        .ledger
        .context()
        .metrics
        .encode_text()
        .map_err(|e| ApiError::Internal(format!("Failed to gather metrics: {}", e)))?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/coins")
            .route("/transfer", web::post().to(transfer_coins))
            .route("/{warrior_id}/balance", web::get().to(get_balance))
            .route("/{warrior_id}/add", web::post().to(add_coins))
            .route("/{warrior_id}/deduct", web::post().to(deduct_coins))
            .route("/{warrior_id}/history", web::get().to(get_history))
            .route(
                "/{warrior_id}/quarantine/clear",
                web::post().to(clear_quarantine),
            ),
    )
    .service(
        web::scope("/api/v1/reconciliation")
            .route("/run", web::post().to(run_reconciliation))
            .route("/quarantine", web::get().to(list_quarantine)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use coin_ledger::{
        catalog::StaticCatalog, config::LedgerConfig, config::ReconciliationConfig,
        metrics::Metrics, storage::MemoryStore, LedgerContext,
    };
    use serde_json::Value;

    fn state(seeds: &[(WarriorId, i64)]) -> (MemoryStore, AppState) {
        let store = MemoryStore::new();
        let ctx = LedgerContext::new(
            Arc::new(store.clone()),
            Arc::new(StaticCatalog::with_seeds(seeds.iter().copied())),
            Arc::new(Metrics::new().unwrap()),
        );
        let ledger = Ledger::new(ctx.clone(), LedgerConfig::default());
        let reconciler = Arc::new(Reconciler::new(ctx, ReconciliationConfig::default()));
        (store, AppState { ledger, reconciler })
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .configure(configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_balance_and_deduct() {
        let (_, state) = state(&[(1, 1000)]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/1/deduct")
            .set_json(json!({"amount": 300, "reason": "potion"}))
            .to_request();
        let body: DeductResponse = test::call_and_read_body_json(&app, req).await;
        assert!(body.success);
        assert_eq!((body.balance_before, body.balance_after), (1000, 700));

        let req = test::TestRequest::get()
            .uri("/api/v1/coins/1/balance")
            .to_request();
        let body: BalanceResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.balance, 700);
    }

    #[actix_web::test]
    async fn test_insufficient_deduct_is_not_an_error() {
        let (_, state) = state(&[(1, 100)]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/1/deduct")
            .set_json(json!({"amount": 500, "reason": "armor"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: DeductResponse = test::read_body_json(resp).await;
        assert!(!body.success);
        assert_eq!(body.message, "insufficient balance");
        assert_eq!(body.balance_after, 100);
    }

    #[actix_web::test]
    async fn test_error_statuses() {
        let (_, state) = state(&[(1, 100)]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/1/add")
            .set_json(json!({"amount": 0, "reason": "nothing"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "invalid_amount");

        let req = test::TestRequest::get()
            .uri("/api/v1/coins/99/balance")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/transfer")
            .set_json(json!({
                "from_warrior_id": 1, "to_warrior_id": 1, "amount": 10, "reason": "loop"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_transfer_and_replay_conflict() {
        let (_, state) = state(&[(1, 1000), (2, 500)]);
        let app = app!(state);

        let payload = json!({
            "from_warrior_id": 1, "to_warrior_id": 2, "amount": 300,
            "reason": "gift", "idempotency_key": "gift-1"
        });

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/transfer")
            .set_json(&payload)
            .to_request();
        let body: TransferResponse = test::call_and_read_body_json(&app, req).await;
        assert!(body.success);
        assert_eq!((body.from_after, body.to_after), (700, 800));

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/transfer")
            .set_json(&payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(state.ledger.balance(1).await.unwrap(), 700);
    }

    #[actix_web::test]
    async fn test_history_paging() {
        let (_, state) = state(&[(1, 0)]);
        for amount in 1..=5 {
            state.ledger.add(1, amount, "tick").await.unwrap();
        }
        let app = app!(state);

        let req = test::TestRequest::get()
            .uri("/api/v1/coins/1/history?limit=2&offset=1")
            .to_request();
        let body: HistoryResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.total_count, 5);
        assert_eq!(body.entries.len(), 2);
        assert_eq!(body.entries[0].amount, 4);
        assert!(body.entries[0].id > body.entries[1].id);
    }

    #[actix_web::test]
    async fn test_reconciliation_quarantine_flow() {
        let (store, state) = state(&[(1, 100)]);
        state.ledger.add(1, 10, "bonus").await.unwrap();
        store.force_balance(1, 500);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/reconciliation/run")
            .to_request();
        let report: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["newly_quarantined"], json!([1]));

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/1/add")
            .set_json(json!({"amount": 5}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::LOCKED);

        let req = test::TestRequest::post()
            .uri("/api/v1/coins/1/quarantine/clear")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cleared"], true);
    }

    #[actix_web::test]
    async fn test_health_and_metrics() {
        let (_, state) = state(&[(1, 100)]);
        state.ledger.add(1, 1, "x").await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("coin_ledger_operations_total"));
    }
}
