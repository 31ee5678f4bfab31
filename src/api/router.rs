//! API router.
//!
//! Returns a composable `Router` with every route under `/api/`.
//!
//! Middleware stack (outermost → innermost):
//! 1. Trace → 2. CORS → 3. Identity → 4. Audit logger

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Build the API router.
///
/// Middleware uses `Extension<ApiContext>` (injected as the outermost layer).
/// Endpoint handlers use `State<ApiContext>` (provided via `with_state`).
pub fn api_router(core: Arc<CoreState>) -> Router {
    let ctx = ApiContext::new(core);

    // Layers are applied from bottom (innermost) to top (outermost):
    //   Extension → Identity → Audit → Handler
    //
    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let protected = Router::new()
        .route(
            "/patients",
            post(endpoints::patients::create).get(endpoints::patients::search),
        )
        .route("/patients/:id", get(endpoints::patients::detail))
        .route(
            "/patients/:id/contact",
            put(endpoints::patients::update_contact),
        )
        .route("/patients/:id/status", put(endpoints::patients::set_status))
        .route(
            "/test-definitions",
            get(endpoints::catalog::list).post(endpoints::catalog::create),
        )
        .route(
            "/test-definitions/code/:code",
            get(endpoints::catalog::current).put(endpoints::catalog::revise),
        )
        .route(
            "/test-definitions/code/:code/history",
            get(endpoints::catalog::history),
        )
        .route("/test-definitions/:id", get(endpoints::catalog::detail))
        .route(
            "/orders",
            post(endpoints::orders::create).get(endpoints::orders::list),
        )
        .route(
            "/orders/approve-batch",
            post(endpoints::orders::approve_batch),
        )
        .route("/orders/:id", get(endpoints::orders::detail))
        .route("/orders/:id/history", get(endpoints::orders::history))
        .route("/orders/:id/result", get(endpoints::orders::result))
        .route("/orders/:id/collect", post(endpoints::orders::collect))
        .route(
            "/orders/:id/process",
            post(endpoints::orders::begin_processing),
        )
        .route("/orders/:id/draft", post(endpoints::orders::save_draft))
        .route("/orders/:id/submit", post(endpoints::orders::submit))
        .route("/orders/:id/approve", post(endpoints::orders::approve))
        .route("/orders/:id/cancel", post(endpoints::orders::cancel))
        .route(
            "/orders/:id/critical-notified",
            post(endpoints::orders::critical_notified),
        )
        .route("/validate", post(endpoints::validate::preview))
        .route(
            "/worklists/pending-review",
            get(endpoints::worklists::pending_review),
        )
        .route("/worklists/critical", get(endpoints::worklists::critical))
        .route("/stats", get(endpoints::worklists::stats))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::middleware::from_fn(
            middleware::identity::require_identity,
        ))
        // Extension must be outermost so middleware can extract ApiContext
        .layer(axum::Extension(ctx.clone()));

    // Liveness needs no identity.
    let public = Router::new()
        .route("/health", get(endpoints::health::check))
        .with_state(ctx);

    Router::new()
        .nest("/api", public.merge(protected))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    fn test_app() -> (Router, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let core = CoreState::open(ServerConfig {
            data_dir: tmp.path().to_path_buf(),
            ..ServerConfig::default()
        })
        .unwrap();
        (api_router(Arc::new(core)), tmp)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        caller: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((user, role)) = caller {
            builder = builder.header("X-User-Id", user).header("X-User-Role", role);
        }
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    const RECEPTION: Option<(&str, &str)> = Some(("front-1", "receptionist"));
    const DOCTOR: Option<(&str, &str)> = Some(("dr-house", "doctor"));
    const NURSE: Option<(&str, &str)> = Some(("nurse-1", "nurse"));
    const TECH: Option<(&str, &str)> = Some(("tech-1", "lab_technician"));
    const ADMIN: Option<(&str, &str)> = Some(("admin-1", "admin"));

    async fn register(app: &Router) -> String {
        let (status, patient) = call(
            app,
            "POST",
            "/api/patients",
            RECEPTION,
            Some(json!({
                "first_name": "Asha",
                "last_name": "Verma",
                "date_of_birth": "1985-06-15",
                "gender": "female",
                "phone": "+1 555-0101"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(patient["patient_number"], "P000001");
        patient["id"].as_str().unwrap().to_string()
    }

    async fn definition_id(app: &Router, code: &str) -> String {
        let (status, def) = call(
            app,
            "GET",
            &format!("/api/test-definitions/code/{code}"),
            TECH,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        def["id"].as_str().unwrap().to_string()
    }

    /// Order a CBC and take it to `pending_review` with the given hemoglobin.
    async fn pending_cbc(app: &Router, patient_id: &str, cbc: &str, hemoglobin: f64) -> String {
        let (status, order) = call(
            app,
            "POST",
            "/api/orders",
            DOCTOR,
            Some(json!({
                "patient_id": patient_id,
                "test_definition_id": cbc,
                "ordering_clinician": "dr-house"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = order["id"].as_str().unwrap().to_string();

        let steps = [
            ("collect", NURSE, json!({})),
            (
                "draft",
                TECH,
                json!({
                    "values": {
                        "WBC": 7.0, "RBC": 4.8, "Hemoglobin": hemoglobin,
                        "Hematocrit": 40, "Platelets": 250
                    }
                }),
            ),
            ("submit", TECH, json!({})),
        ];
        for (action, caller, body) in steps {
            let (status, _) = call(
                app,
                "POST",
                &format!("/api/orders/{id}/{action}"),
                caller,
                Some(body),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "{action}");
        }
        id
    }

    #[tokio::test]
    async fn health_needs_no_identity() {
        let (app, _tmp) = test_app();
        let (status, body) = call(&app, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], true);
    }

    #[tokio::test]
    async fn missing_identity_is_401() {
        let (app, _tmp) = test_app();
        let (status, body) = call(&app, "GET", "/api/patients", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_REQUIRED");

        let (status, _) = call(
            &app,
            "GET",
            "/api/patients",
            Some(("someone", "janitor")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn only_admins_manage_the_catalog() {
        let (app, _tmp) = test_app();
        let body = json!({
            "code": "glu",
            "name": "Fasting Glucose",
            "category": "chemistry",
            "sample_type": "serum",
            "parameters": [{
                "name": "Glucose",
                "unit": "mg/dL",
                "kind": "numeric",
                "reference_range": "70-100",
                "critical_values": "<40 or >400"
            }]
        });
        let (status, _) =
            call(&app, "POST", "/api/test-definitions", NURSE, Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) =
            call(&app, "POST", "/api/test-definitions", ADMIN, Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["code"], "GLU");
        assert_eq!(created["version"], 1);

        let mut revision = body;
        revision["expected_version"] = json!(1);
        revision["parameters"][0]["reference_range"] = json!("70-99");
        let (status, revised) = call(
            &app,
            "PUT",
            "/api/test-definitions/code/GLU",
            ADMIN,
            Some(revision),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(revised["version"], 2);

        let (status, history) = call(
            &app,
            "GET",
            "/api/test-definitions/code/GLU/history",
            TECH,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 2);

        let old_id = created["id"].as_str().unwrap();
        let (status, old) = call(
            &app,
            "GET",
            &format!("/api/test-definitions/{old_id}"),
            TECH,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(old["is_current"], false);
    }

    #[tokio::test]
    async fn malformed_range_is_validation_failure() {
        let (app, _tmp) = test_app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/test-definitions",
            ADMIN,
            Some(json!({
                "code": "BAD",
                "name": "Broken",
                "category": "chemistry",
                "sample_type": "serum",
                "parameters": [{
                    "name": "Thing",
                    "kind": "numeric",
                    "reference_range": "sometimes"
                }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(body["error"]["field"], "Thing");
    }

    #[tokio::test]
    async fn cbc_lifecycle_end_to_end() {
        let (app, _tmp) = test_app();
        let patient_id = register(&app).await;
        let cbc = definition_id(&app, "CBC").await;

        let (status, order) = call(
            &app,
            "POST",
            "/api/orders",
            DOCTOR,
            Some(json!({
                "patient_id": patient_id,
                "test_definition_id": cbc,
                "priority": "urgent",
                "ordering_clinician": "dr-house"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["order_number"], "ORD000001");
        let id = order["id"].as_str().unwrap().to_string();

        let (status, collected) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/collect"),
            NURSE,
            Some(json!({ "expected_version": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(collected["sample_id"], "BLO000001");

        let (status, draft) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/draft"),
            TECH,
            Some(json!({
                "values": {
                    "WBC": 7.2, "RBC": "4.6", "Hemoglobin": 10.5,
                    "Hematocrit": 38, "Platelets": 260
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(draft["order"]["status"], "draft_result");
        assert_eq!(draft["result"]["overall_status"], "abnormal");
        let hgb = draft["result"]["entries"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["parameter"] == "Hemoglobin")
            .unwrap()
            .clone();
        assert_eq!(hgb["flag"], "low");

        let (status, submitted) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/submit"),
            TECH,
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(submitted["order"]["status"], "pending_review");

        let (status, pending) =
            call(&app, "GET", "/api/worklists/pending-review", DOCTOR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/approve"),
            Some(("tech-1", "lab_technician")),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "approved_by");

        let (status, approved) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/approve"),
            DOCTOR,
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["order"]["status"], "approved");
        assert_eq!(approved["result"]["approved_by"], "dr-house");
        assert!(approved["order"]["turnaround_minutes"].is_i64());

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/approve"),
            Some(("dr-other", "doctor")),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/cancel"),
            DOCTOR,
            Some(json!({ "reason": "duplicate" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");
        assert_eq!(body["error"]["from"], "approved");

        let (status, history) =
            call(&app, "GET", &format!("/api/orders/{id}/history"), NURSE, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 6);

        let (status, stats) = call(&app, "GET", "/api/stats", ADMIN, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["orders_by_status"]["approved"], 1);
    }

    #[tokio::test]
    async fn ordering_unknown_definition_is_404_and_creates_nothing() {
        let (app, _tmp) = test_app();
        let patient_id = register(&app).await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/orders",
            DOCTOR,
            Some(json!({
                "patient_id": patient_id,
                "test_definition_id": uuid::Uuid::new_v4(),
                "ordering_clinician": "dr-house"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, orders) = call(&app, "GET", "/api/orders", DOCTOR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(orders.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_expected_version_is_409() {
        let (app, _tmp) = test_app();
        let patient_id = register(&app).await;
        let cbc = definition_id(&app, "CBC").await;
        let (_, order) = call(
            &app,
            "POST",
            "/api/orders",
            DOCTOR,
            Some(json!({
                "patient_id": patient_id,
                "test_definition_id": cbc,
                "ordering_clinician": "dr-house"
            })),
        )
        .await;
        let id = order["id"].as_str().unwrap();
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/orders/{id}/collect"),
            NURSE,
            Some(json!({ "expected_version": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn malformed_requests_are_400() {
        let (app, _tmp) = test_app();
        let (status, body) = call(&app, "GET", "/api/orders/not-a-uuid", DOCTOR, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        let (status, _) = call(
            &app,
            "POST",
            "/api/orders",
            DOCTOR,
            Some(json!({ "patient_id": 12 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/orders?status=lost", DOCTOR, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patient_registration_names_missing_field() {
        let (app, _tmp) = test_app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/patients",
            RECEPTION,
            Some(json!({ "first_name": "Asha" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "last_name");
    }

    #[tokio::test]
    async fn patient_search_pages() {
        let (app, _tmp) = test_app();
        let id = register(&app).await;
        let (status, page) =
            call(&app, "GET", "/api/patients?q=verma&limit=10", NURSE, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["items"].as_array().unwrap().len(), 1);
        assert!(page["next_cursor"].is_null());

        let (status, updated) = call(
            &app,
            "PUT",
            &format!("/api/patients/{id}/status"),
            RECEPTION,
            Some(json!({ "status": "inactive" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "inactive");

        let (_, page) = call(&app, "GET", "/api/patients?status=active", NURSE, None).await;
        assert!(page["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn validate_preview_flags_critical_categorical_value() {
        let (app, _tmp) = test_app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/validate",
            TECH,
            Some(json!({
                "test_code": "UA",
                "values": { "Blood": "3+", "Protein": "negative" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overall_status"], "critical");
        assert_eq!(body["missing_mandatory"], "Specific Gravity");

        let (status, body) = call(
            &app,
            "POST",
            "/api/validate",
            TECH,
            Some(json!({ "test_code": "UA", "values": { "Ketones": "trace" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "Ketones");
    }

    #[tokio::test]
    async fn critical_notification_clears_the_worklist() {
        let (app, _tmp) = test_app();
        let patient_id = register(&app).await;
        let cbc = definition_id(&app, "CBC").await;
        let critical = pending_cbc(&app, &patient_id, &cbc, 5.0).await;
        let normal = pending_cbc(&app, &patient_id, &cbc, 14.0).await;

        let (status, worklist) = call(&app, "GET", "/api/worklists/critical", DOCTOR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(worklist.as_array().unwrap().len(), 1);

        let uri = format!("/api/orders/{critical}/critical-notified");
        let body = json!({ "recipient": "dr-house", "note": "read back" });
        let (status, _) = call(&app, "POST", &uri, NURSE, Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, notified) = call(&app, "POST", &uri, TECH, Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(notified["notified_by"], "tech-1");
        assert_eq!(notified["recipient"], "dr-house");
        assert_eq!(notified["order_id"], critical.as_str());

        let (_, worklist) = call(&app, "GET", "/api/worklists/critical", DOCTOR, None).await;
        assert!(worklist.as_array().unwrap().is_empty());

        let (status, again) = call(&app, "POST", &uri, TECH, Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(again["error"]["code"], "CONFLICT");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/orders/{normal}/critical-notified"),
            TECH,
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn batch_approval_reports_each_order() {
        let (app, _tmp) = test_app();
        let patient_id = register(&app).await;
        let cbc = definition_id(&app, "CBC").await;
        let first = pending_cbc(&app, &patient_id, &cbc, 14.0).await;
        let second = pending_cbc(&app, &patient_id, &cbc, 13.5).await;
        let unknown = uuid::Uuid::new_v4().to_string();
        let body = json!({ "order_ids": [first, unknown, second] });

        let (status, _) =
            call(&app, "POST", "/api/orders/approve-batch", NURSE, Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, outcomes) =
            call(&app, "POST", "/api/orders/approve-batch", DOCTOR, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        let outcomes = outcomes.as_array().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0]["order_id"], first.as_str());
        assert_eq!(outcomes[0]["approved"], true);
        assert_eq!(outcomes[0]["result"]["order"]["status"], "approved");
        assert_eq!(outcomes[1]["approved"], false);
        assert_eq!(outcomes[1]["error"]["code"], "NOT_FOUND");
        assert_eq!(outcomes[2]["approved"], true);

        let (_, again) = call(
            &app,
            "POST",
            "/api/orders/approve-batch",
            DOCTOR,
            Some(json!({ "order_ids": [first] })),
        )
        .await;
        assert_eq!(again[0]["error"]["code"], "CONFLICT");

        let (status, body) = call(
            &app,
            "POST",
            "/api/orders/approve-batch",
            DOCTOR,
            Some(json!({ "order_ids": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "order_ids");
    }
}
