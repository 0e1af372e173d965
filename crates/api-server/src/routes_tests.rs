#[cfg(test)]
mod tests {
    use super::super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio_tungstenite::tungstenite::Message as TMessage;
    use tower::ServiceExt;

    async fn test_state(vars: &[(&str, &str)]) -> AppState {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = ServerConfig::from_lookup(move |name| vars.get(name).cloned()).unwrap();
        let db = JournalDb::new("sqlite::memory:").await.unwrap();
        AppState::new(config, db)
    }

    async fn test_app() -> Router {
        build_router(test_state(&[]).await)
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register_and_login(app: &Router, username: &str) -> String {
        let (status, _) = send(
            app,
            request(
                "POST",
                "/api/auth/register",
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": "correct-horse",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            app,
            request(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({"username": username, "password": "correct-horse"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["token_type"], "bearer");
        body["data"]["access_token"].as_str().unwrap().to_string()
    }

    fn multipart_csv(csv: &str) -> Request<Body> {
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"trades.csv\"\r\n\
             Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
            b = boundary,
            csv = csv
        );
        Request::builder()
            .method("POST")
            .uri("/api/trades/upload-csv")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let app = test_app().await;

        let (status, body) = send(&app, request("GET", "/", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());

        let response = app
            .clone()
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let app = test_app().await;
        let req = Request::builder()
            .uri("/health")
            .header("x-request-id", "trace-me")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "trace-me");
    }

    #[tokio::test]
    async fn test_auth_flow() {
        let app = test_app().await;
        let token = register_and_login(&app, "lena").await;

        let (status, body) = send(&app, request("GET", "/api/auth/me", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["username"], "lena");
        assert!(body["data"].get("hashed_password").is_none());

        let (status, _) = send(&app, request("POST", "/api/auth/logout", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, request("GET", "/api/auth/me", Some(&token), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_login_by_email_and_duplicate_registration() {
        let app = test_app().await;
        register_and_login(&app, "marco").await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({"email": "MARCO@example.com", "password": "correct-horse"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["access_token"].is_string());

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/auth/register",
                None,
                Some(json!({"username": "marco", "email": "other@example.com", "password": "correct-horse"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("already registered"));
    }

    #[tokio::test]
    async fn test_repeated_bad_logins_lock_out() {
        let app = build_router(test_state(&[("AUTH_MAX_FAILURES", "2")]).await);
        register_and_login(&app, "kim").await;

        let bad = || {
            request(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({"username": "kim", "password": "wrong-password"})),
            )
        };
        assert_eq!(send(&app, bad()).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(send(&app, bad()).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(send(&app, bad()).await.0, StatusCode::TOO_MANY_REQUESTS);

        let good = request(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"username": "kim", "password": "correct-horse"})),
        );
        assert_eq!(send(&app, good).await.0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_protected_routes_require_session() {
        let app = test_app().await;
        for uri in ["/api/trades", "/api/alerts", "/api/analytics/summary"] {
            let (status, _) = send(&app, request("GET", uri, None, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
        }
        let (status, _) = send(&app, request("GET", "/api/trades", Some("bogus-token"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_trade_crud_is_user_scoped() {
        let app = test_app().await;
        let alice = register_and_login(&app, "alice").await;
        let bob = register_and_login(&app, "bob").await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/trades",
                Some(&alice),
                Some(json!({"symbol": "aapl", "trade_type": "buy", "quantity": 10, "price": 100.0})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["symbol"], "AAPL");
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = send(&app, request("GET", &format!("/api/trades/{}", id), Some(&bob), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            request(
                "PUT",
                &format!("/api/trades/{}", id),
                Some(&alice),
                Some(json!({"symbol": "AAPL", "trade_type": "buy", "quantity": 12, "price": 100.0, "notes": "added"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["quantity"], 12.0);

        let (status, body) = send(&app, request("GET", "/api/trades?limit=10", Some(&alice), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = send(&app, request("DELETE", &format!("/api/trades/{}", id), Some(&bob), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request("DELETE", &format!("/api/trades/{}", id), Some(&alice), None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_trade_is_bad_request() {
        let app = test_app().await;
        let token = register_and_login(&app, "nora").await;
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/trades",
                Some(&token),
                Some(json!({"symbol": "AAPL", "trade_type": "buy", "quantity": 0, "price": 100.0})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("quantity"));
    }

    #[tokio::test]
    async fn test_csv_upload_and_analytics() {
        let app = test_app().await;
        let token = register_and_login(&app, "omar").await;

        let csv = "symbol,trade_type,quantity,price,timestamp\n\
                   AAPL,buy,10,100,2025-01-02\n\
                   AAPL,sell,10,110,2025-01-03\n";
        let mut req = multipart_csv(csv);
        req.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["data"]["imported"], 2);

        let (status, body) = send(&app, request("GET", "/api/analytics/summary", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_trades"], 2);
        assert_eq!(body["data"]["total_pnl"].as_f64(), Some(100.0));
        assert_eq!(body["data"]["win_rate"].as_f64(), Some(100.0));

        let (status, body) = send(&app, request("GET", "/api/analytics/risk-metrics", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["max_drawdown"].is_number());
    }

    #[tokio::test]
    async fn test_csv_upload_rejects_bad_row_atomically() {
        let app = test_app().await;
        let token = register_and_login(&app, "pia").await;

        let csv = "symbol,trade_type,quantity,price\n\
                   AAPL,buy,10,100\n\
                   MSFT,hold,5,300\n";
        let mut req = multipart_csv(csv);
        req.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Row 2"));

        let (_, body) = send(&app, request("GET", "/api/trades", Some(&token), None)).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_lifecycle() {
        let app = test_app().await;
        let token = register_and_login(&app, "quinn").await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/alerts",
                Some(&token),
                Some(json!({"symbol": "AAPL", "alert_type": "price_below", "threshold_value": 150.0})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["is_active"], true);
        let id = body["data"]["id"].as_i64().unwrap();

        let (_, body) = send(&app, request("GET", "/api/alerts/active", Some(&token), None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(
            &app,
            request("POST", &format!("/api/alerts/{}/deactivate", id), Some(&token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["is_active"], false);

        let (_, body) = send(&app, request("GET", "/api/alerts/active", Some(&token), None)).await;
        assert!(body["data"].as_array().unwrap().is_empty());

        let (_, body) = send(&app, request("GET", "/api/alerts", Some(&token), None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = send(&app, request("DELETE", &format!("/api/alerts/{}", id), Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, request("GET", &format!("/api/alerts/{}", id), Some(&token), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_alert_type_is_bad_request() {
        let app = test_app().await;
        let token = register_and_login(&app, "rosa").await;
        let (status, _) = send(
            &app,
            request(
                "POST",
                "/api/alerts",
                Some(&token),
                Some(json!({"symbol": "AAPL", "alert_type": "moon_shot", "threshold_value": 1.0})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_triggers_without_market_data() {
        let app = test_app().await;
        let token = register_and_login(&app, "sam").await;
        let (status, body) = send(&app, request("POST", "/api/alerts/check-triggers", Some(&token), None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_sentiment_degrades_to_neutral() {
        let app = test_app().await;
        let (status, body) = send(&app, request("GET", "/api/sentiment/latest?symbol=AAPL", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["sentiment"], "neutral");
        assert_eq!(body["data"]["score"], 0.0);
        assert_eq!(body["data"]["confidence"], 0.0);
        assert!(body["data"]["error"].is_string());
    }

    #[tokio::test]
    async fn test_copilot_ask() {
        let app = test_app().await;

        let (status, _) = send(&app, request("POST", "/api/copilot/ask", None, Some(json!({"question": "  "})))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            request("POST", "/api/copilot/ask", None, Some(json!({"question": "Is AAPL a buy?", "symbols": ["aapl"]}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["market_bias"], "neutral");
        assert!(body["data"]["error"].is_string());
    }

    #[tokio::test]
    async fn test_price_stream_not_configured() {
        let app = test_app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/prices?symbols=AAPL", addr))
            .await
            .unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"error": "price stream not configured"}));

        let bad = tokio_tungstenite::connect_async(format!("ws://{}/ws/prices?symbols=not%20valid!", addr)).await;
        assert!(bad.is_err());
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let TMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn trade(symbol: &str, price: f64) -> TMessage {
        TMessage::Text(
            json!({"type": "trade", "data": [{"s": symbol, "p": price, "v": 10.0, "t": 1_700_000_000_000i64}]})
                .to_string(),
        )
    }

    #[tokio::test]
    async fn test_live_price_stream_routes_triggers_to_owner() {
        // Upstream feed on a bare host:port URL; trades are released once
        // both clients hold their leases.
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let feed_url = format!("ws://{}", upstream.local_addr().unwrap());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = release_rx.await;
            for (symbol, price) in [("MSFT", 300.0), ("AAPL", 149.5), ("AAPL", 151.0)] {
                ws.send(trade(symbol, price)).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut state = test_state(&[
            ("FINNHUB_API_KEY", "feed-key"),
            ("FINNHUB_WS_URL", feed_url.as_str()),
            ("STREAM_SYMBOLS", "AAPL"),
            ("FEED_RECONNECT_SECS", "1"),
        ])
        .await;
        let cancel = CancellationToken::new();
        let live = live::start(&state, cancel.clone());
        state.live = Some(live.clone());
        let app = build_router(state);

        let owner = register_and_login(&app, "owner").await;
        let other = register_and_login(&app, "other").await;
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/alerts",
                Some(&owner),
                Some(json!({"symbol": "AAPL", "alert_type": "price_below", "threshold_value": 150.0})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let alert_id = body["data"]["id"].as_i64().unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = app.clone();
        tokio::spawn(async move {
            axum::serve(listener, server.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let (mut owner_ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/ws/prices?symbols=AAPL&token={}",
            addr, owner
        ))
        .await
        .unwrap();
        let (mut other_ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/ws/prices?symbols=AAPL,MSFT&token={}",
            addr, other
        ))
        .await
        .unwrap();

        let aapl = market_core::Symbol::parse("AAPL").unwrap();
        let msft = market_core::Symbol::parse("MSFT").unwrap();
        wait_for(|| live.hub.lease_count(&aapl) == 2 && live.hub.lease_count(&msft) == 1).await;
        release_tx.send(()).unwrap();

        let tick = next_json(&mut owner_ws).await;
        assert_eq!((tick["s"].as_str(), tick["p"].as_f64()), (Some("AAPL"), Some(149.5)));
        let fired = next_json(&mut owner_ws).await;
        assert_eq!(fired["type"], "alert_triggered");
        assert_eq!(fired["id"], alert_id);
        assert_eq!(fired["trigger_price"], 149.5);
        assert_eq!(fired["message"], "AAPL price is below 150.0. Current: 149.5");
        let tick = next_json(&mut owner_ws).await;
        assert_eq!((tick["s"].as_str(), tick["p"].as_f64()), (Some("AAPL"), Some(151.0)));

        let seen: Vec<(String, f64)> = {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let frame = next_json(&mut other_ws).await;
                assert!(frame.get("type").is_none(), "unexpected frame {}", frame);
                seen.push((frame["s"].as_str().unwrap().to_string(), frame["p"].as_f64().unwrap()));
            }
            seen
        };
        assert_eq!(
            seen,
            vec![
                ("MSFT".to_string(), 300.0),
                ("AAPL".to_string(), 149.5),
                ("AAPL".to_string(), 151.0),
            ]
        );

        let (_, body) = send(&app, request("GET", &format!("/api/alerts/{}", alert_id), Some(&owner), None)).await;
        assert_eq!(body["data"]["is_active"], false);

        let _ = owner_ws.close(None).await;
        let _ = other_ws.close(None).await;
        wait_for(|| live.hub.lease_count(&aapl) == 0 && live.hub.lease_count(&msft) == 0).await;

        cancel.cancel();
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_request_span_omits_query_string() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = test_app().await;
        let response = app
            .oneshot(request("GET", "/ws/prices?symbols=AAPL&token=secret-session-token", None, None))
            .await
            .unwrap();
        assert!(response.status().is_client_error());

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("path=/ws/prices"), "{}", output);
        assert!(!output.contains("secret-session-token"), "{}", output);
    }
}
