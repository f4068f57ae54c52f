//! HTTP surface tests, driven through the router with `tower::oneshot`.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;
    use world_mesh::api;
    use world_mesh::config::ServerConfig;
    use world_mesh::manager::CreateWorldOptions;
    use world_mesh::startup::{AppContext, StartupManager};

    struct Fixture {
        _dir: TempDir,
        ctx: Arc<AppContext>,
        router: Router,
    }

    fn make_fixture(configure: impl FnOnce(&mut ServerConfig)) -> Fixture {
        let dir = tempdir().unwrap();
        let mut config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        configure(&mut config);
        let startup = StartupManager::build(config).unwrap();
        let ctx = startup.context();
        let router = api::router(ctx.clone());
        Fixture {
            _dir: dir,
            ctx,
            router,
        }
    }

    fn make_world(fixture: &Fixture, name: &str, fish: u64, plants: u64) -> String {
        let instance = fixture
            .ctx
            .manager
            .create(
                "tank",
                name,
                CreateWorldOptions {
                    config: Some(json!({
                        "fish_count": fish,
                        "plant_count": plants,
                        "food_count": 0,
                    })),
                    seed: Some(3),
                    persistent: false,
                    description: String::new(),
                },
            )
            .unwrap();
        instance.world_id.clone()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Health & worlds
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_endpoint_responds() {
        let fixture = make_fixture(|_| {});
        let (status, body) = send(&fixture.router, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_list_get_delete_world() {
        let fixture = make_fixture(|_| {});

        let (status, created) = send(
            &fixture.router,
            post_json(
                "/api/worlds",
                json!({"world_type": "tank", "name": "Reef", "persistent": false}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let world_id = created["world_id"].as_str().unwrap().to_string();
        assert_eq!(created["world_type"], "tank");

        let (status, listed) = send(&fixture.router, get("/api/worlds")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["count"], 1);

        let (status, fetched) =
            send(&fixture.router, get(&format!("/api/worlds/{}", world_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "Reef");

        let (status, _) = send(
            &fixture.router,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/worlds/{}", world_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            send(&fixture.router, get(&format!("/api/worlds/{}", world_id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_world_type_is_a_bad_request() {
        let fixture = make_fixture(|_| {});
        let (status, body) = send(
            &fixture.router,
            post_json("/api/worlds", json!({"world_type": "casino", "name": "Nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("casino"));
    }

    #[tokio::test]
    async fn world_types_lists_capabilities() {
        let fixture = make_fixture(|_| {});
        let (status, body) = send(&fixture.router, get("/api/worlds/types")).await;
        assert_eq!(status, StatusCode::OK);
        let types = body["world_types"].as_array().unwrap();
        assert!(types.iter().any(|t| t["world_type"] == "tank"));
        assert!(types.iter().any(|t| t["world_type"] == "soccer"
            && t["supports_transfer"] == false));
    }

    #[tokio::test]
    async fn step_endpoint_advances_the_frame() {
        let fixture = make_fixture(|_| {});
        let world_id = make_world(&fixture, "Stepper", 1, 0);
        let (status, body) = send(
            &fixture.router,
            post_json(&format!("/api/worlds/{}/step", world_id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["frame_count"], 1);
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn connection_validation_and_upsert_status_codes() {
        let fixture = make_fixture(|_| {});
        let a = make_world(&fixture, "A", 1, 0);
        let b = make_world(&fixture, "B", 1, 0);

        // Unknown local endpoint.
        let (status, _) = send(
            &fixture.router,
            post_json(
                "/api/connections",
                json!({"source_world_id": a, "dest_world_id": "ghost", "probability": 10}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Out-of-range probability.
        let (status, _) = send(
            &fixture.router,
            post_json(
                "/api/connections",
                json!({"source_world_id": a, "dest_world_id": b, "probability": 101}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Invalid direction.
        let (status, _) = send(
            &fixture.router,
            post_json(
                "/api/connections",
                json!({"source_world_id": a, "dest_world_id": b, "direction": "sideways"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Fresh connection: 201. Same ordered pair again: 200.
        let (status, _) = send(
            &fixture.router,
            post_json(
                "/api/connections",
                json!({"source_world_id": a, "dest_world_id": b, "probability": 25}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(
            &fixture.router,
            post_json(
                "/api/connections",
                json!({"source_world_id": a, "dest_world_id": b, "probability": 60}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = send(&fixture.router, get("/api/connections")).await;
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["connections"][0]["probability"], 60);
    }

    // -----------------------------------------------------------------------
    // Remote transfer
    // -----------------------------------------------------------------------

    fn fish_payload() -> Value {
        json!({
            "type": "fish",
            "schema_version": 2,
            "id": "e9",
            "x": 50.0,
            "y": 60.0,
            "vel_x": 0.5,
            "vel_y": -0.5,
            "energy": 42.0,
            "max_energy": 100.0,
            "age": 3,
            "generation": 1,
            "species": "tetra",
        })
    }

    #[tokio::test]
    async fn remote_transfer_accepts_a_fish() {
        let fixture = make_fixture(|_| {});
        let dest = make_world(&fixture, "Dst", 0, 0);

        let (status, body) = send(
            &fixture.router,
            post_json(
                "/api/remote-transfer",
                json!({
                    "destination_world_id": dest,
                    "entity_data": fish_payload(),
                    "source_server_id": "server-b",
                    "source_world_id": "w-remote",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["entity"]["old_id"], "e9");
        assert!(body["entity"]["new_id"].is_string());

        // One transfer record, crediting the remote source.
        let (_, transfers) = send(&fixture.router, get("/api/transfers")).await;
        assert_eq!(transfers["count"], 1);
        assert_eq!(
            transfers["transfers"][0]["source_world_id"],
            "server-b:w-remote"
        );
    }

    #[tokio::test]
    async fn remote_transfer_full_world_is_conflict() {
        let fixture = make_fixture(|_| {});
        let dest = make_world(&fixture, "Packed", 0, 12);

        let plant = json!({
            "type": "plant",
            "schema_version": 2,
            "id": "p1",
            "x": 10.0,
            "y": 590.0,
            "energy": 30.0,
            "max_energy": 80.0,
            "generation": 0,
        });
        let (status, body) = send(
            &fixture.router,
            post_json(
                "/api/remote-transfer",
                json!({
                    "destination_world_id": dest,
                    "entity_data": plant,
                    "source_server_id": "server-b",
                    "source_world_id": "w-remote",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "no_root_spots");

        // Silent on the wire means no transfer record either here.
        let (_, transfers) = send(&fixture.router, get("/api/transfers")).await;
        assert_eq!(transfers["count"], 0);
    }

    #[tokio::test]
    async fn remote_transfer_unknown_world_is_not_found() {
        let fixture = make_fixture(|_| {});
        let (status, _) = send(
            &fixture.router,
            post_json(
                "/api/remote-transfer",
                json!({
                    "destination_world_id": "ghost",
                    "entity_data": fish_payload(),
                    "source_server_id": "server-b",
                    "source_world_id": "w-remote",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -----------------------------------------------------------------------
    // Discovery auth & host policy
    // -----------------------------------------------------------------------

    fn peer_info(host: &str) -> Value {
        json!({
            "server_id": "peer-1",
            "host": host,
            "port": 8000,
            "hostname": host,
            "status": "online",
            "version": "0.1.0",
            "world_count": 0,
            "is_local": false,
        })
    }

    #[tokio::test]
    async fn discovery_requires_the_shared_secret_when_configured() {
        let fixture = make_fixture(|config| {
            config.discovery_api_key = Some("sekret".to_string());
        });

        let (status, _) = send(
            &fixture.router,
            post_json("/api/discovery/register", peer_info("93.184.216.34")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/api/discovery/register")
            .header("content-type", "application/json")
            .header("X-Discovery-Key", "sekret")
            .body(Body::from(peer_info("93.184.216.34").to_string()))
            .unwrap();
        let (status, body) = send(&fixture.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "registered");
    }

    #[tokio::test]
    async fn private_hosts_are_rejected_unless_allowed() {
        let fixture = make_fixture(|_| {});
        let (status, _) = send(
            &fixture.router,
            post_json("/api/discovery/register", peer_info("192.168.1.10")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let permissive = make_fixture(|config| {
            config.allow_private_server_registration = true;
        });
        let (status, _) = send(
            &permissive.router,
            post_json("/api/discovery/register", peer_info("192.168.1.10")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unregistered_heartbeat_is_not_found() {
        let fixture = make_fixture(|_| {});
        let (status, _) = send(
            &fixture.router,
            post_json("/api/discovery/heartbeat/stranger", json!(null)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
