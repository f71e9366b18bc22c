//! Shared test harness: a gateway over the in-memory store.

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use validana_core::{AppConfig, Transaction};
use validana_server::dispatch::Dispatcher;
use validana_server::handlers;
use validana_server::handlers::basics::API_VERSION;
use validana_server::state::AppState;
use validana_server::testing::MemoryStore;

/// A gateway wired to an in-memory store, plus direct store access.
pub struct TestGateway {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
}

pub fn gateway() -> TestGateway {
    gateway_with(AppConfig::for_testing())
}

pub fn gateway_with(config: AppConfig) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(config, store.clone());
    let mut dispatcher = Dispatcher::new(&state.hubs);
    handlers::register(&mut dispatcher, API_VERSION, state.clone());
    state.set_dispatcher(Arc::new(dispatcher));
    TestGateway { state, store }
}

impl TestGateway {
    /// The HTTP router as a shared-port listener would build it.
    pub fn router(&self) -> Router {
        validana_server::http::router(self.state.clone(), true, true)
    }

    /// Drive one request through the router.
    pub async fn request(&self, mut req: Request<Body>) -> Response<Body> {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        self.router().oneshot(req).await.expect("infallible router")
    }

    pub async fn get(&self, path_and_query: &str) -> Response<Body> {
        self.request(
            Request::get(path_and_query)
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
    }

    pub async fn post(&self, path: &str, body: &str) -> Response<Body> {
        self.request(
            Request::post(path)
                .body(Body::from(body.to_string()))
                .expect("request builds"),
        )
        .await
    }
}

/// Collect a response body as text.
pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collects");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// A structurally valid base64 submission with the given id byte.
pub fn base64_tx(id_byte: u8) -> String {
    let tx = Transaction {
        version: 1,
        id: [id_byte; 16],
        contract_hash: [0x33; 32],
        valid_till: 0,
        payload: r#"{"to":"wallet","amount":1}"#.to_string(),
        signature: vec![0x44; 64],
        public_key: vec![0x55; 33],
    };
    BASE64.encode(tx.to_bytes())
}

/// The hex id matching [`base64_tx`].
pub fn tx_id_hex(id_byte: u8) -> String {
    validana_core::tx::hex_encode(&[id_byte; 16])
}
