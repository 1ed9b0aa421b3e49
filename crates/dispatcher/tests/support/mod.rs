//! Webhook receiver for relay tests: records every request and answers with
//! a scripted sequence of statuses, then 200.

use {
    axum::{
        Router,
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::post,
    },
    std::sync::{Arc, Mutex},
};

pub struct Receiver {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub signature: String,
    pub body: Vec<u8>,
}

struct ReceiverState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responses: Mutex<Vec<StatusCode>>,
}

pub async fn receiver(responses: Vec<StatusCode>) -> Receiver {
    let requests = Arc::new(Mutex::new(vec![]));
    let state = Arc::new(ReceiverState {
        requests: requests.clone(),
        responses: Mutex::new(responses),
    });
    let app = Router::new()
        .route("/callback", post(receive))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    Receiver {
        url: format!("http://{address}/callback"),
        requests,
    }
}

impl Receiver {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn receive(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get("x-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.requests.lock().unwrap().push(RecordedRequest {
        signature,
        body: body.to_vec(),
    });
    let mut responses = state.responses.lock().unwrap();
    if responses.is_empty() {
        StatusCode::OK
    } else {
        responses.remove(0)
    }
}
