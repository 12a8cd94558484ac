//! Mock text-generation upstream speaking the newline-delimited JSON chunk
//! protocol, with configurable latency and error rate for local testing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::sleep;

#[derive(Clone)]
struct ServerConfig {
    delay_ms: u64,
    error_rate: f64,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port = args.get(1).and_then(|a| a.parse::<u16>().ok()).unwrap_or(3001);
    let delay_ms = args.get(2).and_then(|a| a.parse::<u64>().ok()).unwrap_or(300);
    let error_rate = args.get(3).and_then(|a| a.parse::<f64>().ok()).unwrap_or(0.0);

    let config = ServerConfig { delay_ms, error_rate };

    let app = Router::new()
        .route("/generate", post(handler))
        .with_state(config);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!(
        "Mock generator on localhost:{}. Per-chunk delay: {}ms, Error rate: {}",
        port, delay_ms, error_rate
    );

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn handler(State(config): State<ServerConfig>, Json(prompt): Json<Value>) -> Response {
    if config.error_rate > 0.0 && rand::thread_rng().gen_bool(config.error_rate) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "simulated failure"})),
        )
            .into_response();
    }

    let query = prompt
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or("your question")
        .to_string();
    let context_lines = prompt
        .get("context")
        .and_then(Value::as_array)
        .map(|a| a.len())
        .unwrap_or(0);

    let answer = format!(
        "Here is what I found about \"{}\" using {} matched places. \
         Samut Songkhram rewards slow travel along the Mae Klong.",
        query, context_lines
    );
    let words: Vec<String> = answer.split(' ').map(String::from).collect();
    let delay = Duration::from_millis(config.delay_ms);

    let chunks = futures_util::stream::iter(words)
        .then(move |word| async move {
            sleep(delay).await;
            Ok::<_, Infallible>(json!({"delta": format!("{word} ")}).to_string() + "\n")
        })
        .chain(futures_util::stream::once(async {
            Ok(json!({"done": true}).to_string() + "\n")
        }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(chunks))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
