//! End-to-end demo: starts the mock upstream and the gateway, then exercises
//! the duplicate-rejection and cache-replay paths under concurrency.

use std::process::{Child, Command};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::task;

// Helper to kill children on exit
struct ProcessGuard(Child);
impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

#[tokio::main]
async fn main() {
    println!("Starting simulation...");

    // Assumes binaries are already built by a previous `cargo build`.
    let _upstream = ProcessGuard(
        Command::new("./target/debug/mock_provider")
            .args(["3001", "200", "0.0"])
            .spawn()
            .expect("failed to start mock provider"),
    );

    println!("Mock provider started on 3001. Waiting 2s...");
    thread::sleep(Duration::from_secs(2));

    let _gateway = ProcessGuard(
        Command::new("./target/debug/chat-edge")
            .spawn()
            .expect("failed to start gateway"),
    );

    println!("Gateway started on 8080. Waiting 2s...");
    thread::sleep(Duration::from_secs(2));

    let client = reqwest::Client::new();

    // Phase 1: one logical attempt submitted 10 times concurrently.
    println!("--- Phase 1: duplicate submissions (shared request id) ---");
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        tasks.push(task::spawn(async move {
            let body = serde_json::json!({
                "text": "temple near amphawa",
                "user_id": "u1",
                "request_id": "dup-1"
            });
            match client
                .post("http://localhost:8080/api/chat/stream")
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().as_u16() == 409 => {
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
                Ok(resp) if resp.status().is_success() => {
                    // Drain the SSE body to completion.
                    let _ = resp.text().await;
                    accepted.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }));
    }
    for t in tasks {
        let _ = t.await;
    }
    println!(
        "Accepted: {} (expected 1), rejected as duplicate: {}",
        accepted.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed)
    );

    // Phase 2: identical queries inside the TTL window hit the cache.
    println!("--- Phase 2: cache replay ---");
    for attempt in 0..3 {
        let start = Instant::now();
        let body = serde_json::json!({"message": "floating market", "user_id": "u2"});
        match client
            .post("http://localhost:8080/api/query")
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                let json: serde_json::Value = resp.json().await.unwrap_or_default();
                println!(
                    "attempt {} -> {} in {:?} (source: {})",
                    attempt,
                    status,
                    start.elapsed(),
                    json.get("source").and_then(|s| s.as_str()).unwrap_or("?")
                );
            }
            Err(e) => println!("attempt {attempt} failed: {e}"),
        }
    }

    println!("Simulation finished.");
}
