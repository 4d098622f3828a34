//! Walks a call through the admission primitives
//!
//! Run with `RUST_LOG=debug cargo run --example basic` to see transitions.

use admission_machines::{
    AimdLimiter, CircuitBreaker, RateLimiter, RequestBatcher, SingleFlight, SystemClock,
    TokenBucketRateLimiter,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let clock = Arc::new(SystemClock::new());

    println!("=== Circuit breaker ===");
    let circuit = CircuitBreaker::builder("payment_api")
        .failure_threshold(3)
        .open_duration(Duration::from_millis(200))
        .clock(clock.clone())
        .on_open(|name| println!("circuit '{name}' opened"))
        .on_half_open(|name| println!("circuit '{name}' half-open, probing"))
        .on_close(|name| println!("circuit '{name}' closed"))
        .build()
        .expect("valid circuit config");

    for i in 1..=3 {
        if let Err(e) = circuit.call(move || Err::<String, _>(format!("payment {i} failed"))) {
            println!("  {e}");
        }
    }
    match circuit.call(|| Ok::<_, String>("rejected")) {
        Ok(_) => println!("  unexpected success"),
        Err(e) => println!("  {e}"),
    }

    thread::sleep(Duration::from_millis(250));
    match circuit.call(|| Ok::<_, String>("payment accepted")) {
        Ok(result) => println!("  {result}"),
        Err(e) => println!("  {e}"),
    }
    println!("  state: {}\n", circuit.state_name());

    println!("=== Rate limiter ===");
    let limiter = TokenBucketRateLimiter::new(3.0, 1.0, clock.clone()).expect("valid limiter");
    let admitted = (0..5).filter(|_| limiter.try_acquire()).count();
    println!("  admitted {admitted} of 5 burst calls\n");

    println!("=== AIMD limiter ===");
    let aimd = AimdLimiter::new(4, 16).expect("valid limits");
    for _ in 0..3 {
        if aimd.try_acquire() {
            aimd.on_success();
        }
    }
    if aimd.try_acquire() {
        aimd.on_dropped();
    }
    println!("  limit after 3 successes and a drop: {}\n", aimd.limit());

    println!("=== Single flight ===");
    let group: Arc<SingleFlight<&str, String, String>> = Arc::new(SingleFlight::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                group.execute("config", || {
                    thread::sleep(Duration::from_millis(50));
                    Ok("v42".to_string())
                })
            })
        })
        .collect();
    for handle in handles {
        println!("  got {:?}", handle.join().expect("worker panicked"));
    }
    println!();

    println!("=== Request batcher ===");
    let batcher = RequestBatcher::new(3, Duration::from_millis(100), |ids: &[u32]| {
        ids.iter().map(|id| format!("user-{id}")).collect()
    })
    .expect("valid batcher config");
    for id in 1..=3 {
        let results = batcher.add_and_maybe_flush(id);
        if !results.is_empty() {
            println!("  flushed {results:?}");
        }
    }
}
