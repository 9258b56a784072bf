use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, Timelike};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const PASSWORD: &str = "fieldbook";

async fn connect(host: &str, port: u16, venue: &str, login: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(venue)
        .user(login)
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// `minutes` after the next whole hour, as a slot literal. Stays inside the
/// booking horizon for up to six days of minutes.
fn slot(minutes: i64) -> String {
    let now = Local::now().naive_local();
    let base: NaiveDateTime = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
        + chrono::Duration::hours(1);
    (base + chrono::Duration::minutes(minutes))
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn book(resource: &str, at: &str) -> String {
    format!("INSERT INTO reservations (resource, slot_time) VALUES ('{resource}', '{at}')")
}

/// Register `n` players in `venue`; returns their logins.
async fn register_players(host: &str, port: u16, venue: &str, n: usize) -> Vec<String> {
    let admin = connect(host, port, venue, "admin").await;
    let mut logins = Vec::with_capacity(n);
    for i in 0..n {
        let email = format!("player{i}@bench.local");
        admin
            .batch_execute(&format!(
                "INSERT INTO users (email, name) VALUES ('{email}', 'Player {i}')"
            ))
            .await
            .expect("register failed");
        logins.push(email);
    }
    logins
}

async fn phase1_sequential(host: &str, port: u16) {
    let venue = format!("bench_{}", Ulid::new());
    let logins = register_players(host, port, &venue, 1).await;
    let client = connect(host, port, &venue, &logins[0]).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&book("5", &slot(i as i64)))
            .await
            .expect("booking failed");
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} bookings in {:.2}s ({:.0} ops/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("create", &mut latencies);
}

/// Every player goes for the same slot at once; exactly one may win.
async fn phase2_slot_race(host: &str, port: u16) {
    let venue = format!("bench_{}", Ulid::new());
    let players = 64;
    let rounds = 20;
    let logins = register_players(host, port, &venue, players).await;

    let mut clients = Vec::with_capacity(players);
    for login in &logins {
        clients.push(Arc::new(connect(host, port, &venue, login).await));
    }

    let mut violations = 0;
    let start = Instant::now();
    for round in 0..rounds {
        let at = slot(round * 15);
        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(players);
        for client in &clients {
            let client = client.clone();
            let wins = wins.clone();
            let sql = book("7", &at);
            handles.push(tokio::spawn(async move {
                match client.batch_execute(&sql).await {
                    Ok(()) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {}
                    Err(e) => eprintln!("unexpected error: {e}"),
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        let wins = wins.load(Ordering::Relaxed);
        if wins != 1 {
            violations += 1;
            eprintln!("  round {round}: {wins} winners for {at}");
        }
    }
    println!(
        "  {rounds} rounds x {players} players in {:.2}s, {violations} rounds without exactly one winner",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(violations, 0, "double booking detected");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let venue = format!("bench_{}", Ulid::new());
    let logins = register_players(host, port, &venue, 2).await;
    let writer = connect(host, port, &venue, &logins[0]).await;
    let reader = connect(host, port, &venue, &logins[1]).await;

    let writes = tokio::spawn(async move {
        for i in 0..1000 {
            let _ = writer.batch_execute(&book("8", &slot(i))).await;
        }
    });

    let first = slot(0);
    let day = &first[..10];
    let query = format!("SELECT * FROM availability WHERE resource = '8' AND day = '{day}'");
    let mut latencies = Vec::with_capacity(500);
    for _ in 0..500 {
        let t = Instant::now();
        reader.simple_query(&query).await.expect("availability failed");
        latencies.push(t.elapsed());
    }
    let _ = writes.await;
    print_latency("availability", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let venue = format!("bench_{}", Ulid::new());
    let n_conns = 50;
    let ops_per_conn = 10;
    let logins = register_players(host, port, &venue, n_conns).await;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for (c, login) in logins.into_iter().enumerate() {
        let host = host.to_string();
        let venue = venue.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &venue, &login).await;
            for i in 0..ops_per_conn {
                let at = slot((c * ops_per_conn + i) as i64);
                if client.batch_execute(&book("5", &at)).await.is_err() {
                    return;
                }
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("FIELDBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("FIELDBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid FIELDBOOK_PORT");

    println!("=== fieldbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase books into its own venue (unique dbname)

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] same-slot race");
    phase2_slot_race(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
