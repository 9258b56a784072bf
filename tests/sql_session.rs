use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fieldbook::clock::FixedClock;
use fieldbook::venue::VenueManager;
use fieldbook::wire;

const PASSWORD: &str = "fieldbook";

// ── Test infrastructure ──────────────────────────────────────

/// A server whose clock reads 2025-01-03 18:00 until a test moves it, a week
/// to the minute before the 2025-01-10 18:00 slot most tests book.
async fn start_test_server() -> (SocketAddr, Arc<FixedClock>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fieldbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(FixedClock::at("2025-01-03 18:00").unwrap());
    let venues = Arc::new(VenueManager::new(dir, 1000, clock.clone()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let venues = venues.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, venues, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, clock)
}

async fn connect_as(addr: SocketAddr, login: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("club")
        .user(login)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sql_error(client: &Client, sql: &str) -> SqlState {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().cloned().unwrap_or_else(|| panic!("no SQLSTATE on {err}"))
}

/// Register through an anonymous session and return the new user's id.
async fn register(addr: SocketAddr, email: &str, name: &str) -> String {
    let admin = connect_as(addr, "admin").await;
    let created = rows(
        &admin,
        &format!("INSERT INTO users (email, name) VALUES ('{email}', '{name}')"),
    )
    .await;
    assert_eq!(created.len(), 1);
    created[0].get("id").unwrap().to_string()
}

fn book(resource: &str, at: &str) -> String {
    format!("INSERT INTO reservations (resource, slot_time) VALUES ('{resource}', '{at}')")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_then_conflict() {
    let (addr, _clock) = start_test_server().await;
    register(addr, "u1@example.com", "Ana").await;
    register(addr, "u2@example.com", "Bea").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    let u2 = connect_as(addr, "u2@example.com").await;

    let created = rows(&u1, &book("5", "2025-01-10 18:00")).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("resource"), Some("5"));
    assert_eq!(created[0].get("slot_time"), Some("2025-01-10 18:00"));
    assert_eq!(created[0].get("display_name"), Some("Ana"));

    assert_eq!(
        sql_error(&u2, &book("5", "2025-01-10 18:00")).await,
        SqlState::UNIQUE_VIOLATION
    );
}

#[tokio::test]
async fn validation_errors_carry_distinct_states() {
    let (addr, _clock) = start_test_server().await;
    register(addr, "u1@example.com", "Ana").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    let anon = connect_as(addr, "stranger@example.com").await;

    assert_eq!(
        sql_error(&anon, &book("5", "2025-01-10 18:00")).await,
        SqlState::INVALID_AUTHORIZATION_SPECIFICATION
    );
    assert_eq!(
        sql_error(&u1, &book("9", "2025-01-10 18:00")).await,
        SqlState::INVALID_PARAMETER_VALUE
    );
    assert_eq!(
        sql_error(&u1, &book("5", "")).await,
        SqlState::NOT_NULL_VIOLATION
    );
    assert_eq!(
        sql_error(&u1, &book("5", "2025-01-10T18:00")).await,
        SqlState::INVALID_DATETIME_FORMAT
    );
    assert_eq!(
        sql_error(&u1, &book("5", "2025-01-01 08:00")).await,
        SqlState::DATETIME_FIELD_OVERFLOW
    );
    assert_eq!(
        sql_error(&u1, "SELECT * FROM bookings").await,
        SqlState::SYNTAX_ERROR
    );
}

#[tokio::test]
async fn availability_marks_own_slots() {
    let (addr, _clock) = start_test_server().await;
    register(addr, "u1@example.com", "Ana").await;
    register(addr, "u2@example.com", "Bea").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    let u2 = connect_as(addr, "u2@example.com").await;
    rows(&u1, &book("5", "2025-01-10 18:00")).await;
    rows(&u2, &book("5", "2025-01-10 16:00")).await;

    let query = "SELECT * FROM availability WHERE resource = '5' AND day = '2025-01-10'";
    let seen: Vec<(String, bool)> = rows(&u1, query)
        .await
        .iter()
        .map(|r| {
            let mine = matches!(r.get("mine"), Some("t") | Some("true"));
            (r.get("slot_time").unwrap().to_string(), mine)
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ("2025-01-10 16:00".to_string(), false),
            ("2025-01-10 18:00".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn cancel_frees_slot_and_is_not_idempotent() {
    let (addr, _clock) = start_test_server().await;
    register(addr, "u1@example.com", "Ana").await;
    register(addr, "u2@example.com", "Bea").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    let u2 = connect_as(addr, "u2@example.com").await;

    let created = rows(&u1, &book("7", "2025-01-08 19:00")).await;
    let id = created[0].get("id").unwrap().to_string();

    // Someone else's id looks missing
    assert_eq!(
        sql_error(&u2, &format!("DELETE FROM reservations WHERE id = {id}")).await,
        SqlState::NO_DATA_FOUND
    );

    u1.simple_query(&format!("DELETE FROM reservations WHERE id = {id}"))
        .await
        .unwrap();
    assert_eq!(
        sql_error(&u1, &format!("DELETE FROM reservations WHERE id = {id}")).await,
        SqlState::NO_DATA_FOUND
    );

    let rebooked = rows(&u2, &book("7", "2025-01-08 19:00")).await;
    assert_eq!(rebooked[0].get("display_name"), Some("Bea"));
}

#[tokio::test]
async fn history_outlives_upcoming_view() {
    let (addr, clock) = start_test_server().await;
    let id = register(addr, "u1@example.com", "Ana").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    rows(&u1, &book("8", "2025-01-04 10:00")).await;
    rows(&u1, &book("5", "2025-01-06 10:00")).await;

    clock.set(
        chrono::NaiveDateTime::parse_from_str("2025-01-05 00:00", "%Y-%m-%d %H:%M").unwrap(),
    );

    let mine = rows(&u1, "SELECT * FROM my_reservations").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("slot_time"), Some("2025-01-06 10:00"));

    // History needs no login
    let anon = connect_as(addr, "admin").await;
    let history = rows(&anon, &format!("SELECT * FROM reservations WHERE user_id = '{id}'")).await;
    let slots: Vec<&str> = history.iter().filter_map(|r| r.get("slot_time")).collect();
    assert_eq!(slots, vec!["2025-01-04 10:00", "2025-01-06 10:00"]);
}

#[tokio::test]
async fn deleting_user_cascades() {
    let (addr, _clock) = start_test_server().await;
    let id = register(addr, "u1@example.com", "Ana").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    rows(&u1, &book("5", "2025-01-10 18:00")).await;

    u1.simple_query(&format!("DELETE FROM users WHERE id = '{id}'"))
        .await
        .unwrap();

    let admin = connect_as(addr, "admin").await;
    let history = rows(&admin, &format!("SELECT * FROM reservations WHERE user_id = '{id}'")).await;
    assert!(history.is_empty());

    // The login is free again
    register(addr, "u1@example.com", "Ana").await;
}

#[tokio::test]
async fn users_cannot_delete_each_other() {
    let (addr, _clock) = start_test_server().await;
    let id = register(addr, "u1@example.com", "Ana").await;
    register(addr, "u2@example.com", "Bea").await;
    let u1 = connect_as(addr, "u1@example.com").await;
    let u2 = connect_as(addr, "u2@example.com").await;
    let anon = connect_as(addr, "admin").await;
    rows(&u1, &book("5", "2025-01-08 18:00")).await;

    let delete = format!("DELETE FROM users WHERE id = '{id}'");
    assert_eq!(sql_error(&u2, &delete).await, SqlState::UNDEFINED_OBJECT);
    assert_eq!(
        sql_error(&anon, &delete).await,
        SqlState::INVALID_AUTHORIZATION_SPECIFICATION
    );

    let mine = rows(&u1, "SELECT * FROM my_reservations").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("slot_time"), Some("2025-01-08 18:00"));
}

#[tokio::test]
async fn unusable_venue_is_refused_at_login() {
    let (addr, _clock) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("../..")
        .user("u1@example.com")
        .password(PASSWORD);
    let err = config.connect(NoTls).await.err().unwrap();
    assert_eq!(err.code(), Some(&SqlState::INVALID_CATALOG_NAME));
}

#[tokio::test]
async fn resource_catalog() {
    let (addr, _clock) = start_test_server().await;
    let client = connect_as(addr, "admin").await;
    let codes: Vec<String> = rows(&client, "SELECT * FROM resources")
        .await
        .iter()
        .map(|r| r.get("code").unwrap().to_string())
        .collect();
    assert_eq!(codes, vec!["5", "7", "8"]);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _clock) = start_test_server().await;
    register(addr, "u1@example.com", "Ana").await;
    let u1 = connect_as(addr, "u1@example.com").await;

    let created = u1
        .query(
            "INSERT INTO reservations (resource, slot_time) VALUES ($1, $2)",
            &[&"5", &"2025-01-09 07:30"],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get::<_, &str>("slot_time"), "2025-01-09 07:30");

    let err = u1
        .query(
            "INSERT INTO reservations (resource, slot_time) VALUES ($1, $2)",
            &[&"5", &"2025-01-09 07:30"],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
}

#[tokio::test]
async fn bound_values_are_not_reinterpreted() {
    let (addr, _clock) = start_test_server().await;
    let admin = connect_as(addr, "admin").await;

    let created = admin
        .query(
            "INSERT INTO users (email, name) VALUES ($1, $2)",
            &[&"pay@example.com", &"Pay $1 O'Neil"],
        )
        .await
        .unwrap();
    assert_eq!(created[0].get::<_, &str>("email"), "pay@example.com");
    assert_eq!(created[0].get::<_, &str>("name"), "Pay $1 O'Neil");
}
