use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::FieldbookAuthSource;
use crate::engine::{BookingError, Engine};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::venue::{DEFAULT_VENUE, VenueManager};

pub struct FieldbookHandler {
    venues: Arc<VenueManager>,
    query_parser: Arc<FieldbookQueryParser>,
}

impl FieldbookHandler {
    pub fn new(venues: Arc<VenueManager>) -> Self {
        Self {
            venues,
            query_parser: Arc::new(FieldbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client.metadata().get("database").map_or(DEFAULT_VENUE, String::as_str);
        self.venues.get_or_create(db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("venue error: {e}"),
            )))
        })
    }

    /// The connection's login name is the caller's email. A login with no
    /// registered user is an anonymous caller.
    fn resolve_caller<C: ClientInfo>(client: &C, engine: &Engine) -> Option<UserId> {
        client
            .metadata()
            .get("user")
            .and_then(|login| engine.resolve_login(login))
    }

    async fn run(&self, engine: &Engine, caller: Option<UserId>, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = cmd.label();
        let start = Instant::now();
        let result = self.execute_command(engine, caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: Option<UserId>,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation { resource, slot_time } => {
                let reservation = engine
                    .create_reservation(caller, &resource, &slot_time)
                    .await
                    .map_err(booking_err)?;
                reservation_rows(vec![reservation])
            }
            Command::DeleteReservation { id } => {
                engine
                    .cancel_reservation(caller, ReservationId(id))
                    .await
                    .map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUser { email, name } => {
                let user = engine.register_user(&email, &name).await.map_err(booking_err)?;
                user_rows(user)
            }
            Command::DeleteUser { id } => {
                let removed = engine.delete_user(caller, id).await.map_err(booking_err)?;
                tracing::info!("user {id} deleted along with {removed} reservations");
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectMyReservations => {
                let mine = engine.list_mine(caller).await.map_err(booking_err)?;
                reservation_rows(mine)
            }
            Command::SelectAvailability { resource, day } => {
                let availability = engine
                    .list_availability(caller, &resource, &day)
                    .await
                    .map_err(booking_err)?;
                availability_rows(availability)
            }
            Command::SelectUserReservations { user_id } => {
                reservation_rows(engine.list_all_for_user(user_id).await)
            }
            Command::SelectResources => resource_rows(engine.resources()),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::INT8),
        text_field("owner_id", Type::VARCHAR),
        text_field("resource", Type::VARCHAR),
        text_field("slot_time", Type::VARCHAR),
        text_field("display_name", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
    ]
}

/// One row per occupied slot. `mine` marks the caller's own; other owners stay hidden.
fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("slot_time", Type::VARCHAR), text_field("mine", Type::BOOL)]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![text_field("code", Type::VARCHAR), text_field("label", Type::VARCHAR)]
}

fn format_timestamp(at: chrono::NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(r.id.0 as i64))?;
            encoder.encode_field(&r.owner_id.to_string())?;
            encoder.encode_field(&r.resource.code().to_string())?;
            encoder.encode_field(&r.slot_time.to_string())?;
            encoder.encode_field(&r.display_name)?;
            encoder.encode_field(&format_timestamp(r.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_rows(availability: Availability) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let Availability { occupied, mine } = availability;
    let rows: Vec<PgWireResult<_>> = occupied
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.to_string())?;
            encoder.encode_field(&mine.contains(&slot))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn user_rows(user: User) -> PgWireResult<Response> {
    let schema = Arc::new(user_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&user.id.to_string())?;
    encoder.encode_field(&user.email)?;
    encoder.encode_field(&user.display_name)?;
    encoder.encode_field(&format_timestamp(user.created_at))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn resource_rows(kinds: Vec<ResourceKind>) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = kinds
        .into_iter()
        .map(|kind| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&kind.code().to_string())?;
            encoder.encode_field(&kind.label().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns of a not-yet-bound statement, judged from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let is_insert = upper.trim_start().starts_with("INSERT");
    let is_select = upper.trim_start().starts_with("SELECT");
    if is_insert && upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if is_insert && upper.contains("USERS") {
        user_schema()
    } else if is_select && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if is_select && upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if is_select && upper.contains("RESOURCES") {
        resource_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for FieldbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let caller = Self::resolve_caller(client, &engine);
        Ok(vec![self.run(&engine, caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FieldbookQueryParser;

#[async_trait]
impl QueryParser for FieldbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FieldbookHandler {
    type Statement = String;
    type QueryParser = FieldbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let caller = Self::resolve_caller(client, &engine);
        let sql = substitute_params(portal);
        self.run(&engine, caller, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` at its `$N` placeholders. A `$` inside a quoted literal is text.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut in_literal = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // `''` flips twice and stays inside the literal
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() else {
                    i += 1 + digits;
                    continue;
                };
                pieces.push(Piece::Text(&sql[start..i]));
                pieces.push(Piece::Param(n));
                i += 1 + digits;
                start = i;
            }
            _ => i += 1,
        }
    }
    pieces.push(Piece::Text(&sql[start..]));
    pieces
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Inline bound values as quoted literals in one pass, so a value that
/// itself contains `$1` is never substituted again.
fn inline_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(value)) => out.push_str(&quote_literal(value)),
                Some(None) => out.push_str("NULL"),
                None => out.push_str(&format!("${n}")),
            },
        }
    }
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    inline_params(&portal.statement.statement, &params)
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FieldbookFactory {
    handler: Arc<FieldbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FieldbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FieldbookFactory {
    pub fn new(venues: Arc<VenueManager>, password: String) -> Self {
        let auth_source = FieldbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FieldbookHandler::new(venues)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FieldbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    venues: Arc<VenueManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = FieldbookFactory::new(venues, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each booking failure. Storage faults get a system-error class
/// so clients can tell them apart from refusals.
fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Unauthenticated => "28000",
        BookingError::MissingFields => "23502",
        BookingError::InvalidResource => "22023",
        BookingError::InvalidTimeFormat => "22007",
        BookingError::OutOfHorizon => "22008",
        BookingError::SlotTaken | BookingError::EmailTaken => "23505",
        BookingError::NotFound => "P0002",
        BookingError::OwnerNotFound | BookingError::UserNotFound => "42704",
        BookingError::LimitExceeded(_) => "54000",
        BookingError::Storage(_) => "58030",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    if e.is_storage() {
        tracing::error!("storage failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        format!("{}: {e}", e.code()),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
