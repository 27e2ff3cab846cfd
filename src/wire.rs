use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream;
use rust_decimal::Decimal;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::CourtsideAuthSource;
use crate::engine::{parse_date, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct CourtsideHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CourtsideQueryParser>,
}

impl CourtsideHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CourtsideQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Execute one command and record its metrics.
    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let command = observability::command_label(&cmd);
        debug!(command, "executing");

        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metrics::counter!(QUERIES_TOTAL, "command" => command, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => command)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
        match cmd {
            Command::InsertVenue {
                id,
                name,
                price_per_hour,
            } => {
                engine.create_venue(id, name, price_per_hour).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteVenue { id } => {
                engine.deactivate_venue(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertArena {
                id,
                venue_id,
                name,
                sport,
                capacity,
                price_per_hour,
            } => {
                engine
                    .create_arena(id, venue_id, name, sport, capacity, price_per_hour)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteArena { id } => {
                engine.deactivate_arena(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertSlot {
                id,
                arena_id,
                day_of_week,
                start_time,
                end_time,
                price_per_hour,
                capacity,
            } => {
                engine
                    .add_slot(
                        id,
                        arena_id,
                        day_of_week,
                        &start_time,
                        &end_time,
                        price_per_hour,
                        capacity,
                    )
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSlot { id } => {
                engine.remove_slot(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertPlayer { mobile, name } => {
                // Known mobile: nothing inserted, like ON CONFLICT DO NOTHING.
                let (_, created) = engine.find_or_create_player(&mobile, name).await?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(usize::from(created)),
                ))
            }
            Command::InsertBooking(request) => {
                let receipt = engine.create_booking(request).await?;
                let schema = Arc::new(receipt_schema());
                let row = encode_receipt(&schema, &receipt);
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                )))
            }
            Command::InsertPayment { booking_id } => {
                engine.confirm_payment(booking_id).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectVenues => {
                let venues = engine.list_venues();
                Ok(rows_response(venue_schema(), &venues, encode_venue))
            }
            Command::SelectArenas { venue_id } => {
                let arenas = engine.list_arenas(venue_id)?;
                Ok(rows_response(arena_schema(), &arenas, encode_arena))
            }
            Command::SelectSlots { arena_id } => {
                let slots: Vec<(Ulid, Slot)> = engine
                    .list_slots(arena_id)?
                    .into_iter()
                    .map(|s| (arena_id, s))
                    .collect();
                Ok(rows_response(slot_schema(), &slots, encode_slot))
            }
            Command::SelectPlayers { mobile } => {
                let player = engine.get_player(&mobile)?;
                Ok(rows_response(player_schema(), &[player], encode_player))
            }
            Command::SelectBookings(filter) => {
                let bookings = match filter {
                    BookingFilter::Id(id) => vec![engine.get_booking(id).await?],
                    BookingFilter::Resource {
                        resource,
                        booking_date,
                    } => {
                        let date = booking_date.as_deref().map(parse_date).transpose()?;
                        engine.list_bookings(resource, date).await?
                    }
                };
                Ok(rows_response(booking_schema(), &bookings, encode_booking))
            }
            Command::SelectAvailability {
                resource,
                booking_date,
                min_duration,
            } => {
                let date = parse_date(&booking_date)?;
                let free: Vec<(ResourceKey, NaiveDate, Span)> = engine
                    .availability(resource, date, min_duration)
                    .await?
                    .into_iter()
                    .map(|span| (resource, date, span))
                    .collect();
                Ok(rows_response(availability_schema(), &free, encode_window))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("total_amount", Type::NUMERIC),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("payment_link", Type::VARCHAR),
        field("notified", Type::BOOL),
        field("degraded", Type::BOOL),
    ]
}

fn venue_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("price_per_hour", Type::NUMERIC),
        field("is_active", Type::BOOL),
        field("booking_count", Type::INT8),
    ]
}

fn arena_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("venue_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("sport", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("price_per_hour", Type::NUMERIC),
        field("is_active", Type::BOOL),
        field("booking_count", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("arena_id", Type::VARCHAR),
        field("day_of_week", Type::INT2),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("price_per_hour", Type::NUMERIC),
        field("capacity", Type::INT8),
    ]
}

fn player_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("mobile", Type::VARCHAR),
        field("name", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("venue_id", Type::VARCHAR),
        field("arena_id", Type::VARCHAR),
        field("player_id", Type::VARCHAR),
        field("booking_date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("total_amount", Type::NUMERIC),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("sport", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource", Type::VARCHAR),
        field("booking_date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
    ]
}

/// Result schema for a statement, keyed on the table it targets.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let is_select = sql.trim_start().to_uppercase().starts_with("SELECT");
    match (is_select, target_table(sql).as_deref()) {
        (false, Some("bookings")) => receipt_schema(),
        (true, Some("venues")) => venue_schema(),
        (true, Some("arenas")) => arena_schema(),
        (true, Some("slots")) => slot_schema(),
        (true, Some("players")) => player_schema(),
        (true, Some("bookings")) => booking_schema(),
        (true, Some("availability")) => availability_schema(),
        _ => vec![],
    }
}

/// The table named after `FROM` or `INTO`. DELETE gets no schema.
fn target_table(sql: &str) -> Option<String> {
    if sql.trim_start().to_uppercase().starts_with("DELETE") {
        return None;
    }
    let mut words = sql.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("from") || word.eq_ignore_ascii_case("into") {
            return words.next().map(|t| {
                t.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_')
                    .split('(')
                    .next()
                    .unwrap_or_default()
                    .to_lowercase()
            });
        }
    }
    None
}

// ── Row encoding ─────────────────────────────────────────────────

fn money(amount: Decimal) -> String {
    format!("{amount:.2}")
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: fn(&Arc<Vec<FieldInfo>>, &T) -> PgWireResult<DataRow>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items.iter().map(|item| encode(&schema, item)).collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_receipt(schema: &Arc<Vec<FieldInfo>>, receipt: &BookingReceipt) -> PgWireResult<DataRow> {
    let booking = &receipt.booking;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&money(booking.total_amount))?;
    encoder.encode_field(&booking.status.to_string())?;
    encoder.encode_field(&booking.payment_status.as_str().to_string())?;
    encoder.encode_field(&receipt.payment_link)?;
    encoder.encode_field(&receipt.notified)?;
    encoder.encode_field(&receipt.is_degraded())?;
    Ok(encoder.take_row())
}

fn encode_venue(schema: &Arc<Vec<FieldInfo>>, venue: &Venue) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&venue.id.to_string())?;
    encoder.encode_field(&venue.name)?;
    encoder.encode_field(&money(venue.base_price_per_hour))?;
    encoder.encode_field(&venue.is_active)?;
    encoder.encode_field(&(venue.booking_count as i64))?;
    Ok(encoder.take_row())
}

fn encode_arena(schema: &Arc<Vec<FieldInfo>>, arena: &Arena) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&arena.id.to_string())?;
    encoder.encode_field(&arena.venue_id.to_string())?;
    encoder.encode_field(&arena.name)?;
    encoder.encode_field(&arena.sport)?;
    encoder.encode_field(&i64::from(arena.capacity))?;
    encoder.encode_field(&money(arena.base_price_per_hour))?;
    encoder.encode_field(&arena.is_active)?;
    encoder.encode_field(&(arena.booking_count as i64))?;
    Ok(encoder.take_row())
}

fn encode_slot(schema: &Arc<Vec<FieldInfo>>, (arena_id, slot): &(Ulid, Slot)) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&arena_id.to_string())?;
    encoder.encode_field(&i16::from(slot.day_of_week))?;
    encoder.encode_field(&format_hhmm(slot.span.start))?;
    encoder.encode_field(&format_hhmm(slot.span.end))?;
    encoder.encode_field(&money(slot.price_per_hour))?;
    encoder.encode_field(&i64::from(slot.capacity))?;
    Ok(encoder.take_row())
}

fn encode_player(schema: &Arc<Vec<FieldInfo>>, player: &Player) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&player.id.to_string())?;
    encoder.encode_field(&player.mobile)?;
    encoder.encode_field(&player.name)?;
    Ok(encoder.take_row())
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.venue_id.to_string())?;
    encoder.encode_field(&b.arena_id.map(|a| a.to_string()))?;
    encoder.encode_field(&b.player_id.to_string())?;
    encoder.encode_field(&b.booking_date.to_string())?;
    encoder.encode_field(&format_hhmm(b.span.start))?;
    encoder.encode_field(&format_hhmm(b.span.end))?;
    encoder.encode_field(&money(b.total_amount))?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&b.payment_status.as_str().to_string())?;
    encoder.encode_field(&b.sport)?;
    encoder.encode_field(&b.notes)?;
    Ok(encoder.take_row())
}

fn encode_window(
    schema: &Arc<Vec<FieldInfo>>,
    (resource, date, span): &(ResourceKey, NaiveDate, Span),
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&resource.to_string())?;
    encoder.encode_field(&date.to_string())?;
    encoder.encode_field(&format_hhmm(span.start))?;
    encoder.encode_field(&format_hhmm(span.end))?;
    encoder.encode_field(&i32::from(span.duration_minutes()))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
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
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run_command(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtsideAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CourtsideAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtsideHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = CourtsideFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidInput(_) => "22023",
        EngineError::Unavailable(_) => "55P03",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
