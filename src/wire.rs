use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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

use crate::auth::CadenceAuthSource;
use crate::engine::{Engine, today_utc};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::WorkspaceManager;

/// Horizon applied when a generate call or schedule query names none.
pub const DEFAULT_HORIZON_WEEKS: u32 = 12;

pub struct CadenceHandler {
    workspaces: Arc<WorkspaceManager>,
    query_parser: Arc<CadenceQueryParser>,
}

impl CadenceHandler {
    pub fn new(workspaces: Arc<WorkspaceManager>) -> Self {
        Self {
            workspaces,
            query_parser: Arc::new(CadenceQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.workspaces.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("workspace error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertService {
                id,
                name,
                base_price,
                estimated_minutes,
            } => {
                engine
                    .create_service(id, name, base_price, estimated_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateService {
                id,
                name,
                base_price,
                estimated_minutes,
            } => {
                engine
                    .update_service(id, name, base_price, estimated_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertRule {
                id,
                customer_id,
                address_id,
                service_id,
                frequency,
                interval,
                day_of_week,
                day_of_month,
                preferred_time,
                start_date,
                end_date,
            } => {
                let recurrence = Recurrence {
                    frequency,
                    interval,
                    day_of_week,
                    day_of_month,
                };
                engine
                    .create_rule(
                        id,
                        customer_id,
                        address_id,
                        service_id,
                        recurrence,
                        preferred_time,
                        start_date,
                        end_date,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRule { id, changes } => {
                engine.update_rule(id, changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRule { id } => {
                engine.delete_rule(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertSkipDate {
                rule_id,
                date,
                reason,
            } => {
                engine
                    .add_skip_date(rule_id, date, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSkipDate { rule_id, date } => {
                engine
                    .remove_skip_date(rule_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                rule_id,
                date,
                time,
            } => {
                engine
                    .create_booking(id, rule_id, date, time)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBookingStatus { id, status } => {
                match status {
                    BookingStatus::Completed => engine.complete_booking(id).await,
                    BookingStatus::Cancelled => engine.cancel_booking(id).await,
                    BookingStatus::Confirmed => {
                        return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                            "ERROR".into(),
                            "22023".into(),
                            "cannot transition back to confirmed".into(),
                        ))));
                    }
                }
                .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectServices => {
                let services = engine.list_services();
                let schema = Arc::new(service_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.base_price.to_string())?;
                        encoder.encode_field(&(s.estimated_minutes as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRules => {
                let rules = engine.list_rules().await;
                let schema = Arc::new(rule_schema());
                let rows: Vec<PgWireResult<_>> = rules
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.customer_id.to_string())?;
                        encoder.encode_field(&r.address_id.to_string())?;
                        encoder.encode_field(&r.service_id.to_string())?;
                        encoder.encode_field(&r.recurrence.frequency.as_str())?;
                        encoder.encode_field(&(r.recurrence.interval as i32))?;
                        encoder.encode_field(
                            &r.recurrence
                                .day_of_week
                                .map(|d| d.num_days_from_sunday() as i32),
                        )?;
                        encoder.encode_field(&r.recurrence.day_of_month.map(|d| d as i32))?;
                        encoder.encode_field(&r.preferred_time.to_string())?;
                        encoder.encode_field(&r.start_date.to_string())?;
                        encoder.encode_field(&r.end_date.map(|d| d.to_string()))?;
                        encoder.encode_field(&r.is_active)?;
                        encoder.encode_field(&r.is_paused)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSkipDates { rule_id } => {
                let skips = engine.get_skip_dates(rule_id).await.map_err(engine_err)?;
                let schema = Arc::new(skip_date_schema());
                let rid = rule_id.to_string();
                let rows: Vec<PgWireResult<_>> = skips
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&s.date.to_string())?;
                        encoder.encode_field(&s.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { rule_id } => {
                let bookings = engine.get_bookings(rule_id).await.map_err(engine_err)?;
                Ok(vec![booking_rows_response(bookings)])
            }
            Command::SelectSchedule { rule_id, weeks } => {
                let weeks = weeks.unwrap_or(DEFAULT_HORIZON_WEEKS);
                let dates = engine
                    .preview_schedule(rule_id, weeks, today_utc())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schedule_schema());
                let rid = rule_id.to_string();
                let rows: Vec<PgWireResult<_>> = dates
                    .into_iter()
                    .map(|date| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&date.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Generate { rule_id, weeks } => {
                let weeks = weeks.unwrap_or(DEFAULT_HORIZON_WEEKS);
                let outcome = engine
                    .generate_bookings(rule_id, weeks, today_utc())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows_response(outcome.created)])
            }
        }
    }
}

fn booking_rows_response(bookings: Vec<Booking>) -> Response<'static> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.rule_id.to_string())?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&b.time.to_string())?;
            encoder.encode_field(&(b.duration_minutes as i32))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.subtotal.to_string())?;
            encoder.encode_field(&b.tax.to_string())?;
            encoder.encode_field(&b.total.to_string())?;
            encoder.encode_field(&b.recurring)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("base_price", Type::NUMERIC),
        text_field("estimated_minutes", Type::INT4),
    ]
}

fn rule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("customer_id", Type::VARCHAR),
        text_field("address_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("frequency", Type::VARCHAR),
        text_field("interval", Type::INT4),
        text_field("day_of_week", Type::INT4),
        text_field("day_of_month", Type::INT4),
        text_field("preferred_time", Type::TIME),
        text_field("start_date", Type::DATE),
        text_field("end_date", Type::DATE),
        text_field("active", Type::BOOL),
        text_field("paused", Type::BOOL),
    ]
}

fn skip_date_schema() -> Vec<FieldInfo> {
    vec![
        text_field("rule_id", Type::VARCHAR),
        text_field("date", Type::DATE),
        text_field("reason", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("rule_id", Type::VARCHAR),
        text_field("date", Type::DATE),
        text_field("time", Type::TIME),
        text_field("duration_minutes", Type::INT4),
        text_field("status", Type::VARCHAR),
        text_field("subtotal", Type::NUMERIC),
        text_field("tax", Type::NUMERIC),
        text_field("total", Type::NUMERIC),
        text_field("recurring", Type::BOOL),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("rule_id", Type::VARCHAR),
        text_field("date", Type::DATE),
    ]
}

/// Result schema for describe/prepare, keyed off the SQL text the same
/// way results are keyed off the parsed command.
fn result_schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("GENERATE_BOOKINGS") || upper.contains("FROM BOOKINGS") {
        booking_schema()
    } else if upper.contains("FROM SCHEDULE") {
        schedule_schema()
    } else if upper.contains("FROM SERVICES") {
        service_schema()
    } else if upper.contains("FROM RULES") {
        rule_schema()
    } else if upper.contains("FROM SKIP_DATES") {
        skip_date_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CadenceHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = crate::observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(
            crate::observability::QUERY_DURATION_SECONDS,
            "command" => label
        )
        .record(started.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CadenceQueryParser;

#[async_trait]
impl QueryParser for CadenceQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CadenceHandler {
    type Statement = String;
    type QueryParser = CadenceQueryParser;

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
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct CadenceFactory {
    handler: Arc<CadenceHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CadenceAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CadenceFactory {
    pub fn new(workspaces: Arc<WorkspaceManager>, password: String) -> Self {
        let auth_source = CadenceAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CadenceHandler::new(workspaces)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CadenceFactory {
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

/// Run one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    workspaces: Arc<WorkspaceManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), io::Error> {
    let factory = Arc::new(CadenceFactory::new(workspaces, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
