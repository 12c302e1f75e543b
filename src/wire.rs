use std::fmt::Debug;
use std::sync::Arc;

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
use ulid::Ulid;

use crate::auth::RentalAuthSource;
use crate::engine::{Engine, RentalFilter};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct RentalHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RentalQueryParser>,
}

impl RentalHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RentalQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertVehicle {
                id,
                org_id,
                rates,
                attrs,
            } => {
                engine
                    .create_vehicle(id, org_id, rates, attrs)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateVehicle { id, patch } => {
                engine.update_vehicle(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteVehicle { id } => {
                engine.delete_vehicle(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertRental {
                id,
                vehicle_id,
                renter_id,
                start,
                end,
            } => {
                engine
                    .submit_rental(id, vehicle_id, renter_id, Span::new(start, end))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RejectRental { id, reason } => {
                engine.reject_rental(id, reason).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRental { id } => {
                engine.delete_rental(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                rental_id,
                pickup_address,
                dropoff_address,
            } => {
                engine
                    .approve_rental(id, rental_id, pickup_address, dropoff_address)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectVehicles { org_id } => {
                let vehicles = engine.list_vehicles(org_id.as_deref()).await;
                let schema = Arc::new(vehicles_schema());
                let rows: Vec<PgWireResult<_>> = vehicles
                    .into_iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.org_id)?;
                        encoder.encode_field(&v.attrs.model)?;
                        encoder.encode_field(&v.attrs.location)?;
                        encoder.encode_field(&v.attrs.category)?;
                        encoder.encode_field(&v.attrs.image_url)?;
                        encoder.encode_field(&v.rates.daily_cents)?;
                        encoder.encode_field(&v.rates.weekly_cents)?;
                        encoder.encode_field(&v.rates.monthly_cents)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRentals {
                id,
                renter_id,
                status,
                page,
                limit,
            } => {
                let rentals = match id {
                    // Point lookup returns the row in any state.
                    Some(id) => vec![engine.get_rental(id).await.map_err(engine_err)?],
                    None => {
                        engine
                            .list_rentals(RentalFilter { renter_id, status }, page, limit)
                            .await
                            .map_err(engine_err)?
                            .items
                    }
                };
                let schema = Arc::new(rentals_schema());
                let rows: Vec<PgWireResult<_>> = rentals
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.vehicle_id.to_string())?;
                        encoder.encode_field(&r.renter_id.to_string())?;
                        encoder.encode_field(&r.span.start)?;
                        encoder.encode_field(&r.span.end)?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&r.total_price_cents)?;
                        encoder.encode_field(&r.reason)?;
                        encoder.encode_field(&r.submitted_at)?;
                        encoder.encode_field(&r.decided_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings {
                renter_id,
                page,
                limit,
            } => {
                let bookings = engine
                    .list_bookings(renter_id, page, limit)
                    .map_err(engine_err)?
                    .items;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.rental_id.to_string())?;
                        encoder.encode_field(&b.vehicle_id.to_string())?;
                        encoder.encode_field(&b.renter_id.to_string())?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.total_price_cents)?;
                        encoder.encode_field(&b.pickup_address)?;
                        encoder.encode_field(&b.dropoff_address)?;
                        encoder.encode_field(&b.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability {
                vehicle_id,
                start,
                end,
            } => {
                let slots = engine
                    .compute_free_spans(vehicle_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let vid_str = vehicle_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&vid_str)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBlocked { vehicle_id } => {
                let blocked = engine.list_blocked(vehicle_id).await.map_err(engine_err)?;
                let schema = Arc::new(blocked_schema());
                let rows: Vec<PgWireResult<_>> = blocked
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.vehicle_id.to_string())?;
                        encoder.encode_field(&b.booking_id.to_string())?;
                        encoder.encode_field(&b.start)?;
                        encoder.encode_field(&b.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAnalytics => {
                let report = engine.analytics();
                let schema = Arc::new(analytics_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(report.total_rentals as i64))?;
                encoder.encode_field(&(report.total_bookings as i64))?;
                encoder.encode_field(&report.total_revenue_cents)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectTopVehicles => {
                let report = engine.analytics();
                let schema = Arc::new(top_vehicles_schema());
                let rows: Vec<PgWireResult<_>> = report
                    .top_vehicles
                    .into_iter()
                    .map(|(vehicle_id, count)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&vehicle_id.to_string())?;
                        encoder.encode_field(&(count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                parse_vehicle_channel(&channel)?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(channel) = channel {
                    parse_vehicle_channel(&channel)?;
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn parse_vehicle_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("vehicle_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected vehicle_{{id}})"),
        )))
    })?;
    Ulid::from_string(id).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("org_id"),
        text_field("model"),
        text_field("location"),
        text_field("category"),
        text_field("image_url"),
        int8_field("daily_rate"),
        int8_field("weekly_rate"),
        int8_field("monthly_rate"),
    ]
}

fn rentals_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("vehicle_id"),
        text_field("renter_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
        int8_field("total_price"),
        text_field("reason"),
        int8_field("submitted_at"),
        int8_field("decided_at"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("rental_id"),
        text_field("vehicle_id"),
        text_field("renter_id"),
        int8_field("start"),
        int8_field("end"),
        int8_field("total_price"),
        text_field("pickup_address"),
        text_field("dropoff_address"),
        int8_field("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("vehicle_id"), int8_field("start"), int8_field("end")]
}

fn blocked_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id"),
        text_field("booking_id"),
        int8_field("start"),
        int8_field("end"),
    ]
}

fn analytics_schema() -> Vec<FieldInfo> {
    vec![
        int8_field("total_rentals"),
        int8_field("total_bookings"),
        int8_field("total_revenue"),
    ]
}

fn top_vehicles_schema() -> Vec<FieldInfo> {
    vec![text_field("vehicle_id"), int8_field("bookings")]
}

fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("BLOCKED") {
        blocked_schema()
    } else if upper.contains("TOP_VEHICLES") {
        top_vehicles_schema()
    } else if upper.contains("ANALYTICS") {
        analytics_schema()
    } else if upper.contains("VEHICLES") {
        vehicles_schema()
    } else if upper.contains("RENTALS") {
        rentals_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RentalHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentalQueryParser;

#[async_trait]
impl QueryParser for RentalQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentalHandler {
    type Statement = String;
    type QueryParser = RentalQueryParser;

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
        let mut responses = self.run(&engine, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
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
                && n > max
            {
                max = n;
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

pub struct RentalFactory {
    handler: Arc<RentalHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentalAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentalFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RentalAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RentalHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentalFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: tokio::net::TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(RentalFactory::new(tenant_manager, password));
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
