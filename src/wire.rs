use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Mutex;

use crate::auth::{AdminToken, BarberAuthSource, Role};
use crate::config::Config;
use crate::engine::{EngineError, SlotEngine};
use crate::limits::BOOKING_WINDOW_DAYS;
use crate::model::*;
use crate::notify::{channel_name, notice_payload, parse_channel};
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::{Shop, ShopManager};

/// One handler per connection: it owns that session's LISTEN subscriptions.
pub struct BarberHandler {
    shops: Arc<ShopManager>,
    admin_user: String,
    query_parser: Arc<BarberQueryParser>,
    listens: Mutex<HashMap<NaiveDate, broadcast::Receiver<Event>>>,
}

impl BarberHandler {
    pub fn new(shops: Arc<ShopManager>, admin_user: String) -> Self {
        Self {
            shops,
            admin_user,
            query_parser: Arc::new(BarberQueryParser),
            listens: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve_shop(&self, db: &str) -> PgWireResult<Arc<Shop>> {
        self.shops
            .get_or_create(db)
            .await
            .map_err(|e| user_error("08006", format!("shop error: {e}")))
    }

    fn role<C: ClientInfo>(&self, client: &C) -> Role {
        Role::for_user(
            client.metadata().get("user").map(String::as_str),
            &self.admin_user,
        )
    }

    /// Parse, run and time one statement, then flush pending notifications.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let role = self.role(client);
        let shop = self.resolve_shop(&db).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&shop, role, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.flush_notifications(client).await?;
        result
    }

    async fn execute_command(
        &self,
        shop: &Shop,
        role: Role,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine: &SlotEngine = &shop.engine;
        let today = Utc::now().date_naive();
        match cmd {
            // ── Public ───────────────────────────────────────
            Command::SelectSettings => {
                let settings = engine.shop_settings().await.map_err(engine_err)?;
                Ok(vec![rows(TableKind::Settings, vec![settings_row(&settings)])])
            }
            Command::SelectServices => {
                let services = engine.list_services().await.map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Services,
                    services.iter().map(service_row).collect(),
                )])
            }
            Command::SelectDays { from } => {
                let days = engine
                    .upcoming_days(from.unwrap_or(today), BOOKING_WINDOW_DAYS)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Days,
                    days.iter()
                        .map(|d| {
                            vec![
                                d.date.to_string(),
                                d.date.format("%A").to_string().to_lowercase(),
                                d.open.to_string(),
                            ]
                        })
                        .collect(),
                )])
            }
            Command::SelectSlots { date } => {
                let slots = engine.slots_for(date).await.map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Slots,
                    slots
                        .iter()
                        .map(|s| vec![s.id.clone(), date.to_string(), s.label(), s.available.to_string()])
                        .collect(),
                )])
            }
            Command::InsertAppointment { request, returning } => {
                let booked = engine.book_slot(request).await.map_err(engine_err)?;
                if returning {
                    Ok(vec![rows(TableKind::Appointments, vec![appointment_row(&booked)])])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::SelectHandoff { appointment_id } => {
                let handoff = engine.handoff(appointment_id).await.map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Handoff,
                    vec![vec![
                        handoff.appointment_id.to_string(),
                        handoff.message,
                        handoff.url,
                    ]],
                )])
            }
            Command::Listen { channel } => {
                let date = parse_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected slots_YYYY_MM_DD)"),
                    )
                })?;
                let rx = shop.notify().subscribe(date);
                self.listens.lock().await.insert(date, rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(date) = parse_channel(&channel) {
                    self.listens.lock().await.remove(&date);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listens.lock().await.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }

            // ── Admin ────────────────────────────────────────
            Command::UpdateSettings { patch } => {
                let admin = require_admin(role)?;
                engine.update_settings(&admin, patch).await.map_err(engine_err)?;
                Ok(vec![updated(1)])
            }
            Command::InsertService { service } => {
                let admin = require_admin(role)?;
                engine.create_service(&admin, service).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateService { id, patch } => {
                let admin = require_admin(role)?;
                engine.update_service(&admin, id, patch).await.map_err(engine_err)?;
                Ok(vec![updated(1)])
            }
            Command::DeleteService { id } => {
                let admin = require_admin(role)?;
                engine.deactivate_service(&admin, id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::SelectAppointments { date } => {
                let admin = require_admin(role)?;
                let appointments = engine
                    .list_appointments(&admin, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Appointments,
                    appointments.iter().map(appointment_row).collect(),
                )])
            }
            Command::UpdateAppointment { id, patch } => {
                let admin = require_admin(role)?;
                engine
                    .update_appointment(&admin, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![updated(1)])
            }
            Command::DeleteAppointment { id } => {
                let admin = require_admin(role)?;
                engine.delete_appointment(&admin, id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::SelectExpenses => {
                let admin = require_admin(role)?;
                let expenses = engine.list_expenses(&admin).await.map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Expenses,
                    expenses.iter().map(expense_row).collect(),
                )])
            }
            Command::InsertExpense { expense } => {
                let admin = require_admin(role)?;
                engine.record_expense(&admin, expense).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteExpense { id } => {
                let admin = require_admin(role)?;
                engine.delete_expense(&admin, id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::SelectDashboard { date } => {
                let admin = require_admin(role)?;
                let dash = engine
                    .dashboard(&admin, date.unwrap_or(today))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(
                    TableKind::Dashboard,
                    vec![vec![
                        dash.date.to_string(),
                        dash.today_appointments.to_string(),
                        format_cents(dash.today_revenue),
                        dash.month_appointments.to_string(),
                        format_cents(dash.month_revenue),
                        format_cents(dash.month_expenses),
                        format_cents(dash.month_profit),
                    ]],
                )])
            }
        }
    }

    /// Send every event queued on this session's channels as NotificationResponse.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listens = self.listens.lock().await;
            for (date, rx) in listens.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((channel_name(*date), notice_payload(&event))),
                        Err(TryRecvError::Lagged(skipped)) => {
                            tracing::warn!(%date, skipped, "listener lagged, notifications dropped");
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

fn require_admin(role: Role) -> PgWireResult<AdminToken> {
    role.admin_token()
        .ok_or_else(|| user_error("42501", "admin login required".to_string()))
}

fn updated(n: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

// ── Result sets ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableKind {
    Settings,
    Services,
    Days,
    Slots,
    Appointments,
    Handoff,
    Expenses,
    Dashboard,
}

impl TableKind {
    fn from_name(table: &str) -> Option<Self> {
        Some(match table {
            "settings" => TableKind::Settings,
            "services" => TableKind::Services,
            "days" => TableKind::Days,
            "slots" => TableKind::Slots,
            "appointments" => TableKind::Appointments,
            "handoff" => TableKind::Handoff,
            "expenses" => TableKind::Expenses,
            "dashboard" => TableKind::Dashboard,
            _ => return None,
        })
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Settings => &[
                "name",
                "whatsapp",
                "open_days",
                "slots_per_hour",
                "working_hours_start",
                "working_hours_end",
            ],
            TableKind::Services => &["id", "name", "price", "duration", "active"],
            TableKind::Days => &["date", "weekday", "open"],
            TableKind::Slots => &["id", "date", "time", "available"],
            TableKind::Appointments => &[
                "id",
                "customer_name",
                "service_id",
                "date",
                "time",
                "price",
                "status",
                "created_at",
            ],
            TableKind::Handoff => &["appointment_id", "message", "url"],
            TableKind::Expenses => &["id", "description", "amount", "date", "category", "created_at"],
            TableKind::Dashboard => &[
                "date",
                "today_appointments",
                "today_revenue",
                "month_appointments",
                "month_revenue",
                "month_expenses",
                "month_profit",
            ],
        }
    }

    /// Every column goes out as text; clients parse amounts and dates themselves.
    fn schema(self) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .map(|name| FieldInfo::new(name.to_string(), None, None, Type::VARCHAR, FieldFormat::Text))
            .collect()
    }
}

fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::output_table(sql)
        .and_then(|t| TableKind::from_name(&t))
        .map(TableKind::schema)
        .unwrap_or_default()
}

fn rows(kind: TableKind, data: Vec<Vec<String>>) -> Response {
    let schema = Arc::new(kind.schema());
    let encoded: Vec<PgWireResult<_>> = data
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for value in &row {
                encoder.encode_field(value)?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

fn settings_row(s: &ShopSettings) -> Vec<String> {
    vec![
        s.name.clone(),
        s.whatsapp.clone(),
        s.config.open_days.to_string(),
        s.config.slots_per_hour.to_string(),
        time_label(s.config.working_hours_start),
        time_label(s.config.working_hours_end),
    ]
}

fn service_row(s: &Service) -> Vec<String> {
    vec![
        s.id.to_string(),
        s.name.clone(),
        format_cents(s.price),
        s.duration.to_string(),
        s.active.to_string(),
    ]
}

fn appointment_row(a: &Appointment) -> Vec<String> {
    vec![
        a.id.to_string(),
        a.customer_name.clone(),
        a.service_id.to_string(),
        a.date.to_string(),
        time_label(a.time),
        format_cents(a.price),
        a.status.as_str().to_string(),
        a.created_at.to_rfc3339(),
    ]
}

fn expense_row(e: &Expense) -> Vec<String> {
    vec![
        e.id.to_string(),
        e.description.clone(),
        format_cents(e.amount),
        e.date.to_string(),
        e.category.as_str().to_string(),
        e.created_at.to_rfc3339(),
    ]
}

#[async_trait]
impl SimpleQueryHandler for BarberHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BarberQueryParser;

#[async_trait]
impl QueryParser for BarberQueryParser {
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
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BarberHandler {
    type Statement = String;
    type QueryParser = BarberQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
            describe(&target.statement),
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
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in `sql`.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace `$1`, `$2`, ... with bound values as quoted text. Highest index
/// first so `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BarberFactory {
    handler: Arc<BarberHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BarberAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BarberFactory {
    pub fn new(shops: Arc<ShopManager>, config: &Config) -> Self {
        let auth_source = BarberAuthSource::new(
            config.password.clone(),
            config.admin_user.clone(),
            config.admin_password.clone(),
        );
        Self {
            handler: Arc::new(BarberHandler::new(shops, config.admin_user.clone())),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BarberFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    shops: Arc<ShopManager>,
    config: Arc<Config>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BarberFactory::new(shops, &config));
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

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Configuration(_) => "55000",
        EngineError::SlotConflict { .. } => "23505",
        EngineError::NotFound(_) => "02000",
        EngineError::Lookup(_) | EngineError::Transport(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        SqlError::InvalidValue { .. } => "22P02",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
