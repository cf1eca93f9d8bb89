use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{
    AppointmentPatch, BookingRequest, NewExpense, NewService, ServicePatch, SettingsPatch,
};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSettings,
    UpdateSettings {
        patch: SettingsPatch,
    },
    SelectServices,
    InsertService {
        service: NewService,
    },
    UpdateService {
        id: Ulid,
        patch: ServicePatch,
    },
    DeleteService {
        id: Ulid,
    },
    /// The booking date picker, starting at `from` (today when absent).
    SelectDays {
        from: Option<NaiveDate>,
    },
    SelectSlots {
        date: NaiveDate,
    },
    InsertAppointment {
        request: BookingRequest,
        returning: bool,
    },
    SelectAppointments {
        date: Option<NaiveDate>,
    },
    UpdateAppointment {
        id: Ulid,
        patch: AppointmentPatch,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectHandoff {
        appointment_id: Ulid,
    },
    SelectExpenses,
    InsertExpense {
        expense: NewExpense,
    },
    DeleteExpense {
        id: Ulid,
    },
    SelectDashboard {
        date: Option<NaiveDate>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        return Ok(match rest {
            "*" => Command::UnlistenAll,
            channel => Command::Unlisten {
                channel: unquote(channel),
            },
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: unquote(rest),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table whose rows `sql` returns, for Describe. Works on unbound `$n`
/// statements, which [`parse_sql`] would reject.
pub fn output_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        Statement::Insert(insert) if insert.returning.is_some() => insert_table_name(insert).ok(),
        _ => None,
    }
}

/// `LISTEN x` / `UNLISTEN x`, case-insensitive; `None` if `sql` is another statement.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn unquote(channel: &str) -> String {
    channel.trim().trim_matches('"').to_string()
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = single_values_row(insert)?;
    let defaults: &[&str] = match table.as_str() {
        "services" => &["name", "price", "duration"],
        "appointments" => &["customer_name", "service_id", "date", "time"],
        "expenses" => &["description", "amount", "date", "category"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let fields = columns.iter().map(String::as_str).zip(values.iter());

    match table.as_str() {
        "services" => {
            let (mut name, mut price, mut duration) = (None, None, None);
            for (col, expr) in fields {
                match col {
                    "name" => name = text_value(expr)?,
                    "price" => price = typed(col, expr, parse_cents)?,
                    "duration" => duration = typed(col, expr, parse_u32)?,
                    _ => return Err(unknown_column("services", col)),
                }
            }
            Ok(Command::InsertService {
                service: NewService {
                    name: name.ok_or(SqlError::MissingColumn("name"))?,
                    price: price.ok_or(SqlError::MissingColumn("price"))?,
                    duration: duration.ok_or(SqlError::MissingColumn("duration"))?,
                },
            })
        }
        "appointments" => {
            let mut request = BookingRequest::default();
            for (col, expr) in fields {
                match col {
                    "customer_name" => request.customer_name = text_value(expr)?.unwrap_or_default(),
                    "service_id" => request.service_id = typed(col, expr, parse_ulid)?,
                    "date" => request.date = typed(col, expr, parse_date)?,
                    "time" => request.time = typed(col, expr, parse_time)?,
                    _ => return Err(unknown_column("appointments", col)),
                }
            }
            Ok(Command::InsertAppointment {
                request,
                returning: insert.returning.is_some(),
            })
        }
        _ => {
            let (mut description, mut amount, mut date, mut category) = (None, None, None, None);
            for (col, expr) in fields {
                match col {
                    "description" => description = text_value(expr)?,
                    "amount" => amount = typed(col, expr, parse_cents)?,
                    "date" => date = typed(col, expr, parse_date)?,
                    "category" => category = typed(col, expr, |s| s.parse::<ExpenseCategory>())?,
                    _ => return Err(unknown_column("expenses", col)),
                }
            }
            Ok(Command::InsertExpense {
                expense: NewExpense {
                    description: description.ok_or(SqlError::MissingColumn("description"))?,
                    amount: amount.ok_or(SqlError::MissingColumn("amount"))?,
                    date: date.ok_or(SqlError::MissingColumn("date"))?,
                    category: category.unwrap_or(ExpenseCategory::Other),
                },
            })
        }
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((column, &a.value));
    }

    match table.as_str() {
        "settings" => {
            let mut patch = SettingsPatch::default();
            for (col, expr) in sets {
                match col.as_str() {
                    "name" => patch.name = text_value(expr)?,
                    "whatsapp" => patch.whatsapp = text_value(expr)?,
                    "open_days" => patch.open_days = typed(&col, expr, |s| s.parse::<OpenDays>())?,
                    "slots_per_hour" => patch.slots_per_hour = typed(&col, expr, parse_u32)?,
                    "working_hours_start" => patch.working_hours_start = typed(&col, expr, parse_time)?,
                    "working_hours_end" => patch.working_hours_end = typed(&col, expr, parse_time)?,
                    _ => return Err(unknown_column("settings", &col)),
                }
            }
            Ok(Command::UpdateSettings { patch })
        }
        "services" => {
            let id = where_id(selection, "id")?;
            let mut patch = ServicePatch::default();
            for (col, expr) in sets {
                match col.as_str() {
                    "name" => patch.name = text_value(expr)?,
                    "price" => patch.price = typed(&col, expr, parse_cents)?,
                    "duration" => patch.duration = typed(&col, expr, parse_u32)?,
                    "active" => patch.active = typed(&col, expr, parse_bool)?,
                    _ => return Err(unknown_column("services", &col)),
                }
            }
            Ok(Command::UpdateService { id, patch })
        }
        "appointments" => {
            let id = where_id(selection, "id")?;
            let mut patch = AppointmentPatch::default();
            for (col, expr) in sets {
                match col.as_str() {
                    "customer_name" => patch.customer_name = text_value(expr)?,
                    "status" => patch.status = typed(&col, expr, |s| s.parse::<AppointmentStatus>())?,
                    "date" => patch.date = typed(&col, expr, parse_date)?,
                    "time" => patch.time = typed(&col, expr, parse_time)?,
                    "price" => patch.price = typed(&col, expr, parse_cents)?,
                    _ => return Err(unknown_column("appointments", &col)),
                }
            }
            Ok(Command::UpdateAppointment { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = where_id(delete.selection.as_ref(), "id")?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        "expenses" => Ok(Command::DeleteExpense { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = match &select.selection {
        Some(expr) => equality_filters(expr)?,
        None => Vec::new(),
    };
    let date_filter = || -> Result<Option<NaiveDate>, SqlError> {
        match filter(&filters, "date") {
            Some(expr) => typed("date", expr, parse_date),
            None => Ok(None),
        }
    };

    match table.as_str() {
        "settings" => Ok(Command::SelectSettings),
        "services" => Ok(Command::SelectServices),
        "expenses" => Ok(Command::SelectExpenses),
        "days" => Ok(Command::SelectDays {
            from: date_filter()?,
        }),
        "slots" => Ok(Command::SelectSlots {
            date: date_filter()?.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            date: date_filter()?,
        }),
        "dashboard" => Ok(Command::SelectDashboard {
            date: date_filter()?,
        }),
        "handoff" => {
            let expr =
                filter(&filters, "appointment_id").ok_or(SqlError::MissingFilter("appointment_id"))?;
            Ok(Command::SelectHandoff {
                appointment_id: typed("appointment_id", expr, parse_ulid)?
                    .ok_or(SqlError::MissingFilter("appointment_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `a = 1 AND b = 2` → `[("a", 1), ("b", 2)]`. Other predicates are rejected
/// rather than silently ignored.
fn equality_filters(expr: &Expr) -> Result<Vec<(String, &Expr)>, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            let mut out = equality_filters(left)?;
            out.extend(equality_filters(right)?);
            Ok(out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            Ok(vec![(col, right.as_ref())])
        }
        Expr::Nested(inner) => equality_filters(inner),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
}

fn where_id(selection: Option<&Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.ok_or(SqlError::MissingFilter(column))?;
    let filters = equality_filters(sel)?;
    let expr = filter(&filters, column).ok_or(SqlError::MissingFilter(column))?;
    typed(column, expr, parse_ulid)?.ok_or(SqlError::MissingFilter(column))
}

// ── AST helpers ───────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn unknown_column(table: &'static str, column: &str) -> SqlError {
    SqlError::UnknownColumn {
        table,
        column: column.to_string(),
    }
}

// ── Literals ──────────────────────────────────────────────────

/// Literal as text; `NULL` → `None`. Casts (`'09:00'::time`) are looked through.
fn text_value(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(text_value(expr)?.map(|s| format!("-{s}"))),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => text_value(expr),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn typed<T, E: std::fmt::Display>(
    column: &str,
    expr: &Expr,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> Result<Option<T>, SqlError> {
    text_value(expr)?
        .map(|s| {
            parse(s.trim()).map_err(|e| SqlError::InvalidValue {
                column: column.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_ulid(s: &str) -> Result<Ulid, String> {
    Ulid::from_string(s).map_err(|e| format!("bad ULID: {e}"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    s.parse().map_err(|_| format!("{s} is not a non-negative integer"))
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(format!("bad bool: {s}")),
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| format!("{s} is not a YYYY-MM-DD date"))
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| format!("{s} is not an HH:MM time"))
}

/// Decimal amount with at most two fractional digits into cents: `35.5` → `3550`.
pub fn parse_cents(s: &str) -> Result<Cents, String> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 2 || !all_digits(whole) || !all_digits(frac) {
        return Err(format!("{s} is not an amount"));
    }
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| format!("{s} is out of range"))?
    };
    let frac: i64 = format!("{frac:0<2}")
        .parse()
        .map_err(|_| format!("{s} is not an amount"))?;
    let cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(|| format!("{s} is out of range"))?;
    Ok(if negative { -cents } else { cents })
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {column}: {reason}")]
    InvalidValue { column: String, reason: String },
}
