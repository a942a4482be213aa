use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{BookingStatus, Frequency, RuleChanges};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        name: String,
        base_price: Decimal,
        estimated_minutes: u32,
    },
    UpdateService {
        id: Ulid,
        name: Option<String>,
        base_price: Option<Decimal>,
        estimated_minutes: Option<u32>,
    },
    DeleteService {
        id: Ulid,
    },
    InsertRule {
        id: Ulid,
        customer_id: Ulid,
        address_id: Ulid,
        service_id: Ulid,
        frequency: Frequency,
        interval: u32,
        day_of_week: Option<Weekday>,
        day_of_month: Option<u32>,
        preferred_time: NaiveTime,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    },
    UpdateRule {
        id: Ulid,
        changes: RuleChanges,
    },
    DeleteRule {
        id: Ulid,
    },
    InsertSkipDate {
        rule_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    },
    DeleteSkipDate {
        rule_id: Ulid,
        date: NaiveDate,
    },
    InsertBooking {
        id: Ulid,
        rule_id: Ulid,
        date: NaiveDate,
        time: Option<NaiveTime>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectServices,
    SelectRules,
    SelectSkipDates {
        rule_id: Ulid,
    },
    SelectBookings {
        rule_id: Ulid,
    },
    SelectSchedule {
        rule_id: Ulid,
        weeks: Option<u32>,
    },
    /// `SELECT * FROM generate_bookings('<rule_id>'[, weeks])`
    Generate {
        rule_id: Ulid,
        weeks: Option<u32>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "services" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                base_price: parse_decimal(&values[2])?,
                estimated_minutes: parse_u32(&values[3])?,
            })
        }
        "rules" => {
            if values.len() < 10 {
                return Err(SqlError::WrongArity("rules", 10, values.len()));
            }
            let end_date = if values.len() >= 11 {
                parse_date_or_null(&values[10])?
            } else {
                None
            };
            Ok(Command::InsertRule {
                id: parse_ulid(&values[0])?,
                customer_id: parse_ulid(&values[1])?,
                address_id: parse_ulid(&values[2])?,
                service_id: parse_ulid(&values[3])?,
                frequency: parse_frequency(&values[4])?,
                interval: parse_u32(&values[5])?,
                day_of_week: parse_weekday_or_null(&values[6])?,
                day_of_month: parse_u32_or_null(&values[7])?,
                preferred_time: parse_time(&values[8])?,
                start_date: parse_date(&values[9])?,
                end_date,
            })
        }
        "skip_dates" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("skip_dates", 2, values.len()));
            }
            let reason = if values.len() >= 3 {
                parse_string_or_null(&values[2])?
            } else {
                None
            };
            Ok(Command::InsertSkipDate {
                rule_id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                reason,
            })
        }
        "bookings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            let time = if values.len() >= 4 {
                parse_time_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                rule_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                time,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService {
            id: extract_where_id(&delete.selection)?,
        }),
        "rules" => Ok(Command::DeleteRule {
            id: extract_where_id(&delete.selection)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        "skip_dates" => {
            let filters = collect_eq_filters(&delete.selection);
            let rule_id = filters
                .iter()
                .find(|(col, _)| col == "rule_id")
                .ok_or(SqlError::MissingFilter("rule_id"))
                .and_then(|(_, expr)| parse_ulid_expr(expr))?;
            let date = filters
                .iter()
                .find(|(col, _)| col == "date")
                .ok_or(SqlError::MissingFilter("date"))
                .and_then(|(_, expr)| parse_date(expr))?;
            Ok(Command::DeleteSkipDate { rule_id, date })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "services" => {
            let (mut name, mut base_price, mut estimated_minutes) = (None, None, None);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = Some(parse_string(&a.value)?),
                    "base_price" => base_price = Some(parse_decimal(&a.value)?),
                    "estimated_minutes" => estimated_minutes = Some(parse_u32(&a.value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateService {
                id,
                name,
                base_price,
                estimated_minutes,
            })
        }
        "rules" => {
            let mut changes = RuleChanges::default();
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "frequency" => changes.frequency = Some(parse_frequency(&a.value)?),
                    "interval" => changes.interval = Some(parse_u32(&a.value)?),
                    "day_of_week" => {
                        changes.day_of_week = Some(parse_weekday_or_null(&a.value)?)
                    }
                    "day_of_month" => changes.day_of_month = Some(parse_u32_or_null(&a.value)?),
                    "preferred_time" => changes.preferred_time = Some(parse_time(&a.value)?),
                    "end_date" => changes.end_date = Some(parse_date_or_null(&a.value)?),
                    "active" => changes.is_active = Some(parse_bool(&a.value)?),
                    "paused" => changes.is_paused = Some(parse_bool(&a.value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateRule { id, changes })
        }
        "bookings" => {
            let mut status = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => status = Some(parse_status(&a.value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateBookingStatus {
                id,
                status: status.ok_or(SqlError::MissingFilter("status"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }

    // Table-function form: SELECT * FROM generate_bookings('<id>'[, weeks])
    if let TableFactor::Table {
        name,
        args: Some(fn_args),
        ..
    } = &select.from[0].relation
    {
        let fn_name =
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
        if fn_name != "generate_bookings" {
            return Err(SqlError::UnknownTable(fn_name));
        }
        let args = extract_fn_args(&fn_args.args)?;
        if args.is_empty() {
            return Err(SqlError::WrongArity("generate_bookings", 1, 0));
        }
        let rule_id = parse_ulid(&args[0])?;
        let weeks = if args.len() >= 2 {
            Some(parse_u32(&args[1])?)
        } else {
            None
        };
        return Ok(Command::Generate { rule_id, weeks });
    }

    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_eq_filters(&select.selection);
    let find_rule_id = || {
        filters
            .iter()
            .find(|(col, _)| col == "rule_id")
            .ok_or(SqlError::MissingFilter("rule_id"))
            .and_then(|(_, expr)| parse_ulid_expr(expr))
    };

    match table.as_str() {
        "services" => Ok(Command::SelectServices),
        "rules" => Ok(Command::SelectRules),
        "skip_dates" => Ok(Command::SelectSkipDates {
            rule_id: find_rule_id()?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            rule_id: find_rule_id()?,
        }),
        "schedule" => {
            let weeks = filters
                .iter()
                .find(|(col, _)| col == "weeks")
                .map(|(_, expr)| parse_u32(expr))
                .transpose()?;
            Ok(Command::SelectSchedule {
                rule_id: find_rule_id()?,
                weeks,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_fn_args(args: &[ast::FunctionArg]) -> Result<Vec<Expr>, SqlError> {
    args.iter()
        .map(|a| match a {
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => Ok(e.clone()),
            other => Err(SqlError::Parse(format!("unsupported argument: {other}"))),
        })
        .collect()
}

/// Flatten an AND-chain of `col = value` comparisons.
fn collect_eq_filters(selection: &Option<Expr>) -> Vec<(String, Expr)> {
    let mut filters = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters_inner(expr, &mut filters);
    }
    filters
}

fn collect_eq_filters_inner(expr: &Expr, out: &mut Vec<(String, Expr)>) {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                collect_eq_filters_inner(left, out);
                collect_eq_filters_inner(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, (**right).clone()));
                }
            }
            _ => {}
        }
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_u32(expr)?))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_string(expr)?))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                Decimal::from_str(s).map_err(|e| SqlError::Parse(format!("bad decimal: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_date(expr)?))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_time(expr)?))
}

fn parse_frequency(expr: &Expr) -> Result<Frequency, SqlError> {
    let s = parse_string(expr)?;
    match s.to_lowercase().as_str() {
        "weekly" => Ok(Frequency::Weekly),
        "biweekly" => Ok(Frequency::Biweekly),
        "monthly" => Ok(Frequency::Monthly),
        "custom" => Ok(Frequency::Custom),
        _ => Err(SqlError::Parse(format!("bad frequency: {s}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    match s.to_lowercase().as_str() {
        "completed" => Ok(BookingStatus::Completed),
        "cancelled" => Ok(BookingStatus::Cancelled),
        _ => Err(SqlError::Parse(format!("unsupported status: {s}"))),
    }
}

/// Wire integer → weekday, 0 = Sunday (the convention rules are created
/// with upstream).
fn parse_weekday_or_null(expr: &Expr) -> Result<Option<Weekday>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    let n = parse_i64_expr(expr)?;
    let dow = match n {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        _ => return Err(SqlError::Parse(format!("day_of_week {n} out of range 0-6"))),
    };
    Ok(Some(dow))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
