use std::collections::HashMap;

use rust_decimal::Decimal;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVenue {
        id: Ulid,
        name: String,
        price_per_hour: Decimal,
    },
    DeleteVenue {
        id: Ulid,
    },
    InsertArena {
        id: Ulid,
        venue_id: Ulid,
        name: String,
        sport: String,
        capacity: u32,
        price_per_hour: Decimal,
    },
    DeleteArena {
        id: Ulid,
    },
    InsertSlot {
        id: Ulid,
        arena_id: Ulid,
        day_of_week: u8,
        start_time: String,
        end_time: String,
        price_per_hour: Decimal,
        capacity: u32,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertPlayer {
        mobile: String,
        name: Option<String>,
    },
    InsertBooking(BookingRequest),
    /// Payment received for a booking.
    InsertPayment {
        booking_id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectVenues,
    SelectArenas {
        venue_id: Option<Ulid>,
    },
    SelectSlots {
        arena_id: Ulid,
    },
    SelectPlayers {
        mobile: String,
    },
    SelectBookings(BookingFilter),
    SelectAvailability {
        resource: ResourceKey,
        booking_date: String,
        min_duration: Option<Minute>,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Id(Ulid),
    Resource {
        resource: ResourceKey,
        booking_date: Option<String>,
    },
}

/// Default column order for INSERTs without a column list.
fn insert_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "venues" => ("venues", &["id", "name", "price_per_hour"]),
        "arenas" => (
            "arenas",
            &["id", "venue_id", "name", "sport", "capacity", "price_per_hour"],
        ),
        "slots" => (
            "slots",
            &["id", "arena_id", "day_of_week", "start_time", "end_time", "price_per_hour", "capacity"],
        ),
        "players" => ("players", &["mobile", "name"]),
        "bookings" => (
            "bookings",
            &[
                "venue_id",
                "arena_id",
                "player_mobile",
                "player_name",
                "booking_date",
                "start_time",
                "end_time",
                "sport",
                "notes",
            ],
        ),
        "payments" => ("payments", &["booking_id"]),
        _ => return None,
    })
}

/// Parse a single statement, as sent through the extended query protocol.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported(
            "multiple statements in one prepared statement".into(),
        ));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement of a simple query.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. NULL counts as absent.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.values
            .get(col)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        parse_text_expr(self.required(col)?)
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_text_expr).transpose()
    }

    fn decimal(&self, col: &'static str) -> Result<Decimal, SqlError> {
        parse_decimal_expr(self.required(col)?)
    }

    fn u32_or(&self, col: &str, default: u32) -> Result<u32, SqlError> {
        match self.get(col) {
            Some(e) => parse_u32(e),
            None => Ok(default),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults) = insert_columns(&table).ok_or(SqlError::UnknownTable(table))?;

    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "{table}: one row per INSERT, got {}",
            rows.len()
        )));
    }
    let values = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > defaults.len() {
            return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
        }
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    for col in &columns {
        if !defaults.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(table, col.clone()));
        }
    }

    let row = Row {
        table,
        values: columns.into_iter().zip(values.iter()).collect(),
    };

    match table {
        "venues" => Ok(Command::InsertVenue {
            id: row.ulid("id")?,
            name: row.text("name")?,
            price_per_hour: row.decimal("price_per_hour")?,
        }),
        "arenas" => Ok(Command::InsertArena {
            id: row.ulid("id")?,
            venue_id: row.ulid("venue_id")?,
            name: row.text("name")?,
            sport: row.text("sport")?,
            capacity: row.u32_or("capacity", 1)?,
            price_per_hour: row.decimal("price_per_hour")?,
        }),
        "slots" => Ok(Command::InsertSlot {
            id: row.ulid("id")?,
            arena_id: row.ulid("arena_id")?,
            day_of_week: parse_u8(row.required("day_of_week")?)?,
            start_time: row.text("start_time")?,
            end_time: row.text("end_time")?,
            price_per_hour: row.decimal("price_per_hour")?,
            capacity: row.u32_or("capacity", 1)?,
        }),
        "players" => Ok(Command::InsertPlayer {
            mobile: row.text("mobile")?,
            name: row.opt_text("name")?,
        }),
        "bookings" => Ok(Command::InsertBooking(BookingRequest {
            venue_id: row.ulid("venue_id")?,
            arena_id: row.opt_ulid("arena_id")?,
            player_mobile: row.text("player_mobile")?,
            player_name: row.opt_text("player_name")?,
            booking_date: row.text("booking_date")?,
            start_time: row.text("start_time")?,
            end_time: row.text("end_time")?,
            sport: row.opt_text("sport")?,
            notes: row.opt_text("notes")?,
        })),
        "payments" => Ok(Command::InsertPayment {
            booking_id: row.ulid("booking_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "venues" => Ok(Command::DeleteVenue { id }),
        "arenas" => Ok(Command::DeleteArena { id }),
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter_ulid = |col: &str| filters.get(col).map(|e| parse_ulid_expr(e)).transpose();
    let filter_text = |col: &str| filters.get(col).map(|e| parse_text_expr(e)).transpose();

    match table.as_str() {
        "venues" => Ok(Command::SelectVenues),
        "arenas" => Ok(Command::SelectArenas {
            venue_id: filter_ulid("venue_id")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            arena_id: filter_ulid("arena_id")?.ok_or(SqlError::MissingFilter("arena_id"))?,
        }),
        "players" => Ok(Command::SelectPlayers {
            mobile: filter_text("mobile")?.ok_or(SqlError::MissingFilter("mobile"))?,
        }),
        "bookings" => {
            if let Some(id) = filter_ulid("id")? {
                return Ok(Command::SelectBookings(BookingFilter::Id(id)));
            }
            let resource = resource_filter(filter_ulid("arena_id")?, filter_ulid("venue_id")?)?;
            Ok(Command::SelectBookings(BookingFilter::Resource {
                resource,
                booking_date: filter_text("booking_date")?,
            }))
        }
        "availability" => {
            let resource = resource_filter(filter_ulid("arena_id")?, filter_ulid("venue_id")?)?;
            let min_duration = filters.get("min_duration").map(|e| parse_u16(e)).transpose()?;
            Ok(Command::SelectAvailability {
                resource,
                booking_date: filter_text("booking_date")?
                    .ok_or(SqlError::MissingFilter("booking_date"))?,
                min_duration,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// An arena filter wins over a venue filter.
fn resource_filter(arena_id: Option<Ulid>, venue_id: Option<Ulid>) -> Result<ResourceKey, SqlError> {
    match (arena_id, venue_id) {
        (Some(arena), _) => Ok(ResourceKey::Arena(arena)),
        (None, Some(venue)) => Ok(ResourceKey::Venue(venue)),
        (None, None) => Err(SqlError::MissingFilter("arena_id or venue_id")),
    }
}

/// Collect `col = value` pairs from an AND-tree.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.insert(col, right.as_ref());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Strings as-is; numbers keep their literal text (e.g. an unquoted mobile).
fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_decimal_expr(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse::<Decimal>()
            .map_err(|e| SqlError::Parse(format!("bad decimal {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64_expr(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
