use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_PAGE_LIMIT;
use crate::model::*;

/// Parsed command from SQL input. One variant per engine operation, fully
/// typed and validated before the engine is touched.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        org_id: String,
        rates: RateCard,
        attrs: VehicleAttrs,
    },
    UpdateVehicle {
        id: Ulid,
        patch: VehiclePatch,
    },
    DeleteVehicle {
        id: Ulid,
    },
    InsertRental {
        id: Ulid,
        vehicle_id: Ulid,
        renter_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// `UPDATE rentals SET status = 'rejected' …` — the only legal rentals update.
    RejectRental {
        id: Ulid,
        reason: Option<String>,
    },
    DeleteRental {
        id: Ulid,
    },
    /// Approval: a booking can only be minted from a pending rental.
    InsertBooking {
        id: Ulid,
        rental_id: Ulid,
        pickup_address: Option<String>,
        dropoff_address: Option<String>,
    },
    SelectVehicles {
        org_id: Option<String>,
    },
    SelectRentals {
        id: Option<Ulid>,
        renter_id: Option<Ulid>,
        status: Option<RentalStatus>,
        page: usize,
        limit: usize,
    },
    SelectBookings {
        renter_id: Option<Ulid>,
        page: usize,
        limit: usize,
    },
    SelectAvailability {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectBlocked {
        vehicle_id: Ulid,
    },
    SelectAnalytics,
    SelectTopVehicles,
    Listen {
        channel: String,
    },
    Unlisten {
        /// None means `UNLISTEN *`.
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let channel = trimmed[8..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten {
            channel: if channel == "*" || channel.is_empty() {
                None
            } else {
                Some(channel)
            },
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "vehicles" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("vehicles", 5, values.len()));
            }
            let rates = RateCard {
                daily_cents: parse_i64(&values[3])?,
                weekly_cents: if values.len() >= 6 {
                    parse_i64_or_null(&values[5])?
                } else {
                    None
                },
                monthly_cents: if values.len() >= 7 {
                    parse_i64_or_null(&values[6])?
                } else {
                    None
                },
            };
            let attrs = VehicleAttrs {
                model: parse_string(&values[2])?,
                location: parse_string(&values[4])?,
                category: if values.len() >= 8 {
                    parse_string_or_null(&values[7])?
                } else {
                    None
                },
                image_url: if values.len() >= 9 {
                    parse_string_or_null(&values[8])?
                } else {
                    None
                },
            };
            Ok(Command::InsertVehicle {
                id: parse_ulid(&values[0])?,
                org_id: parse_string(&values[1])?,
                rates,
                attrs,
            })
        }
        "rentals" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("rentals", 5, values.len()));
            }
            Ok(Command::InsertRental {
                id: parse_ulid(&values[0])?,
                vehicle_id: parse_ulid(&values[1])?,
                renter_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
            })
        }
        "bookings" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("bookings", 2, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                rental_id: parse_ulid(&values[1])?,
                pickup_address: if values.len() >= 3 {
                    parse_string_or_null(&values[2])?
                } else {
                    None
                },
                dropoff_address: if values.len() >= 4 {
                    parse_string_or_null(&values[3])?
                } else {
                    None
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        "rentals" => Ok(Command::DeleteRental { id }),
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
        "rentals" => {
            let mut status: Option<String> = None;
            let mut reason: Option<String> = None;
            for assignment in assignments {
                match assignment_column(assignment)?.as_str() {
                    "status" => status = Some(parse_string(&assignment.value)?),
                    "reason" => reason = parse_string_or_null(&assignment.value)?,
                    col => {
                        return Err(SqlError::Unsupported(format!(
                            "rentals column not updatable: {col}"
                        )));
                    }
                }
            }
            match status.as_deref() {
                Some("rejected") => Ok(Command::RejectRental { id, reason }),
                Some(other) => Err(SqlError::Unsupported(format!(
                    "status update to {other:?}; only 'rejected' is allowed \
                     (approve by inserting into bookings)"
                ))),
                None => Err(SqlError::MissingFilter("status")),
            }
        }
        "vehicles" => {
            let mut patch = VehiclePatch::default();
            for assignment in assignments {
                match assignment_column(assignment)?.as_str() {
                    "daily_rate" => patch.daily_cents = Some(parse_i64(&assignment.value)?),
                    "weekly_rate" => {
                        patch.weekly_cents = Some(parse_i64_or_null(&assignment.value)?)
                    }
                    "monthly_rate" => {
                        patch.monthly_cents = Some(parse_i64_or_null(&assignment.value)?)
                    }
                    "model" => patch.model = Some(parse_string(&assignment.value)?),
                    "location" => patch.location = Some(parse_string(&assignment.value)?),
                    "category" => {
                        patch.category = Some(parse_string_or_null(&assignment.value)?)
                    }
                    "image_url" => {
                        patch.image_url = Some(parse_string_or_null(&assignment.value)?)
                    }
                    col => {
                        return Err(SqlError::Unsupported(format!(
                            "vehicles column not updatable: {col}"
                        )));
                    }
                }
            }
            Ok(Command::UpdateVehicle { id, patch })
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
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::extract(&select.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::SelectVehicles {
            org_id: filters.get_string("org_id")?,
        }),
        "rentals" => Ok(Command::SelectRentals {
            id: filters.get_ulid("id")?,
            renter_id: filters.get_ulid("renter_id")?,
            status: filters.get_status()?,
            page: filters.page()?,
            limit: filters.limit()?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            renter_id: filters.get_ulid("renter_id")?,
            page: filters.page()?,
            limit: filters.limit()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            vehicle_id: filters
                .get_ulid("vehicle_id")?
                .ok_or(SqlError::MissingFilter("vehicle_id"))?,
            start: filters
                .get_i64("start")?
                .ok_or(SqlError::MissingFilter("start"))?,
            end: filters
                .get_i64("end")?
                .ok_or(SqlError::MissingFilter("end"))?,
        }),
        "blocked" => Ok(Command::SelectBlocked {
            vehicle_id: filters
                .get_ulid("vehicle_id")?
                .ok_or(SqlError::MissingFilter("vehicle_id"))?,
        }),
        "analytics" => Ok(Command::SelectAnalytics),
        "top_vehicles" => Ok(Command::SelectTopVehicles),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flat equality/range filters from a WHERE clause: `col = value` terms
/// joined by AND, plus `start >= n` / `end <= n` for availability windows.
/// `page` and `limit` ride along as pseudo-columns.
struct Filters {
    entries: Vec<(String, Expr)>,
}

impl Filters {
    fn extract(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut entries = Vec::new();
        if let Some(expr) = selection {
            Self::walk(expr, &mut entries)?;
        }
        Ok(Self { entries })
    }

    fn walk(expr: &Expr, entries: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    Self::walk(left, entries)?;
                    Self::walk(right, entries)?;
                    Ok(())
                }
                ast::BinaryOperator::Eq => {
                    if let Some(col) = expr_column_name(left) {
                        entries.push((col, (**right).clone()));
                    }
                    Ok(())
                }
                // `start >= n` and `end <= n` bound the availability window.
                ast::BinaryOperator::GtEq => {
                    if expr_column_name(left).as_deref() == Some("start") {
                        entries.push(("start".into(), (**right).clone()));
                    }
                    Ok(())
                }
                ast::BinaryOperator::LtEq => {
                    if expr_column_name(left).as_deref() == Some("end") {
                        entries.push(("end".into(), (**right).clone()));
                    }
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("operator in WHERE: {op}"))),
            },
            _ => Err(SqlError::Unsupported("complex WHERE clause".into())),
        }
    }

    fn find(&self, col: &str) -> Option<&Expr> {
        self.entries.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn get_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(col).map(parse_ulid_expr).transpose()
    }

    fn get_i64(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.find(col).map(parse_i64_expr).transpose()
    }

    fn get_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.find(col).map(parse_string_expr).transpose()
    }

    fn get_status(&self) -> Result<Option<RentalStatus>, SqlError> {
        match self.get_string("status")? {
            None => Ok(None),
            Some(s) => RentalStatus::parse(&s)
                .map(Some)
                .ok_or(SqlError::Parse(format!("unknown status: {s}"))),
        }
    }

    fn page(&self) -> Result<usize, SqlError> {
        match self.get_i64("page")? {
            None => Ok(1),
            Some(n) => usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad page: {n}"))),
        }
    }

    fn limit(&self) -> Result<usize, SqlError> {
        // `limit` itself is a reserved word, so the page size rides along
        // as `per_page`.
        match self.get_i64("per_page")? {
            None => Ok(DEFAULT_PAGE_LIMIT),
            Some(n) => usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad per_page: {n}"))),
        }
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

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
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
            if values.rows.len() != 1 {
                return Err(SqlError::Parse("expected exactly one VALUES row".into()));
            }
            Ok(values.rows[0].clone())
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_expr(expr)
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        Ok(None)
    } else {
        Ok(Some(parse_i64_expr(expr)?))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        Ok(None)
    } else {
        Ok(Some(parse_string_expr(expr)?))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
