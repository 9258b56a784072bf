use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Parsed command from SQL input.
///
/// Booking inputs stay raw strings: resource and time validation belongs to
/// the booking service, which reports them with its own error codes.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        resource: String,
        slot_time: String,
    },
    DeleteReservation {
        id: u64,
    },
    InsertUser {
        email: String,
        name: String,
    },
    DeleteUser {
        id: Ulid,
    },
    SelectMyReservations,
    SelectAvailability {
        resource: String,
        day: String,
    },
    SelectUserReservations {
        user_id: Ulid,
    },
    SelectResources,
}

impl Command {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::InsertReservation { .. } => "create_reservation",
            Command::DeleteReservation { .. } => "cancel_reservation",
            Command::InsertUser { .. } => "register_user",
            Command::DeleteUser { .. } => "delete_user",
            Command::SelectMyReservations => "list_mine",
            Command::SelectAvailability { .. } => "list_availability",
            Command::SelectUserReservations { .. } => "list_history",
            Command::SelectResources => "list_resources",
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let row = InsertRow { columns: &columns, values: &values };

    match table.as_str() {
        "reservations" => {
            row.check_arity("reservations", 2)?;
            Ok(Command::InsertReservation {
                resource: row.text(&["resource", "resource_kind"], 0)?,
                slot_time: row.text(&["slot_time"], 1)?,
            })
        }
        "users" => {
            row.check_arity("users", 2)?;
            Ok(Command::InsertUser {
                email: row.text(&["email"], 0)?,
                name: row.text(&["name", "display_name"], 1)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row, addressed by column name when the statement lists
/// columns and by position otherwise.
struct InsertRow<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl InsertRow<'_> {
    fn check_arity(&self, table: &'static str, expected: usize) -> Result<(), SqlError> {
        if self.values.len() < expected {
            return Err(SqlError::WrongArity(table, expected, self.values.len()));
        }
        if !self.columns.is_empty() && self.columns.len() != self.values.len() {
            return Err(SqlError::WrongArity(table, self.columns.len(), self.values.len()));
        }
        Ok(())
    }

    fn text(&self, names: &[&'static str], position: usize) -> Result<String, SqlError> {
        let index = if self.columns.is_empty() {
            Some(position)
        } else {
            self.columns.iter().position(|c| names.contains(&c.as_str()))
        };
        match index.and_then(|i| self.values.get(i)) {
            Some(expr) => parse_text_expr(expr),
            None => Err(SqlError::MissingColumn(names[0])),
        }
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id: parse_u64_expr(id)? }),
        "users" => Ok(Command::DeleteUser { id: parse_ulid_expr(id)? }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, v)| v.clone());

    match table.as_str() {
        "my_reservations" => Ok(Command::SelectMyReservations),
        "resources" => Ok(Command::SelectResources),
        // Absent filters reach the booking service as empty fields.
        "availability" => Ok(Command::SelectAvailability {
            resource: filter("resource").unwrap_or_default(),
            day: filter("day").or_else(|| filter("date")).unwrap_or_default(),
        }),
        "reservations" => {
            let raw = filter("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
            let user_id = Ulid::from_string(&raw).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?;
            Ok(Command::SelectUserReservations { user_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 'x' AND b = 'y'` into `(column, text)` pairs. Other
/// predicates are ignored.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, String)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)?;
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, parse_text_expr(right)?));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        _ => {}
    }
    Ok(())
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

/// First VALUES row. Multi-row inserts are rejected; each booking is its own transaction.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<&Expr, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => Ok(right),
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

/// A literal as text. Numbers keep their spelling (`5` → `"5"`); NULL is empty.
fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u64_expr(expr: &Expr) -> Result<u64, SqlError> {
    let raw = parse_text_expr(expr)?;
    raw.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad id {raw:?}: {e}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let raw = parse_text_expr(expr)?;
    Ulid::from_string(&raw).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
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
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
