use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use thiserror::Error;

use crate::models::{Category, Expense, NewCategory, NewExpense, Role, UserProfile};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Postgres-style code for "relation does not exist".
pub const MISSING_TABLE_CODE: &str = "42P01";

pub const CATEGORIES_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    color TEXT DEFAULT '#007bff',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

pub const EXPENSES_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS despesas (
    id INTEGER PRIMARY KEY,
    usuario_criacao TEXT NOT NULL,
    created_by INTEGER,
    item TEXT NOT NULL,
    valor_cents INTEGER NOT NULL CHECK(valor_cents > 0),
    forma_pagamento TEXT NOT NULL,
    data_vencimento TEXT NOT NULL,
    parcela_atual INTEGER NOT NULL DEFAULT 1,
    total_parcelas INTEGER NOT NULL DEFAULT 1,
    valor_total_cents INTEGER NOT NULL,
    despesa_pai_id INTEGER REFERENCES despesas(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pendente' CHECK(status IN ('pendente', 'pago')),
    imagem_url TEXT,
    created_at TEXT NOT NULL,
    data_pagamento TEXT,
    CHECK(parcela_atual BETWEEN 1 AND total_parcelas)
);
";

pub const CATEGORY_COLUMN_SQL: &str =
    "ALTER TABLE despesas ADD COLUMN category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL;";

pub const PROFILES_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS user_profiles (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('admin', 'gerente')),
    created_at TEXT NOT NULL
);
";

pub const AUTH_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    token TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
);
";

/// Every statement needed for a fresh database, in order. Shown to the user
/// when the dashboard finds the schema missing.
pub fn setup_sql() -> String {
    [
        CATEGORIES_TABLE_SQL.trim(),
        EXPENSES_TABLE_SQL.trim(),
        CATEGORY_COLUMN_SQL,
        PROFILES_TABLE_SQL.trim(),
        AUTH_TABLES_SQL.trim(),
    ]
    .join("\n\n")
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("relation \"{0}\" does not exist")]
    MissingTable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("duplicate key value violates unique constraint: {0}")]
    Conflict(String),
    #[error("row not found")]
    NotFound,
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database: {0}")]
    Sqlite(rusqlite::Error),
}

impl BackendError {
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::MissingTable(_) => MISSING_TABLE_CODE,
            BackendError::PermissionDenied(_) => "42501",
            BackendError::Conflict(_) => "23505",
            BackendError::NotFound => "PGRST116",
            BackendError::Pool(_) => "08006",
            BackendError::Sqlite(_) => "XX000",
        }
    }

    pub fn is_missing_table(&self) -> bool {
        matches!(self, BackendError::MissingTable(_))
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if let Some(rest) = message.split("no such table: ").nth(1) {
            let table = rest
                .split(|ch: char| !(ch.is_alphanumeric() || ch == '_' || ch == '.'))
                .next()
                .unwrap_or_default();
            return BackendError::MissingTable(table.to_string());
        }
        if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) && message.contains("UNIQUE") {
            return BackendError::Conflict(message);
        }
        BackendError::Sqlite(err)
    }
}

/// Who the caller is. Schema changes and user administration need the
/// service role; the web app runs as anon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Anon,
    ServiceRole,
}

#[derive(Clone)]
pub struct Backend {
    pool: DbPool,
    access: AccessLevel,
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

impl Backend {
    pub fn open(path: &Path, access: AccessLevel) -> Result<Backend, BackendError> {
        let manager = SqliteConnectionManager::file(path).with_init(init_connection);
        let pool = Pool::new(manager)?;
        Ok(Backend { pool, access })
    }

    /// Private in-memory database; a single connection so every call sees
    /// the same data.
    #[cfg(test)]
    pub(crate) fn in_memory(access: AccessLevel) -> Backend {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("in-memory pool");
        Backend { pool, access }
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn with_access(&self, access: AccessLevel) -> Backend {
        Backend {
            pool: self.pool.clone(),
            access,
        }
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, BackendError> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn require_service_role(&self, action: &str) -> Result<(), BackendError> {
        if self.access == AccessLevel::ServiceRole {
            Ok(())
        } else {
            Err(BackendError::PermissionDenied(format!("{action} requires the service role")))
        }
    }

    /// Raw SQL execution, service role only.
    pub fn exec_sql(&self, sql: &str) -> Result<(), BackendError> {
        self.require_service_role("exec_sql")?;
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, BackendError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .map(|value| value == 1)
        .map_err(BackendError::from)
    }

    /// Adds a column unless it is already there. Service role only.
    pub fn ensure_column(&self, table: &str, column: &str, alter_sql: &str) -> Result<bool, BackendError> {
        self.require_service_role("ensure_column")?;
        if !self.table_exists(table)? {
            return Err(BackendError::MissingTable(table.to_string()));
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for row in rows {
            if row? == column {
                return Ok(false);
            }
        }
        conn.execute_batch(alter_sql)?;
        Ok(true)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64, BackendError> {
        let conn = self.conn()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn list_expenses(&self) -> Result<Vec<Expense>, BackendError> {
        self.query_expenses("ORDER BY d.created_at DESC, d.id DESC", params![])
    }

    pub fn list_expenses_by_creator(&self, user_id: i64) -> Result<Vec<Expense>, BackendError> {
        self.query_expenses(
            "WHERE d.created_by = ?1 ORDER BY d.created_at DESC, d.id DESC",
            params![user_id],
        )
    }

    pub fn get_expense(&self, id: i64) -> Result<Expense, BackendError> {
        self.query_expenses("WHERE d.id = ?1", params![id])?
            .into_iter()
            .next()
            .ok_or(BackendError::NotFound)
    }

    /// The whole chain the expense belongs to, ordered by installment number.
    pub fn installment_chain(&self, id: i64) -> Result<Vec<Expense>, BackendError> {
        let root = self.get_expense(id)?.chain_root();
        self.query_expenses(
            "WHERE d.id = ?1 OR d.despesa_pai_id = ?1 ORDER BY d.parcela_atual, d.id",
            params![root],
        )
    }

    fn query_expenses(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Expense>, BackendError> {
        let conn = self.conn()?;
        let sql = format!(
            "
            SELECT d.id, d.item, d.valor_cents, d.forma_pagamento, d.data_vencimento, d.status,
                   d.category_id, c.name, d.imagem_url, d.parcela_atual, d.total_parcelas,
                   d.valor_total_cents, d.despesa_pai_id, d.usuario_criacao, d.created_by,
                   d.created_at, d.data_pagamento
            FROM despesas d
            LEFT JOIN categories c ON d.category_id = c.id
            {clause}
            "
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, expense_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Inserts an installment plan in one transaction. Every record after the
    /// first points at the first as its parent. Returns the new ids in order.
    pub fn insert_expenses(&self, planned: &[NewExpense]) -> Result<Vec<i64>, BackendError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(planned.len());
        let mut parent: Option<i64> = None;
        for expense in planned {
            tx.execute(
                "
                INSERT INTO despesas (
                    usuario_criacao, created_by, item, valor_cents, forma_pagamento,
                    data_vencimento, category_id, parcela_atual, total_parcelas,
                    valor_total_cents, despesa_pai_id, status, imagem_url, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'pendente', ?12, ?13)
                ",
                params![
                    expense.usuario_criacao,
                    expense.created_by,
                    expense.item,
                    expense.valor_cents,
                    expense.forma_pagamento.label(),
                    expense.data_vencimento,
                    expense.category_id,
                    expense.parcela_atual,
                    expense.total_parcelas,
                    expense.valor_total_cents,
                    parent,
                    expense.imagem_url,
                    created_at,
                ],
            )?;
            let id = tx.last_insert_rowid();
            parent.get_or_insert(id);
            ids.push(id);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Flips a pending expense to paid. Paying an already paid expense is a
    /// no-op and returns `false`.
    pub fn mark_paid(&self, id: i64, paid_at: DateTime<Utc>) -> Result<bool, BackendError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE despesas SET status = 'pago', data_pagamento = ?2 WHERE id = ?1 AND status = 'pendente'",
            params![id, paid_at],
        )?;
        drop(conn);
        if changed == 0 {
            // Distinguish "already paid" from "no such row".
            self.get_expense(id)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Inserts a throwaway expense using only the base columns, then rolls
    /// back. Succeeds when `despesas` exists and accepts ordinary writes.
    pub fn probe_expense_insert(&self) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "
            INSERT INTO despesas (
                usuario_criacao, item, valor_cents, forma_pagamento, data_vencimento,
                parcela_atual, total_parcelas, valor_total_cents, status, created_at
            )
            VALUES ('setup', '__tms_setup_probe__', 100, 'PIX', ?1, 1, 1, 100, 'pendente', ?2)
            ",
            params![now.date_naive(), now],
        )?;
        tx.rollback()?;
        Ok(())
    }

    pub fn list_categories(&self) -> Result<Vec<Category>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, name, description, color
            FROM categories
            ORDER BY name
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                color: row.get(3)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert-or-update keyed on the unique category name. Fields left as
    /// `None` keep their stored value on update.
    pub fn upsert_category(&self, category: &NewCategory) -> Result<i64, BackendError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO categories (name, description, color)
            VALUES (?1, ?2, COALESCE(?3, '#007bff'))
            ON CONFLICT(name) DO UPDATE SET
                description = COALESCE(excluded.description, categories.description),
                color = COALESCE(?3, categories.color)
            ",
            params![category.name, category.description, category.color],
        )?;
        let id = conn.query_row(
            "SELECT id FROM categories WHERE name = ?1",
            params![category.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn delete_category(&self, name: &str) -> Result<usize, BackendError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM categories WHERE name = ?1", params![name])?)
    }

    pub fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>, BackendError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                "SELECT id, email, name, role, created_at FROM user_profiles WHERE id = ?1",
                params![user_id],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn upsert_profile(&self, id: i64, email: &str, name: &str, role: Role) -> Result<(), BackendError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO user_profiles (id, email, name, role, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                role = excluded.role
            ",
            params![id, email, name, role.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    pub fn list_profiles(&self) -> Result<Vec<UserProfile>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, name, role, created_at FROM user_profiles ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], profile_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn text_column_error(index: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected value {value:?}").into(),
    )
}

fn expense_from_row(row: &Row<'_>) -> rusqlite::Result<Expense> {
    let forma: String = row.get(3)?;
    let status: String = row.get(5)?;
    let data_vencimento: NaiveDate = row.get(4)?;
    Ok(Expense {
        id: row.get(0)?,
        item: row.get(1)?,
        valor_cents: row.get(2)?,
        forma_pagamento: forma.parse().map_err(|_| text_column_error(3, &forma))?,
        data_vencimento,
        status: status.parse().map_err(|_| text_column_error(5, &status))?,
        category_id: row.get(6)?,
        category_name: row.get(7)?,
        imagem_url: row.get(8)?,
        parcela_atual: row.get(9)?,
        total_parcelas: row.get(10)?,
        valor_total_cents: row.get(11)?,
        despesa_pai_id: row.get(12)?,
        usuario_criacao: row.get(13)?,
        created_by: row.get(14)?,
        created_at: row.get(15)?,
        data_pagamento: row.get(16)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let role: String = row.get(3)?;
    Ok(UserProfile {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: role.parse().map_err(|_| text_column_error(3, &role))?,
        created_at: row.get(4)?,
    })
}
