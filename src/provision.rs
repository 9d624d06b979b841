//! Idempotent bootstrap of the backend: tables, the receipts bucket and the
//! seed categories.
//!
//! A plan is an ordered list of [`Step`]s. Each step lists the attempts to
//! make, preferred first: usually privileged SQL, then an ordinary data call
//! that only succeeds if the effect is already in place. When every attempt
//! fails the step is reported as manual, with the SQL a human should run.
//! Steps never roll back; a report can be partially complete.

use thiserror::Error;
use tracing::{info, warn};

use crate::db::{
    AUTH_TABLES_SQL, Backend, BackendError, CATEGORIES_TABLE_SQL, CATEGORY_COLUMN_SQL,
    EXPENSES_TABLE_SQL, PROFILES_TABLE_SQL,
};
use crate::models::NewCategory;
use crate::storage::{BucketOptions, RECEIPTS_BUCKET, Storage, StorageError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub enum Attempt {
    /// Privileged statement batch.
    ExecSql(&'static str),
    /// Privileged column addition, skipped when the column exists.
    EnsureColumn {
        table: &'static str,
        column: &'static str,
        sql: &'static str,
    },
    /// Ordinary read confirming the table is there.
    ProbeTable(&'static str),
    /// Ordinary insert of a throwaway expense, rolled back.
    ProbeExpenseInsert,
    CreateBucket {
        name: &'static str,
        options: BucketOptions,
    },
    UpsertCategories(Vec<NewCategory>),
}

impl Attempt {
    pub fn describe(&self) -> String {
        match self {
            Attempt::ExecSql(_) => "exec_sql".to_string(),
            Attempt::EnsureColumn { table, column, .. } => format!("add column {table}.{column}"),
            Attempt::ProbeTable(table) => format!("probe {table}"),
            Attempt::ProbeExpenseInsert => "probe insert into despesas".to_string(),
            Attempt::CreateBucket { name, .. } => format!("create bucket {name}"),
            Attempt::UpsertCategories(categories) => format!("upsert {} categories", categories.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: &'static str,
    pub attempts: Vec<Attempt>,
    pub manual_sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done { via: String },
    Manual { sql: Option<String> },
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: &'static str,
    pub outcome: StepOutcome,
    pub diagnostics: Vec<String>,
}

impl StepReport {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, StepOutcome::Done { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    pub steps: Vec<StepReport>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(StepReport::is_done)
    }

    pub fn pending(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|step| !step.is_done())
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Categories used by the business, seeded on first setup.
pub fn business_categories() -> Vec<NewCategory> {
    [
        ("Aluguel de ferramentas", "Locação de equipamentos e ferramentas"),
        ("Manutenção em veículo", "Manutenção, combustível e reparos de veículos"),
        ("Mão de Obra", "Serviços de mão de obra terceirizada"),
        ("Material", "Materiais de construção e insumos"),
        ("Pagamento funcionários", "Salários, benefícios e encargos trabalhistas"),
        ("Prestador de serviços", "Contratação de prestadores de serviços especializados"),
    ]
    .into_iter()
    .map(|(name, description)| NewCategory {
        name: name.to_string(),
        description: Some(description.to_string()),
        color: None,
    })
    .collect()
}

fn seed_sql(categories: &[NewCategory]) -> String {
    let quote = |value: &str| format!("'{}'", value.replace('\'', "''"));
    categories
        .iter()
        .map(|category| {
            format!(
                "INSERT INTO categories (name, description) VALUES ({}, {}) ON CONFLICT(name) DO NOTHING;",
                quote(&category.name),
                category
                    .description
                    .as_deref()
                    .map(quote)
                    .unwrap_or_else(|| "NULL".to_string()),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn table_step(name: &'static str, table: &'static str, sql: &'static str) -> Step {
    Step {
        name,
        attempts: vec![Attempt::ExecSql(sql), Attempt::ProbeTable(table)],
        manual_sql: Some(sql.trim().to_string()),
    }
}

/// The full bootstrap, in dependency order.
pub fn default_steps() -> Vec<Step> {
    let categories = business_categories();
    vec![
        table_step("categories table", "categories", CATEGORIES_TABLE_SQL),
        Step {
            name: "expenses table",
            attempts: vec![Attempt::ExecSql(EXPENSES_TABLE_SQL), Attempt::ProbeExpenseInsert],
            manual_sql: Some(EXPENSES_TABLE_SQL.trim().to_string()),
        },
        Step {
            name: "expense category column",
            attempts: vec![Attempt::EnsureColumn {
                table: "despesas",
                column: "category_id",
                sql: CATEGORY_COLUMN_SQL,
            }],
            manual_sql: Some(CATEGORY_COLUMN_SQL.to_string()),
        },
        table_step("user profiles table", "user_profiles", PROFILES_TABLE_SQL),
        table_step("auth tables", "users", AUTH_TABLES_SQL),
        Step {
            name: "receipts bucket",
            attempts: vec![Attempt::CreateBucket {
                name: RECEIPTS_BUCKET,
                options: BucketOptions::receipts(),
            }],
            manual_sql: None,
        },
        seed_categories_step(categories),
    ]
}

pub fn seed_categories_step(categories: Vec<NewCategory>) -> Step {
    Step {
        name: "seed categories",
        manual_sql: Some(seed_sql(&categories)),
        attempts: vec![Attempt::UpsertCategories(categories)],
    }
}

pub struct Provisioner<'a> {
    backend: &'a Backend,
    storage: &'a Storage,
}

impl<'a> Provisioner<'a> {
    pub fn new(backend: &'a Backend, storage: &'a Storage) -> Self {
        Provisioner { backend, storage }
    }

    /// Runs every step in order. A failed step does not stop the ones after it.
    pub fn run(&self, steps: &[Step]) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        for step in steps {
            report.steps.push(self.run_step(step));
        }
        report
    }

    fn run_step(&self, step: &Step) -> StepReport {
        let mut diagnostics = Vec::new();
        for attempt in &step.attempts {
            let label = attempt.describe();
            match self.run_attempt(attempt) {
                Ok(detail) => {
                    info!(step = step.name, via = %label, "{detail}");
                    diagnostics.push(format!("{label}: {detail}"));
                    return StepReport {
                        name: step.name,
                        outcome: StepOutcome::Done { via: label },
                        diagnostics,
                    };
                }
                Err(err) => {
                    warn!(step = step.name, via = %label, error = %err, "attempt failed");
                    diagnostics.push(format!("{label}: {err}"));
                }
            }
        }
        warn!(step = step.name, "needs manual remediation");
        StepReport {
            name: step.name,
            outcome: StepOutcome::Manual {
                sql: step.manual_sql.clone(),
            },
            diagnostics,
        }
    }

    fn run_attempt(&self, attempt: &Attempt) -> Result<String, ProvisionError> {
        match attempt {
            Attempt::ExecSql(sql) => {
                self.backend.exec_sql(sql)?;
                Ok("executed".to_string())
            }
            Attempt::EnsureColumn { table, column, sql } => {
                let added = self.backend.ensure_column(table, column, sql)?;
                Ok(if added { "added" } else { "already present" }.to_string())
            }
            Attempt::ProbeTable(table) => {
                let rows = self.backend.count_rows(table)?;
                Ok(format!("table exists with {rows} rows"))
            }
            Attempt::ProbeExpenseInsert => {
                self.backend.probe_expense_insert()?;
                Ok("table accepts inserts".to_string())
            }
            Attempt::CreateBucket { name, options } => {
                let created = self.storage.create_bucket(name, options)?;
                Ok(if created { "created" } else { "already exists" }.to_string())
            }
            Attempt::UpsertCategories(categories) => {
                let mut failures = Vec::new();
                for category in categories {
                    if let Err(err) = self.backend.upsert_category(category) {
                        warn!(category = %category.name, error = %err, "category upsert failed");
                        failures.push(err);
                    }
                }
                match failures.into_iter().next() {
                    Some(first) => Err(first.into()),
                    None => Ok(format!("{} categories ready", categories.len())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AccessLevel;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        (dir, storage)
    }

    #[test]
    fn service_role_provisions_everything_via_sql() {
        let backend = Backend::in_memory(AccessLevel::ServiceRole);
        let (_dir, storage) = storage();
        let report = Provisioner::new(&backend, &storage).run(&default_steps());

        assert!(report.is_complete(), "{report:#?}");
        assert_eq!(
            report.step("categories table").unwrap().outcome,
            StepOutcome::Done { via: "exec_sql".to_string() }
        );
        assert_eq!(backend.list_categories().unwrap().len(), 6);
        assert_eq!(backend.count_rows("despesas").unwrap(), 0);
        assert!(storage.bucket(RECEIPTS_BUCKET).is_ok());
    }

    #[test]
    fn running_twice_is_harmless() {
        let backend = Backend::in_memory(AccessLevel::ServiceRole);
        let (_dir, storage) = storage();
        let provisioner = Provisioner::new(&backend, &storage);
        provisioner.run(&default_steps());
        let second = provisioner.run(&default_steps());
        assert!(second.is_complete(), "{second:#?}");
        assert_eq!(backend.list_categories().unwrap().len(), 6);
    }

    #[test]
    fn anon_falls_back_to_probes_when_schema_exists() {
        let admin = Backend::in_memory(AccessLevel::ServiceRole);
        let (_dir, storage) = storage();
        Provisioner::new(&admin, &storage).run(&default_steps());

        let anon = admin.with_access(AccessLevel::Anon);
        let report = Provisioner::new(&anon, &storage).run(&default_steps());
        let expenses = report.step("expenses table").unwrap();
        assert_eq!(
            expenses.outcome,
            StepOutcome::Done { via: "probe insert into despesas".to_string() }
        );
        assert_eq!(expenses.diagnostics.len(), 2);
        assert_eq!(anon.count_rows("despesas").unwrap(), 0);

        // The column step has no unprivileged alternative.
        assert!(!report.step("expense category column").unwrap().is_done());
    }

    #[test]
    fn reseeding_keeps_custom_category_colors() {
        let backend = Backend::in_memory(AccessLevel::ServiceRole);
        let (_dir, storage) = storage();
        let provisioner = Provisioner::new(&backend, &storage);
        provisioner.run(&default_steps());

        backend
            .upsert_category(&NewCategory {
                name: "Material".to_string(),
                description: None,
                color: Some("#ff0000".to_string()),
            })
            .unwrap();
        let report = provisioner.run(&[seed_categories_step(business_categories())]);
        assert!(report.is_complete(), "{report:#?}");

        let material = backend
            .list_categories()
            .unwrap()
            .into_iter()
            .find(|category| category.name == "Material")
            .unwrap();
        assert_eq!(material.color.as_deref(), Some("#ff0000"));
        assert!(material.description.is_some());
    }

    #[test]
    fn anon_insert_check_passes_before_category_column_exists() {
        let admin = Backend::in_memory(AccessLevel::ServiceRole);
        admin.exec_sql(CATEGORIES_TABLE_SQL).unwrap();
        admin.exec_sql(EXPENSES_TABLE_SQL).unwrap();
        let (_dir, storage) = storage();

        let anon = admin.with_access(AccessLevel::Anon);
        let report = Provisioner::new(&anon, &storage).run(&default_steps());
        assert_eq!(
            report.step("expenses table").unwrap().outcome,
            StepOutcome::Done { via: "probe insert into despesas".to_string() }
        );
        assert_eq!(anon.count_rows("despesas").unwrap(), 0);
        match &report.step("expense category column").unwrap().outcome {
            StepOutcome::Manual { sql: Some(sql) } => assert!(sql.contains("category_id")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn anon_on_empty_database_ends_with_manual_sql() {
        let backend = Backend::in_memory(AccessLevel::Anon);
        let (_dir, storage) = storage();
        let report = Provisioner::new(&backend, &storage).run(&default_steps());

        assert!(!report.is_complete());
        let categories = report.step("categories table").unwrap();
        match &categories.outcome {
            StepOutcome::Manual { sql: Some(sql) } => assert!(sql.contains("CREATE TABLE")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(categories.diagnostics[0].contains("permission denied"));
        assert!(categories.diagnostics[1].contains("does not exist"));

        // Steps that need no SQL still complete.
        assert!(report.step("receipts bucket").unwrap().is_done());
        let seed = report.step("seed categories").unwrap();
        match &seed.outcome {
            StepOutcome::Manual { sql: Some(sql) } => assert!(sql.contains("'Mão de Obra'")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
