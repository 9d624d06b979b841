use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tms_dashboard::auth::{AuthError, NewUser};
use tms_dashboard::config::AdminConfig;
use tms_dashboard::db::{AccessLevel, Backend};
use tms_dashboard::models::Role;
use tms_dashboard::money::format_brl;
use tms_dashboard::provision::{
    ProvisionReport, Provisioner, StepOutcome, business_categories, default_steps,
    seed_categories_step,
};
use tms_dashboard::storage::Storage;

#[derive(Parser)]
#[command(name = "tms-admin", about = "Administrative tasks for the TMS expense dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create tables, the receipts bucket and the default categories.
    Setup,
    /// Upsert the business categories.
    SeedCategories,
    /// List categories.
    Categories,
    /// Create users from a JSON file of {email, password, name, role}.
    CreateUsers { file: PathBuf },
    /// List auth users and their profiles.
    ListUsers,
    /// Check that the expenses table answers queries.
    Verify,
}

#[derive(Deserialize)]
struct UserEntry {
    email: String,
    password: String,
    name: String,
    role: Role,
}

fn print_report(report: &ProvisionReport) {
    for step in &report.steps {
        match &step.outcome {
            StepOutcome::Done { via } => println!("[ok]     {} ({via})", step.name),
            StepOutcome::Manual { .. } => println!("[manual] {}", step.name),
        }
        for line in &step.diagnostics {
            println!("         - {line}");
        }
    }
    let manual: Vec<&str> = report
        .pending()
        .filter_map(|step| match &step.outcome {
            StepOutcome::Manual { sql: Some(sql) } => Some(sql.as_str()),
            _ => None,
        })
        .collect();
    if !manual.is_empty() {
        println!();
        println!("Run the following SQL with administrator rights:");
        for sql in manual {
            println!("{}", sql.trim());
            println!();
        }
    }
}

fn create_users(backend: &Backend, file: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let entries: Vec<UserEntry> = serde_json::from_slice(&fs::read(file)?)?;
    let mut created = 0;
    for entry in entries {
        let new_user = NewUser {
            email: entry.email,
            password: entry.password,
            name: entry.name,
            role: entry.role,
        };
        match backend.create_user(&new_user) {
            Ok(user) => {
                created += 1;
                println!("created {} ({})", user.email, new_user.role.label());
            }
            Err(AuthError::AlreadyRegistered) => {
                warn!(email = %new_user.email, "user already registered, skipping");
            }
            Err(err) => return Err(err.into()),
        }
    }
    info!(created, "user import finished");
    Ok(())
}

fn run(cli: Cli, config: AdminConfig) -> Result<bool, Box<dyn std::error::Error>> {
    let backend = Backend::open(&config.database_path, config.access)?;
    let storage = Storage::new(&config.storage_root);
    if config.access == AccessLevel::Anon {
        warn!("no service role key; privileged steps will fall back");
    }

    match cli.command {
        Command::Setup => {
            fs::create_dir_all(storage.root())?;
            let report = Provisioner::new(&backend, &storage).run(&default_steps());
            print_report(&report);
            return Ok(report.is_complete());
        }
        Command::SeedCategories => {
            let report = Provisioner::new(&backend, &storage)
                .run(&[seed_categories_step(business_categories())]);
            print_report(&report);
            return Ok(report.is_complete());
        }
        Command::Categories => {
            for category in backend.list_categories()? {
                println!(
                    "{:>3}  {:<14} {}",
                    category.id,
                    category.name,
                    category.description.unwrap_or_default()
                );
            }
        }
        Command::CreateUsers { file } => create_users(&backend, &file)?,
        Command::ListUsers => {
            let profiles = backend.list_profiles()?;
            for user in backend.list_users()? {
                match profiles.iter().find(|profile| profile.id == user.id) {
                    Some(profile) => println!(
                        "{:>3}  {:<32} {:<24} {}",
                        user.id,
                        user.email,
                        profile.name,
                        profile.role.label()
                    ),
                    None => println!("{:>3}  {:<32} (no profile)", user.id, user.email),
                }
            }
        }
        Command::Verify => {
            let count = backend.count_rows("despesas")?;
            let total: i64 = backend
                .list_expenses()?
                .iter()
                .map(|expense| expense.valor_cents)
                .sum();
            println!("despesas: {count} rows, {}", format_brl(total));
        }
    }
    Ok(true)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config = match AdminConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            warn!("some steps need manual attention");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}
