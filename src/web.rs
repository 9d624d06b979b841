use std::fs;

use chrono::{Local, Utc};
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::form::Form;
use rocket::fs::{FileServer, TempFile};
use rocket::http::{ContentType, Cookie, CookieJar, SameSite, Status};
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::serde::Serialize;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::Template;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth_guard::{GuardDecision, GuardRegistry};
use crate::config::AppConfig;
use crate::db::{AccessLevel, Backend, BackendError, setup_sql};
use crate::form::{ExpenseInput, capitalize_words, creator_fallback, plan_installments, validate};
use crate::listing::{DashboardState, InstallmentState, MonthFilter, installment_schedule};
use crate::models::{Expense, PaymentMethod, User, UserProfile};
use crate::money::{format_brl, format_date, format_installments};
use crate::provision::{Provisioner, default_steps};
use crate::storage::{PendingUpload, RECEIPTS_BUCKET, Storage, StorageError};

const SESSION_COOKIE: &str = "session";
const CREATOR_COOKIE: &str = "tms_usuario";
const REDIRECT_COOKIE: &str = "last_auth_redirect";
const CLIENT_COOKIE: &str = "tms_client";

const MONTHS: [&str; 12] = [
    "Janeiro", "Fevereiro", "Março", "Abril", "Maio", "Junho", "Julho", "Agosto", "Setembro",
    "Outubro", "Novembro", "Dezembro",
];

pub struct AppState {
    pub backend: Backend,
    pub storage: Storage,
    pub config: AppConfig,
}

#[derive(Responder)]
enum Page {
    Template(Template),
    Redirect(Redirect),
    Flash(Flash<Redirect>),
}

struct SignedIn {
    user: User,
    profile: Option<UserProfile>,
}

impl SignedIn {
    fn display_name(&self) -> String {
        match &self.profile {
            Some(profile) => capitalize_words(&profile.name),
            None => self.user.email.clone(),
        }
    }
}

#[derive(FromForm)]
struct LoginForm {
    email: String,
    password: String,
}

#[derive(FromForm)]
struct ExpenseForm<'r> {
    item: String,
    valor: String,
    forma_pagamento: String,
    data_vencimento: String,
    category_id: Option<i64>,
    total_parcelas: Option<u32>,
    usuario_criacao: Option<String>,
    imagem: Option<TempFile<'r>>,
}

#[derive(Serialize)]
struct ExpenseRow {
    id: i64,
    item: String,
    category_name: String,
    valor: String,
    forma_pagamento: String,
    badge_class: &'static str,
    parcelas: String,
    vencimento: String,
    imagem_url: Option<String>,
    status: &'static str,
    paid: bool,
}

#[derive(Serialize)]
struct InstallmentRow {
    id: i64,
    numero: String,
    valor: String,
    vencimento: String,
    pagamento: Option<String>,
    status: &'static str,
    state: &'static str,
    pending: bool,
}

#[derive(Serialize)]
struct MonthOption {
    value: String,
    label: &'static str,
    selected: bool,
}

fn expense_row(expense: &Expense) -> ExpenseRow {
    ExpenseRow {
        id: expense.id,
        item: expense.item.clone(),
        category_name: expense
            .category_name
            .clone()
            .unwrap_or_else(|| "Sem categoria".to_string()),
        valor: format_brl(expense.valor_cents),
        forma_pagamento: expense.forma_pagamento.label().to_string(),
        badge_class: expense.forma_pagamento.badge_class(),
        parcelas: format_installments(expense.parcela_atual, expense.total_parcelas),
        vencimento: format_date(expense.data_vencimento),
        imagem_url: expense.imagem_url.clone(),
        status: expense.status.as_str(),
        paid: expense.is_paid(),
    }
}

fn installment_row(expense: &Expense, state: InstallmentState) -> InstallmentRow {
    InstallmentRow {
        id: expense.id,
        numero: format_installments(expense.parcela_atual, expense.total_parcelas),
        valor: format_brl(expense.valor_cents),
        vencimento: format_date(expense.data_vencimento),
        pagamento: expense
            .data_pagamento
            .map(|paid| format_date(paid.with_timezone(&Local).date_naive())),
        status: expense.status.as_str(),
        state: match state {
            InstallmentState::Paid => "paid",
            InstallmentState::Overdue => "overdue",
            InstallmentState::Current => "current",
        },
        pending: !expense.is_paid(),
    }
}

fn month_options(filter: &MonthFilter) -> Vec<MonthOption> {
    let selected = match filter {
        MonthFilter::All => 0,
        MonthFilter::MonthOfYear(month) | MonthFilter::YearMonth(_, month) => *month,
    };
    let mut options = vec![MonthOption {
        value: String::new(),
        label: "Todos os meses",
        selected: selected == 0,
    }];
    for (index, label) in MONTHS.into_iter().enumerate() {
        let month = index as u32 + 1;
        options.push(MonthOption {
            value: format!("{month:02}"),
            label,
            selected: selected == month,
        });
    }
    options
}

fn notice(flash: Option<FlashMessage<'_>>) -> Option<serde_json::Value> {
    flash.map(|flash| {
        serde_json::json!({
            "kind": flash.kind(),
            "message": flash.message(),
        })
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn plain_cookie(name: &'static str, value: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_path("/");
    cookie.set_same_site(SameSite::Lax);
    cookie
}

fn private_cookie(name: &'static str, value: String) -> Cookie<'static> {
    let mut cookie = plain_cookie(name, value);
    cookie.set_http_only(true);
    cookie
}

fn remove_cookie(cookies: &CookieJar<'_>, name: &'static str) {
    let mut cookie = Cookie::from(name);
    cookie.set_path("/");
    cookies.remove(cookie);
}

fn client_id(cookies: &CookieJar<'_>) -> String {
    if let Some(cookie) = cookies.get(CLIENT_COOKIE) {
        return cookie.value().to_string();
    }
    let id = Uuid::new_v4().to_string();
    cookies.add(private_cookie(CLIENT_COOKIE, id.clone()));
    id
}

fn last_redirect(cookies: &CookieJar<'_>) -> Option<i64> {
    cookies
        .get(REDIRECT_COOKIE)
        .and_then(|cookie| cookie.value().parse().ok())
}

fn remember_redirect(cookies: &CookieJar<'_>) {
    cookies.add(private_cookie(REDIRECT_COOKIE, now_ms().to_string()));
}

fn remembered_creator(cookies: &CookieJar<'_>) -> Option<String> {
    cookies
        .get(CREATOR_COOKIE)
        .map(|cookie| cookie.value().to_string())
}

fn setup_page() -> Page {
    Page::Template(Template::render(
        "setup",
        serde_json::json!({
            "sql": setup_sql(),
        }),
    ))
}

fn require_user(state: &AppState, cookies: &CookieJar<'_>) -> Result<SignedIn, Page> {
    if let Some(cookie) = cookies.get(SESSION_COOKIE) {
        match state.backend.current_user(cookie.value()) {
            Ok(Some(user)) => {
                let profile = state.backend.get_profile(user.id).unwrap_or_else(|err| {
                    warn!(error = %err, user_id = user.id, "profile lookup failed");
                    None
                });
                return Ok(SignedIn { user, profile });
            }
            Ok(None) => {}
            Err(crate::auth::AuthError::Backend(err)) if err.is_missing_table() => {
                return Err(setup_page());
            }
            Err(err) => warn!(error = %err, "session lookup failed"),
        }
    }
    remember_redirect(cookies);
    Err(Page::Redirect(Redirect::to("/login")))
}

fn render_login(error: Option<&str>, flash: Option<FlashMessage<'_>>) -> Template {
    Template::render(
        "login",
        serde_json::json!({
            "error": error,
            "notice": notice(flash),
        }),
    )
}

#[get("/login")]
fn login(
    state: &State<AppState>,
    guards: &State<GuardRegistry>,
    cookies: &CookieJar<'_>,
    flash: Option<FlashMessage<'_>>,
) -> Page {
    let client = client_id(cookies);
    match guards.try_begin(&client, now_ms(), last_redirect(cookies)) {
        GuardDecision::Proceed => {
            let token = cookies.get(SESSION_COOKIE).map(|cookie| cookie.value().to_string());
            if let Some(token) = token {
                if let Ok(Some(_)) = state.backend.current_user(&token) {
                    remember_redirect(cookies);
                    return Page::Redirect(Redirect::to("/"));
                }
            }
        }
        decision => debug!(?decision, "skipped existing-session check"),
    }
    Page::Template(render_login(None, flash))
}

#[post("/login", data = "<form>")]
fn login_post(state: &State<AppState>, cookies: &CookieJar<'_>, form: Form<LoginForm>) -> Page {
    let form = form.into_inner();
    if form.email.trim().is_empty() || form.password.is_empty() {
        return Page::Template(render_login(Some("Por favor, preencha todos os campos"), None));
    }

    let session = match state
        .backend
        .sign_in(&form.email, &form.password, state.config.max_sessions)
    {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "login failed");
            return Page::Template(render_login(Some(err.user_message()), None));
        }
    };

    let profile = match state.backend.get_profile(session.user.id) {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            warn!(email = %session.user.email, "signed in without a profile");
            if let Err(err) = state.backend.sign_out(&session.token) {
                warn!(error = %err, "sign-out after missing profile failed");
            }
            return Page::Template(render_login(
                Some("Usuário não autorizado. Entre em contato com o administrador"),
                None,
            ));
        }
        Err(err) => {
            error!(error = %err, "profile lookup failed");
            return Page::Template(render_login(Some("Erro ao fazer login"), None));
        }
    };

    cookies.add(private_cookie(SESSION_COOKIE, session.token));
    remove_cookie(cookies, REDIRECT_COOKIE);
    info!(email = %session.user.email, "signed in");
    Page::Flash(Flash::success(
        Redirect::to("/"),
        format!("Bem-vindo, {}!", capitalize_words(&profile.name)),
    ))
}

#[get("/logout")]
fn logout(state: &State<AppState>, cookies: &CookieJar<'_>) -> Page {
    if let Some(cookie) = cookies.get(SESSION_COOKIE) {
        if let Err(err) = state.backend.sign_out(cookie.value()) {
            error!(error = %err, "logout failed");
            return Page::Flash(Flash::error(Redirect::to("/"), "Erro ao fazer logout"));
        }
    }
    remove_cookie(cookies, SESSION_COOKIE);
    Page::Redirect(Redirect::to("/login"))
}

#[get("/?<month>")]
fn dashboard(
    state: &State<AppState>,
    cookies: &CookieJar<'_>,
    month: Option<String>,
    flash: Option<FlashMessage<'_>>,
) -> Page {
    let signed_in = match require_user(state, cookies) {
        Ok(signed_in) => signed_in,
        Err(page) => return page,
    };
    let features = state.config.features;
    let filter = MonthFilter::parse(month.as_deref().unwrap_or_default()).unwrap_or_default();

    let mut load_error = None;
    let expenses = match state.backend.list_expenses() {
        Ok(expenses) => expenses,
        Err(err) if err.is_missing_table() => return setup_page(),
        Err(err) => {
            error!(error = %err, code = err.code(), "loading expenses failed");
            load_error = Some(format!("Erro ao carregar despesas: {err}"));
            Vec::new()
        }
    };
    let categories = if features.categories {
        state.backend.list_categories().unwrap_or_else(|err| {
            warn!(error = %err, "loading categories failed");
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let app = DashboardState::new(expenses, filter);
    let listing = app.listing();
    let rows: Vec<ExpenseRow> = listing.rows.iter().map(|expense| expense_row(expense)).collect();
    let methods: Vec<&str> = PaymentMethod::ALL.iter().map(|method| method.label()).collect();
    let installment_methods: Vec<&str> = PaymentMethod::ALL
        .iter()
        .filter(|method| method.allows_installments())
        .map(|method| method.label())
        .collect();
    let creator = creator_fallback(
        signed_in.profile.as_ref().map(|profile| profile.name.as_str()),
        remembered_creator(cookies).as_deref(),
    );

    let context = serde_json::json!({
        "user": {
            "name": signed_in.display_name(),
            "role": signed_in.profile.as_ref().map(|profile| profile.role.label()),
        },
        "notice": notice(flash),
        "load_error": load_error,
        "filter": app.filter.key(),
        "months": month_options(&app.filter),
        "expenses": rows,
        "summary": {
            "total": format_brl(listing.total_cents),
            "count": listing.count,
            "pending": format_brl(listing.pending_cents),
            "paid": format_brl(listing.paid_cents),
        },
        "categories": categories,
        "methods": methods,
        "installment_methods": installment_methods,
        "features": features,
        "creator": creator,
        "today": Local::now().date_naive().format("%Y-%m-%d").to_string(),
    });
    Page::Template(Template::render("dashboard", &context))
}

async fn store_receipt(storage: &Storage, mut file: TempFile<'_>) -> Result<PendingUpload, StorageError> {
    let content_type = file
        .content_type()
        .map(|content_type| format!("{}/{}", content_type.top(), content_type.sub()));
    let file_name = file
        .raw_name()
        .map(|raw| raw.dangerous_unsafe_unsanitized_raw().as_str().to_string());
    let upload = storage.prepare_upload(
        RECEIPTS_BUCKET,
        file_name.as_deref(),
        content_type.as_deref(),
        file.len(),
        now_ms(),
    )?;
    file.move_copy_to(&upload.path).await?;
    Ok(upload)
}

#[post("/expenses", data = "<form>")]
async fn add_expense(
    state: &State<AppState>,
    cookies: &CookieJar<'_>,
    form: Form<ExpenseForm<'_>>,
) -> Page {
    let signed_in = match require_user(state, cookies) {
        Ok(signed_in) => signed_in,
        Err(page) => return page,
    };
    let mut form = form.into_inner();
    let receipt = form.imagem.take().filter(|file| file.len() > 0);
    let input = ExpenseInput {
        item: form.item,
        valor: form.valor,
        forma_pagamento: form.forma_pagamento,
        data_vencimento: form.data_vencimento,
        category_id: form.category_id,
        total_parcelas: form.total_parcelas,
        usuario_criacao: form.usuario_criacao,
        has_receipt: receipt.is_some(),
    };
    let fallback = creator_fallback(
        signed_in.profile.as_ref().map(|profile| profile.name.as_str()),
        remembered_creator(cookies).as_deref(),
    );

    let valid = match validate(&input, &state.config.features, &fallback) {
        Ok(valid) => valid,
        Err(err) => return Page::Flash(Flash::error(Redirect::to("/"), err.to_string())),
    };

    let upload = match receipt {
        Some(file) => match store_receipt(&state.storage, file).await {
            Ok(upload) => Some(upload),
            Err(err) => {
                error!(error = %err, "receipt upload failed");
                return Page::Flash(Flash::error(Redirect::to("/"), "Erro ao fazer upload da imagem"));
            }
        },
        None => None,
    };

    let imagem_url = upload.as_ref().map(|upload| upload.public_url.clone());
    let inserted = plan_installments(&valid, imagem_url, Some(signed_in.user.id))
        .map_err(|err| err.to_string())
        .and_then(|planned| {
            state
                .backend
                .insert_expenses(&planned)
                .map_err(|err: BackendError| {
                    error!(error = %err, code = err.code(), "saving expense failed");
                    format!("Erro ao salvar despesa: {err}")
                })
        });

    match inserted {
        Ok(ids) => {
            info!(?ids, item = %valid.item, by = %signed_in.user.email, "expense created");
            cookies.add(plain_cookie(CREATOR_COOKIE, valid.usuario_criacao));
            Page::Flash(Flash::success(Redirect::to("/"), "Despesa adicionada com sucesso!"))
        }
        Err(message) => {
            if let Some(upload) = upload {
                if let Err(err) = fs::remove_file(&upload.path) {
                    warn!(error = %err, path = %upload.path.display(), "orphaned receipt left behind");
                }
            }
            Page::Flash(Flash::error(Redirect::to("/"), message))
        }
    }
}

#[post("/expenses/<id>/pay")]
fn pay_expense(state: &State<AppState>, cookies: &CookieJar<'_>, id: i64) -> Page {
    let signed_in = match require_user(state, cookies) {
        Ok(signed_in) => signed_in,
        Err(page) => return page,
    };
    match state.backend.mark_paid(id, Utc::now()) {
        Ok(true) => {
            info!(id, by = %signed_in.user.email, "expense marked as paid");
            Page::Flash(Flash::success(Redirect::to("/"), "Despesa marcada como paga!"))
        }
        Ok(false) => Page::Flash(Flash::new(Redirect::to("/"), "info", "Despesa já estava paga")),
        Err(err) => {
            error!(error = %err, id, "marking expense as paid failed");
            Page::Flash(Flash::error(Redirect::to("/"), "Erro ao marcar despesa como paga"))
        }
    }
}

#[get("/expenses/<id>")]
fn expense_details(
    state: &State<AppState>,
    cookies: &CookieJar<'_>,
    id: i64,
    flash: Option<FlashMessage<'_>>,
) -> Page {
    let signed_in = match require_user(state, cookies) {
        Ok(signed_in) => signed_in,
        Err(page) => return page,
    };
    let not_found = || Page::Flash(Flash::error(Redirect::to("/"), "Despesa não encontrada"));
    let chain = match state.backend.installment_chain(id) {
        Ok(chain) => chain,
        Err(BackendError::NotFound) => return not_found(),
        Err(err) => {
            error!(error = %err, id, "loading expense details failed");
            return Page::Flash(Flash::error(
                Redirect::to("/"),
                "Erro ao carregar detalhes da despesa",
            ));
        }
    };
    let Some(expense) = chain.iter().find(|expense| expense.id == id) else {
        return not_found();
    };

    let schedule = installment_schedule(&chain, Local::now().date_naive());
    let installments: Vec<InstallmentRow> = schedule
        .entries
        .iter()
        .map(|(expense, state)| installment_row(expense, *state))
        .collect();

    let context = serde_json::json!({
        "user": { "name": signed_in.display_name() },
        "notice": notice(flash),
        "expense": expense_row(expense),
        "creator": capitalize_words(&expense.usuario_criacao),
        "total_parcelas": expense.total_parcelas,
        "valor_total": format_brl(expense.valor_total_cents),
        "paid_count": schedule.paid,
        "pending_count": schedule.pending,
        "installments": installments,
        "show_schedule": expense.is_installment(),
    });
    Page::Template(Template::render("details", &context))
}

#[get("/profile")]
fn profile(state: &State<AppState>, cookies: &CookieJar<'_>) -> Page {
    let signed_in = match require_user(state, cookies) {
        Ok(signed_in) => signed_in,
        Err(page) => return page,
    };
    let Some(profile) = signed_in.profile.as_ref() else {
        return Page::Flash(Flash::error(Redirect::to("/"), "Erro ao carregar perfil do usuário"));
    };

    let expenses = if profile.role.sees_all_expenses() {
        state.backend.list_expenses()
    } else {
        state.backend.list_expenses_by_creator(signed_in.user.id)
    };
    let expenses = match expenses {
        Ok(expenses) => expenses,
        Err(err) if err.is_missing_table() => return setup_page(),
        Err(err) => {
            error!(error = %err, "loading profile statistics failed");
            Vec::new()
        }
    };
    let app = DashboardState::new(expenses, MonthFilter::All);
    let listing = app.listing();
    let paid = listing.rows.iter().filter(|expense| expense.is_paid()).count();
    let admin = profile.role.sees_all_expenses();

    let context = serde_json::json!({
        "user": { "name": signed_in.display_name() },
        "profile": {
            "name": capitalize_words(&profile.name),
            "email": profile.email,
            "role": profile.role.as_str(),
            "role_label": profile.role.label(),
            "since": format_date(profile.created_at.with_timezone(&Local).date_naive()),
        },
        "stats": {
            "count": listing.count,
            "total": format_brl(listing.total_cents),
            "paid": paid,
            "pending": listing.count - paid,
        },
        "permissions": {
            "view_all": admin,
            "create": true,
            "pay": true,
            "edit": admin,
            "delete": admin,
        },
    });
    Page::Template(Template::render("profile", &context))
}

#[get("/health")]
fn health(state: &State<AppState>) -> (Status, (ContentType, String)) {
    let (status, body) = match state.backend.count_rows("despesas") {
        Ok(count) => (Status::Ok, serde_json::json!({ "status": "ok", "expenses": count })),
        Err(err) => {
            error!(error = %err, "backend connection check failed");
            (
                Status::ServiceUnavailable,
                serde_json::json!({ "status": "error", "code": err.code(), "message": err.to_string() }),
            )
        }
    };
    (status, (ContentType::JSON, body.to_string()))
}

async fn init_backend(rocket: Rocket<Build>) -> Result<Rocket<Build>, Rocket<Build>> {
    let config: AppConfig = match rocket.figment().extract() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return Err(rocket);
        }
    };

    if let Some(dir) = config.database_path.parent() {
        if let Err(err) = fs::create_dir_all(dir) {
            error!(error = %err, path = %dir.display(), "cannot create data directory");
            return Err(rocket);
        }
    }
    if let Err(err) = fs::create_dir_all(&config.storage_root) {
        error!(error = %err, path = %config.storage_root.display(), "cannot create storage root");
        return Err(rocket);
    }

    let backend = match Backend::open(&config.database_path, AccessLevel::Anon) {
        Ok(backend) => backend,
        Err(err) => {
            error!(error = %err, path = %config.database_path.display(), "cannot open database");
            return Err(rocket);
        }
    };
    let storage = Storage::new(&config.storage_root);

    if config.auto_provision {
        let admin = backend.with_access(AccessLevel::ServiceRole);
        let report = Provisioner::new(&admin, &storage).run(&default_steps());
        for step in report.pending() {
            warn!(step = step.name, "setup step needs manual attention");
        }
    }

    info!(
        database = %config.database_path.display(),
        storage = %config.storage_root.display(),
        features = ?config.features,
        "backend ready"
    );
    let storage_root = config.storage_root.clone();
    Ok(rocket
        .manage(AppState {
            backend,
            storage,
            config,
        })
        .mount("/storage", FileServer::from(storage_root)))
}

pub fn build() -> Rocket<Build> {
    build_with(rocket::Config::figment())
}

pub fn build_with(figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(AdHoc::try_on_ignite("TMS backend", init_backend))
        .manage(GuardRegistry::new())
        .mount(
            "/",
            routes![
                login,
                login_post,
                logout,
                dashboard,
                add_expense,
                pay_expense,
                expense_details,
                profile,
                health
            ],
        )
        .mount("/static", FileServer::from("static"))
        .attach(Template::fairing())
}
