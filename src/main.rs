use rocket::{Build, Rocket};
use tracing_subscriber::EnvFilter;

#[rocket::launch]
fn rocket() -> Rocket<Build> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tms_dashboard::web::build()
}
