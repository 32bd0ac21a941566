//! Minimal tsu example: JSON endpoints, a guarded group, and the admin
//! control plane sharing one drain with the app.
//!
//! Run with:
//!   cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d 'name=alice'
//!   curl http://localhost:3000/internal/stats -H 'x-token: secret'
//!   curl http://localhost:3000/nowhere
//!
//!   curl http://localhost:9090/admin/show_log_level
//!   curl -X POST http://localhost:9090/admin/set_log_level -d 'name=app&level=debug'
//!   curl http://localhost:9090/admin/gracefulexit

use http::StatusCode;
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tsu::admin::{AdminServer, LoggerInfo, TargetsControl};
use tsu::{BoxFuture, Config, Context, Drain, Engine, Server};

#[tokio::main]
async fn main() -> Result<(), tsu::Error> {
    let (filter, control) = TargetsControl::layer(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let drain = Drain::from_config(&config);

    let mut app = Engine::with_config(&config).with_drain(drain.clone());
    app.middleware(tsu::middleware::trace);
    app.get("/users/{id}", get_user)
        .post("/users", create_user)
        .delete("/users/{id}", delete_user);
    app.group("/internal")
        .middleware(require_token)
        .get("/stats", stats);

    // Leaves signal handling to the app server; both stop with the drain.
    let admin = AdminServer::new(&config, drain, vec![LoggerInfo::new("app", control)])
        .spawn("127.0.0.1:9090")?;

    Server::bind("0.0.0.0:3000")?.with_config(&config).serve(app).await?;
    if let Ok(Err(e)) = admin.await {
        tracing::error!("admin server failed: {e}");
    }
    Ok(())
}

// GET /users/{id}
fn get_user(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        let id = c.param("id").unwrap_or("unknown").to_owned();
        c.json(StatusCode::OK, &serde_json::json!({ "id": id, "name": "alice" }));
    })
}

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

// POST /users
fn create_user(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        let Ok(user) = c.bind_form::<NewUser>() else {
            c.abort_with_status(StatusCode::BAD_REQUEST);
            return;
        };
        c.header("location", "/users/99");
        c.json(StatusCode::CREATED, &serde_json::json!({ "id": "99", "name": user.name }));
    })
}

// DELETE /users/{id} → 204 No Content
fn delete_user(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move { c.abort_with_status(StatusCode::NO_CONTENT) })
}

fn require_token(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        if c.request().header("x-token") != Some("secret") {
            c.abort_with_status(StatusCode::UNAUTHORIZED);
        }
    })
}

fn stats(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        let in_flight = c.engine().drain().in_flight();
        c.json(StatusCode::OK, &serde_json::json!({ "in_flight": in_flight }));
    })
}
