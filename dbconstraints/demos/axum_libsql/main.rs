// Run with:
//   cargo run -p dbconstraints --features libsql-backend,never-web-example --example axum_libsql
// Starts an Axum server with create/update forms over a unique column. Submit
// the same value twice (or from two tabs at once) to see the constraint
// violation come back as a form error instead of a 500.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form as HtmlForm, Router,
};
use dbconstraints::backends::LibsqlTransactionManager;
use dbconstraints::transactions::TransactionContext;
use dbconstraints::views::{CreateView, FormResponse, UpdateView};
use dbconstraints::{
    async_trait, escape_html, Form, FormErrors, SaveError, SaveResult, UniqueFieldConvertor,
    ValidationError,
};
use dbconstraints_libsql::classify_error;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone, Debug)]
struct Entry {
    id: i64,
    unique_value: i64,
}

#[derive(Clone)]
struct AppState {
    manager: LibsqlTransactionManager,
}

#[derive(Deserialize)]
struct EntryInput {
    unique_value: String,
}

/// HTML form bound to an optional existing entry.
struct EntryForm {
    manager: LibsqlTransactionManager,
    instance: Option<i64>,
    raw: String,
    cleaned: Option<i64>,
    errors: FormErrors,
}

impl EntryForm {
    fn new(manager: LibsqlTransactionManager, instance: Option<i64>, raw: String) -> Self {
        Self {
            manager,
            instance,
            raw,
            cleaned: None,
            errors: FormErrors::new(),
        }
    }
}

#[async_trait]
impl Form for EntryForm {
    type Output = Entry;

    fn errors(&self) -> &FormErrors {
        &self.errors
    }

    fn errors_mut(&mut self) -> &mut FormErrors {
        &mut self.errors
    }

    fn clean(&mut self) -> Result<(), ValidationError> {
        match self.raw.trim().parse() {
            Ok(v) => {
                self.cleaned = Some(v);
                Ok(())
            }
            Err(_) => Err(ValidationError::for_field("unique_value", "Enter a whole number.")),
        }
    }

    async fn save(&mut self, ctx: TransactionContext<'_>) -> SaveResult<Entry> {
        let value = self.cleaned.ok_or(SaveError::NotFound)?;
        let conn = self.manager.connection(ctx)?;
        match self.instance {
            Some(id) => {
                let n = conn
                    .execute(
                        "UPDATE entries SET unique_value = ?1 WHERE id = ?2",
                        libsql::params![value, id],
                    )
                    .await
                    .map_err(classify_error)?;
                if n == 0 {
                    return Err(SaveError::NotFound);
                }
                Ok(Entry { id, unique_value: value })
            }
            None => {
                conn.execute(
                    "INSERT INTO entries (unique_value) VALUES (?1)",
                    libsql::params![value],
                )
                .await
                .map_err(classify_error)?;
                Ok(Entry {
                    id: conn.last_insert_rowid(),
                    unique_value: value,
                })
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join("dbconstraints_demo.db");
    #[allow(deprecated)]
    let db = Arc::new(libsql::Database::open(format!("file:{}?mode=rwc", path.display()))?);
    let conn = db.connect()?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unique_value INTEGER NOT NULL UNIQUE
        )",
        (),
    )
    .await?;

    let state = AppState {
        manager: LibsqlTransactionManager::new(db),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/entries", post(create_entry))
        .route("/entries/:id", post(update_entry))
        .with_state(state);

    let addr: SocketAddr = "127.0.0.1:3000".parse()?;
    println!("Axum listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

fn unique_convertor() -> UniqueFieldConvertor {
    UniqueFieldConvertor::new("Entry").column("unique_value", "unique_value")
}

fn form_page(action: &str, raw: &str, errors: &FormErrors) -> Html<String> {
    let raw = escape_html(raw);
    Html(format!(
        "<!doctype html><title>entries</title>{}\
         <form method=\"post\" action=\"{action}\">\
         {}<input name=\"unique_value\" value=\"{raw}\">\
         <button>save</button></form><p><a href=\"/\">back</a></p>",
        errors.field_as_ul(None),
        errors.field_as_ul(Some("unique_value")),
    ))
}

fn respond(result: SaveResult<FormResponse<Entry>>, action: &str, form: &EntryForm) -> Response {
    match result {
        Ok(FormResponse::Success { location, .. }) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Ok(FormResponse::Invalid) => form_page(action, &form.raw, form.errors()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("save failed: {e}")).into_response(),
    }
}

async fn index(State(state): State<AppState>) -> Result<Html<String>, String> {
    let conn = state
        .manager
        .connection(TransactionContext::new())
        .map_err(|e| format!("connect: {e}"))?;
    let mut rows = conn
        .query("SELECT id, unique_value FROM entries ORDER BY id", ())
        .await
        .map_err(|e| format!("query: {e}"))?;
    let mut items = String::new();
    while let Some(row) = rows.next().await.map_err(|e| format!("row: {e}"))? {
        let entry = Entry {
            id: row.get(0).map_err(|e| format!("id: {e}"))?,
            unique_value: row.get(1).map_err(|e| format!("unique_value: {e}"))?,
        };
        items.push_str(&format!(
            "<li><form method=\"post\" action=\"/entries/{id}\">#{id} \
             <input name=\"unique_value\" value=\"{v}\"><button>update</button></form></li>",
            id = entry.id,
            v = entry.unique_value,
        ));
    }
    let create = form_page("/entries", "", &FormErrors::new()).0;
    Ok(Html(format!("<ul>{items}</ul>{create}")))
}

// POST /entries
async fn create_entry(
    State(state): State<AppState>,
    HtmlForm(input): HtmlForm<EntryInput>,
) -> Response {
    let view = CreateView::new("/").with_conversion(unique_convertor());
    let mut form = EntryForm::new(state.manager.clone(), None, input.unique_value);
    let result = view.post(&state.manager, &mut form).await;
    respond(result, "/entries", &form)
}

// POST /entries/:id
async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    HtmlForm(input): HtmlForm<EntryInput>,
) -> Response {
    let view = UpdateView::new("/").with_conversion(unique_convertor());
    let mut form = EntryForm::new(state.manager.clone(), Some(id), input.unique_value);
    let result = view.post(&state.manager, &mut form).await;
    respond(result, &format!("/entries/{id}"), &form)
}
