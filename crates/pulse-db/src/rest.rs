//! PostgREST backend over blocking HTTP.
//!
//! Every request carries the anon key twice, as `apikey` and as a bearer
//! token, which is what the hosted platform expects from public clients.
//! Counts use `HEAD` with `Prefer: count=exact` and read the total from the
//! `Content-Range` header, so no rows are transferred.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use pulse_core::ConnectionSettings;

use crate::backend::{Backend, Filter, FilterOp, Row, SelectQuery};
use crate::error::{DbError, DbResult};

/// Longest slice of an error body kept in [`DbError::Http`].
const MAX_ERROR_BODY: usize = 200;

/// [`Backend`] talking to `<url>/rest/v1/<table>`.
pub struct RestBackend {
    agent: ureq::Agent,
    base_url: String,
    anon_key: String,
    timeout: Duration,
}

impl RestBackend {
    #[must_use]
    pub fn new(settings: &ConnectionSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            base_url: format!("{}/rest/v1", settings.url.trim_end_matches('/')),
            anon_key: settings.anon_key.clone(),
            timeout: settings.timeout,
        }
    }

    fn table_url(&self, table: &str) -> DbResult<String> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::invalid("table", format!("unsupported table name {table:?}")));
        }
        Ok(format!("{}/{table}", self.base_url))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.anon_key)
    }
}

/// Render a filter as a PostgREST query pair, e.g. `("created_at", "gt.2026-03-10T00:00:00+00:00")`.
#[must_use]
pub fn filter_param(filter: &Filter) -> (String, String) {
    let rendered = match (&filter.value, filter.op) {
        (Value::Null, FilterOp::Eq) => "is.null".to_string(),
        (Value::String(s), op) => format!("{}.{s}", op.as_str()),
        (other, op) => format!("{}.{other}", op.as_str()),
    };
    (filter.column.clone(), rendered)
}

/// All query pairs of a select: projection, filters, order, limit.
#[must_use]
pub fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![(
        "select".to_string(),
        query
            .columns
            .as_ref()
            .map_or_else(|| "*".to_string(), |cols| cols.join(",")),
    )];
    params.extend(query.filters.iter().map(filter_param));
    if let Some(order) = &query.order {
        let dir = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{dir}", order.column)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Total row count from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range(header: &str) -> DbResult<u64> {
    let total = header
        .rsplit_once('/')
        .map(|(_, total)| total.trim())
        .ok_or_else(|| DbError::Decode(format!("malformed Content-Range {header:?}")))?;
    total
        .parse()
        .map_err(|_| DbError::Decode(format!("Content-Range without exact total: {header:?}")))
}

/// Pull `message` out of a PostgREST error body, else keep a prefix of it.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect())
}

fn transport_error(err: &ureq::Error) -> DbError {
    let msg = err.to_string();
    if matches!(err, ureq::Error::Timeout(_)) || msg.contains("timed out") || msg.contains("Timeout") {
        DbError::Timeout(msg)
    } else {
        DbError::Transport(msg)
    }
}

type Response = ureq::http::Response<ureq::Body>;

/// Map a non-2xx response to [`DbError::Http`].
fn check_status(mut response: Response) -> DbResult<Response> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(response);
    }
    let body = response.body_mut().read_to_string().unwrap_or_default();
    Err(DbError::Http {
        status,
        message: error_message(&body),
    })
}

fn content_range(response: &Response) -> DbResult<u64> {
    let header = response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DbError::Decode("response has no Content-Range header".into()))?;
    parse_content_range(header)
}

impl Backend for RestBackend {
    fn count(&self, table: &str, filters: &[Filter]) -> DbResult<u64> {
        let mut request = self
            .agent
            .head(&self.table_url(table)?)
            .header("apikey", &self.anon_key)
            .header("Authorization", &self.bearer())
            .header("Prefer", "count=exact")
            .query("select", "*");
        for (key, value) in filters.iter().map(filter_param) {
            request = request.query(key, value);
        }
        let response = check_status(request.call().map_err(|e| transport_error(&e))?)?;
        content_range(&response)
    }

    fn select(&self, table: &str, query: &SelectQuery) -> DbResult<Vec<Row>> {
        let mut request = self
            .agent
            .get(&self.table_url(table)?)
            .header("apikey", &self.anon_key)
            .header("Authorization", &self.bearer());
        for (key, value) in select_params(query) {
            request = request.query(key, value);
        }
        let mut response = check_status(request.call().map_err(|e| transport_error(&e))?)?;
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| DbError::Transport(format!("failed to read response: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn insert(&self, table: &str, row: Row) -> DbResult<()> {
        let body = serde_json::to_vec(&row)?;
        let response = self
            .agent
            .post(&self.table_url(table)?)
            .header("apikey", &self.anon_key)
            .header("Authorization", &self.bearer())
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .send(&body[..])
            .map_err(|e| transport_error(&e))?;
        check_status(response)?;
        Ok(())
    }

    fn delete(&self, table: &str, filters: &[Filter]) -> DbResult<u64> {
        if filters.is_empty() {
            // PostgREST rejects unfiltered deletes.
            return Err(DbError::invalid("filters", "delete requires at least one filter"));
        }
        let mut request = self
            .agent
            .delete(&self.table_url(table)?)
            .header("apikey", &self.anon_key)
            .header("Authorization", &self.bearer())
            .header("Prefer", "count=exact,return=minimal");
        for (key, value) in filters.iter().map(filter_param) {
            request = request.query(key, value);
        }
        let response = check_status(request.call().map_err(|e| transport_error(&e))?)?;
        Ok(content_range(&response).unwrap_or(0))
    }
}

impl fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("anon_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
