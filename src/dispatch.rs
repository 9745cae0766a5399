//! The stdio dispatch loop (spec.md §4.7, §6).
//!
//! Reads one JSON-RPC request per line from stdin and writes exactly one
//! JSON-RPC response per line to stdout — stdout carries nothing else, so
//! all logging goes to stderr (see `logger`). Shaped after the teacher's
//! `web_server/handler.rs::dispatch_command` match-on-method-name table and
//! the synchronous `for line in stdin.lock().lines()` loop of
//! `plugins/duckdb/src/main.rs`, but fans query/count/exec/update/delete/
//! insert out to the operation engine instead of handling them inline.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};

use crate::cache::PageCache;
use crate::drivers::ExecOutcome;
use crate::error::{self, RpcError};
use crate::filter::{build_order_by, build_pk_clause, build_where, DriverTag, FilterPredicate, Operator, SortEntry};
use crate::operation::Operation;
use crate::registry::Registry;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
use crate::schema::Schema;
use crate::value::Value;

/// Requests larger than this are rejected with `PARSE_ERROR` before any JSON
/// decoding is attempted, per spec.md §6 "maximum request size".
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// One open table-browse view: the schema it was described against (to
/// resolve filter/sort column indices) plus its row window.
struct TableView {
    schema: Schema,
    cache: PageCache,
    filters: Vec<FilterPredicate>,
    sorts: Vec<SortEntry>,
    /// A speculative background load kicked off the last time the cursor
    /// approached a buffer edge (spec.md §4.6 "start_background_load").
    /// Polled (never blocked on) the next time this view is touched.
    prefetch: Option<PendingPrefetch>,
}

/// A non-blocking page load in flight, started speculatively ahead of the
/// cursor. `page_start` is the offset the result, once ready, merges at.
struct PendingPrefetch {
    page_start: i64,
    op: Arc<Operation<crate::schema::ResultSet>>,
}

pub struct Dispatcher {
    registry: Registry,
    views: HashMap<(u64, String), TableView>,
    /// Cancellation flag of whichever operation is currently running
    /// against a connection, keyed by connection id — spec.md §4.7's
    /// `cancel {conn_id}` sets this flag and asks the driver to abort
    /// best-effort; see §5 "Concurrency per connection" (only one
    /// operation runs per connection at a time in this daemon, so the
    /// connection id alone disambiguates which operation to cancel).
    inflight: HashMap<u64, Arc<AtomicBool>>,
    max_request_bytes: usize,
}

impl Dispatcher {
    pub fn new(max_request_bytes: usize) -> Self {
        Self {
            registry: Registry::new(),
            views: HashMap::new(),
            inflight: HashMap::new(),
            max_request_bytes,
        }
    }

    /// Spawns `work` on its own operation thread, tracks its cancellation
    /// flag under `conn_id` for the duration so a `cancel` RPC (or shutdown)
    /// can reach it, and blocks the dispatch thread until it finishes or
    /// `timeout` elapses. This is the only way a driver call reaches the
    /// wire: every query/count/exec/update/delete/insert goes through here,
    /// per spec.md §4.3 "one operation, one worker thread".
    fn run_operation<T, F, Fut>(&mut self, conn_id: u64, timeout: Duration, work: F) -> Result<T, RpcError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<AtomicBool>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, String>> + Send,
    {
        let op = Operation::<T>::spawn(work);
        self.inflight.insert(conn_id, op.cancel_flag());
        let waited = op.wait(timeout);
        self.inflight.remove(&conn_id);
        match waited {
            Some(result) => result,
            None => Err(RpcError::new(error::QUERY_TIMEOUT, "operation timed out")),
        }
    }

    /// Runs the blocking read-dispatch-write loop on the calling thread
    /// until stdin closes. `rt` drives the one-off async registry calls
    /// (`connect`/`disconnect`/`reconnect`/`connections`) that don't warrant
    /// their own operation thread.
    pub fn run(&mut self, rt: &tokio::runtime::Runtime) -> io::Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            if line.len() > self.max_request_bytes {
                let resp = JsonRpcResponse::failure(Json::Null, RpcError::new(error::PARSE_ERROR, "request exceeds maximum size"));
                write_response(&mut stdout, &resp)?;
                continue;
            }

            let (id, method, response) = self.handle_line(&line, rt);
            let is_clean_shutdown = method.as_deref() == Some("shutdown") && response.is_ok();
            let resp = match response {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(err) => JsonRpcResponse::failure(id, err),
            };
            write_response(&mut stdout, &resp)?;

            if is_clean_shutdown {
                break;
            }
        }
        // EOF on stdin takes the same cleanup path as an explicit `shutdown`
        // (spec.md §5 "Shutdown"); `shutdown_all` is idempotent so this is a
        // no-op if the loop already broke out via the RPC.
        self.shutdown_all(rt);
        Ok(())
    }

    /// Cancels every outstanding operation (inflight driver calls and
    /// speculative prefetches) and closes every open connection, per
    /// spec.md §5 "Shutdown": "cancels every outstanding operation, waits
    /// (bounded) for workers to reach a terminal state, closes every
    /// connection via the registry". The wait is implicit here — closing a
    /// connection only drops this process's handle to the driver pool, it
    /// doesn't join the cancelled worker threads, which are detached and
    /// exit on their own once they observe the cancellation flag.
    fn shutdown_all(&mut self, rt: &tokio::runtime::Runtime) {
        for view in self.views.values_mut() {
            if let Some(pending) = view.prefetch.take() {
                pending.op.request_cancel();
            }
        }
        for flag in self.inflight.values() {
            flag.store(true, Ordering::SeqCst);
        }
        self.views.clear();

        let ids: Vec<u64> = rt.block_on(self.registry.list()).into_iter().map(|v| v.id).collect();
        for id in ids {
            let _ = rt.block_on(self.registry.close(id));
        }
    }

    fn handle_line(&mut self, line: &str, rt: &tokio::runtime::Runtime) -> (Json, Option<String>, Result<Json, RpcError>) {
        let req: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => return (Json::Null, None, Err(RpcError::new(error::PARSE_ERROR, e.to_string()))),
        };
        let id = req.id.clone().unwrap_or(Json::Null);
        let result = self.dispatch_method(&req.method, &req.params, rt);
        (id, Some(req.method), result)
    }

    fn dispatch_method(&mut self, method: &str, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        match method {
            "ping" => Ok(json!({})),
            "version" => Ok(json!({ "daemon_version": env!("CARGO_PKG_VERSION") })),
            "shutdown" => {
                self.shutdown_all(rt);
                Ok(json!({}))
            }
            "connect" => rt.block_on(self.handle_connect(params)),
            "disconnect" => rt.block_on(self.handle_disconnect(params)),
            "reconnect" => rt.block_on(self.handle_reconnect(params)),
            "connections" => rt.block_on(self.handle_connections()),
            "tables" => rt.block_on(self.handle_tables(params)),
            "schema" => rt.block_on(self.handle_schema(params)),
            "query" => self.handle_query(params, rt),
            "count" => self.handle_count(params, rt),
            "exec" => self.handle_exec(params, rt),
            "update" => self.handle_update(params, rt),
            "delete" => self.handle_delete(params, rt),
            "insert" => self.handle_insert(params, rt),
            "cancel" => self.handle_cancel(params, rt),
            other => Err(RpcError::new(error::METHOD_NOT_FOUND, format!("unknown method '{}'", other))),
        }
    }

    async fn handle_connect(&mut self, params: &Json) -> Result<Json, RpcError> {
        let connstr = get_str(params, "connstr")?;
        let password = get_opt_str(params, "password");
        let id = self.registry.open(connstr, password.as_deref()).await?;
        Ok(json!({ "conn_id": id }))
    }

    async fn handle_disconnect(&mut self, params: &Json) -> Result<Json, RpcError> {
        let id = get_u64(params, "conn_id")?;
        // spec.md §5: cancel whatever's in flight on this connection before
        // tearing it down, so a worker thread isn't left holding a handle
        // the registry is about to drop.
        if let Some(flag) = self.inflight.get(&id) {
            flag.store(true, Ordering::SeqCst);
        }
        for (_, view) in self.views.iter_mut().filter(|((conn_id, _), _)| *conn_id == id) {
            if let Some(pending) = view.prefetch.take() {
                pending.op.request_cancel();
            }
        }
        if let Ok(entry) = self.registry.borrow(id).await {
            entry.driver.cancel_current().await;
        }
        self.registry.close(id).await?;
        self.views.retain(|(conn_id, _), _| *conn_id != id);
        Ok(json!({}))
    }

    async fn handle_reconnect(&mut self, params: &Json) -> Result<Json, RpcError> {
        let id = get_u64(params, "conn_id")?;
        let entry = self.registry.borrow(id).await?;
        let connstr = entry.connstr.clone();
        self.registry.close(id).await?;
        let new_id = self.registry.open(&connstr, get_opt_str(params, "password").as_deref()).await?;
        Ok(json!({ "conn_id": new_id }))
    }

    async fn handle_connections(&self) -> Result<Json, RpcError> {
        let views = self.registry.list().await;
        Ok(json!(views))
    }

    async fn handle_tables(&self, params: &Json) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let entry = self.registry.borrow(conn_id).await?;
        let tables = entry.driver.list_tables().await.map_err(error::classify_driver_error)?;
        Ok(json!(tables))
    }

    async fn handle_schema(&self, params: &Json) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let table = get_str(params, "table")?;
        let entry = self.registry.borrow(conn_id).await?;
        let schema = entry.driver.describe(table).await.map_err(error::classify_driver_error)?;
        Ok(serde_json::to_value(schema).map_err(|e| RpcError::new(error::INTERNAL_ERROR, e.to_string()))?)
    }

    fn handle_query(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let table = get_str(params, "table")?.to_string();
        let offset = params.get("offset").and_then(Json::as_i64).unwrap_or(0);
        // `limit` bounds what this particular response returns to the
        // client; it's independent of the cache's own PAGE_SIZE windowing,
        // which always fetches/merges whole pages from the driver.
        let limit = params.get("limit").and_then(Json::as_i64).unwrap_or(crate::cache::PAGE_SIZE);

        let entry = rt.block_on(self.registry.borrow(conn_id))?;
        let driver = entry.driver.clone();
        let driver_tag = entry.driver_tag;

        let key = (conn_id, table.clone());
        if !self.views.contains_key(&key) {
            let schema = rt.block_on(driver.describe(&table)).map_err(error::classify_driver_error)?;
            self.views.insert(key.clone(), TableView { schema, cache: PageCache::new(), filters: Vec::new(), sorts: Vec::new(), prefetch: None });
        }

        {
            // Changing the filter/sort invalidates the window and any
            // prefetch computed against the old predicates (spec.md §4.6
            // "Sort and filter interaction").
            let view = self.views.get_mut(&key).unwrap();
            let mut invalidated = false;
            if let Some(filters) = parse_filters(params)? {
                view.filters = filters;
                invalidated = true;
            }
            if let Some(sorts) = parse_sorts(params)? {
                view.sorts = sorts;
                invalidated = true;
            }
            if invalidated {
                view.cache.invalidate();
                if let Some(pending) = view.prefetch.take() {
                    pending.op.request_cancel();
                }
            }
        }

        let (where_clause, order_by, total_rows_unknown) = {
            let view = self.views.get(&key).unwrap();
            let where_clause = build_where(&view.filters, &view.schema, driver_tag).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))?;
            let order_by = build_order_by(&view.sorts, &view.schema, driver_tag).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))?;
            (where_clause, order_by, view.cache.total_rows() == 0)
        };

        if total_rows_unknown {
            let d = driver.clone();
            let t = table.clone();
            let wc = where_clause.clone();
            let (count, approx) = self.run_operation(conn_id, Duration::from_secs(300), move |_cancel| async move {
                d.count(&t, wc.as_ref()).await
            })?;
            self.views.get_mut(&key).unwrap().cache.set_count(count, approx);
        }

        // Adopt a completed background prefetch (non-blocking: spec.md
        // §4.6 "start_background_load ... polled from the main loop and
        // merged only if still useful").
        self.absorb_ready_prefetch(&key);

        let (needs_sync_load, prefetch_forward, prefetch_backward) = {
            let view = self.views.get_mut(&key).unwrap();
            let mv = view.cache.move_cursor(offset);
            (mv.needs_synchronous_load || !view.cache.has_row(offset), mv.prefetch_forward, mv.prefetch_backward)
        };

        if needs_sync_load {
            // A blocking load replaces whatever speculative prefetch was in
            // flight — spec.md §4.6 "cancels any outstanding prefetch".
            if let Some(pending) = self.views.get_mut(&key).unwrap().prefetch.take() {
                pending.op.request_cancel();
            }
            let start = crate::cache::PageCache::page_start_for(offset);
            let d = driver.clone();
            let t = table.clone();
            let wc = where_clause.clone();
            let ob = order_by.clone();
            let page = self.run_operation(conn_id, Duration::from_secs(300), move |_cancel| async move {
                d.query_page(&t, start, crate::cache::PAGE_SIZE, wc.as_ref(), ob.as_deref()).await
            })?;
            self.views.get_mut(&key).unwrap().cache.merge_page(start, page);
        } else {
            self.maybe_start_prefetch(&key, conn_id, &driver, &table, where_clause.as_ref(), order_by.as_deref(), prefetch_forward, prefetch_backward);
        }

        let view = self.views.get(&key).unwrap();
        let rows: Vec<Json> = (offset..(offset + limit).min(view.cache.total_rows()))
            .filter_map(|o| view.cache.row_at(o))
            .map(|row| json!(row.cells.iter().map(Value::to_json).collect::<Vec<_>>()))
            .collect();

        Ok(json!({
            "rows": rows,
            "total_rows": view.cache.total_rows(),
            "offset": offset,
        }))
    }

    /// If a previously-started background prefetch has finished, merges its
    /// rows into the cache; never blocks waiting for one still running.
    fn absorb_ready_prefetch(&mut self, key: &(u64, String)) {
        let view = self.views.get_mut(key).unwrap();
        let Some(pending) = view.prefetch.take() else { return };
        if pending.op.poll().is_none() {
            view.prefetch = Some(pending);
            return;
        }
        if let Some(Ok(rs)) = pending.op.wait(Duration::from_secs(0)) {
            view.cache.merge_page(pending.page_start, rs);
        }
    }

    /// Kicks off a non-blocking page load ahead of the cursor when one
    /// isn't already in flight, per spec.md §4.6 "start_background_load".
    #[allow(clippy::too_many_arguments)]
    fn maybe_start_prefetch(
        &mut self,
        key: &(u64, String),
        conn_id: u64,
        driver: &Arc<dyn crate::drivers::DatabaseDriver>,
        table: &str,
        where_clause: Option<&crate::filter::BuiltClause>,
        order_by: Option<&str>,
        prefetch_forward: bool,
        prefetch_backward: bool,
    ) {
        let view = self.views.get_mut(key).unwrap();
        if view.prefetch.is_some() || (!prefetch_forward && !prefetch_backward) {
            return;
        }
        let direction_forward = prefetch_forward;
        let Some(start) = view.cache.next_prefetch_offset(direction_forward) else { return };

        let d = driver.clone();
        let t = table.to_string();
        let wc = where_clause.cloned();
        let ob = order_by.map(str::to_string);
        let op = Operation::<crate::schema::ResultSet>::spawn(move |_cancel| async move {
            d.query_page(&t, start, crate::cache::PAGE_SIZE, wc.as_ref(), ob.as_deref()).await
        });
        // Prefetches aren't tracked in `inflight` (that map cancels
        // client-visible operations); a connection-level `cancel` still
        // reaches them via the per-view cleanup in `handle_disconnect` /
        // `shutdown_all`.
        let _ = conn_id;
        self.views.get_mut(key).unwrap().prefetch = Some(PendingPrefetch { page_start: start, op });
    }

    fn handle_count(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let table = get_str(params, "table")?.to_string();
        let entry = rt.block_on(self.registry.borrow(conn_id))?;
        let driver = entry.driver.clone();
        let driver_tag = entry.driver_tag;
        let schema = rt.block_on(driver.describe(&table)).map_err(error::classify_driver_error)?;
        let filters = parse_filters(params)?.unwrap_or_default();
        let where_clause = build_where(&filters, &schema, driver_tag).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))?;

        let (count, approximate) = self.run_operation(conn_id, Duration::from_secs(300), move |_cancel| async move {
            driver.count(&table, where_clause.as_ref()).await
        })?;
        Ok(json!({ "count": count, "approximate": approximate }))
    }

    fn handle_exec(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let sql = get_str(params, "sql")?.to_string();
        let entry = rt.block_on(self.registry.borrow(conn_id))?;
        let driver = entry.driver.clone();

        let result = self.run_operation(conn_id, Duration::from_secs(300), move |_cancel| async move { driver.exec(&sql).await })?;
        match result {
            ExecOutcome::Select(rs) => Ok(json!({
                "rows": rs.rows.iter().map(|r| json!(r.cells.iter().map(Value::to_json).collect::<Vec<_>>())).collect::<Vec<_>>(),
                "columns": rs.columns.iter().map(|c| &c.name).collect::<Vec<_>>(),
            })),
            ExecOutcome::Dml { affected } => Ok(json!({ "affected": affected })),
        }
    }

    fn handle_update(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let table = get_str(params, "table")?.to_string();
        let column = get_str(params, "column")?.to_string();
        let new_value = Value::from_json(params.get("value").unwrap_or(&Json::Null)).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))?;

        let entry = rt.block_on(self.registry.borrow(conn_id))?;
        let driver = entry.driver.clone();
        let schema = rt.block_on(driver.describe(&table)).map_err(error::classify_driver_error)?;
        let pk = pk_clause_from_params(params, &schema, entry.driver_tag)?;

        self.run_operation(conn_id, Duration::from_secs(60), move |_cancel| async move {
            driver.update_cell(&table, &pk, &column, &new_value).await
        })?;
        Ok(json!({}))
    }

    fn handle_delete(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let table = get_str(params, "table")?.to_string();
        let entry = rt.block_on(self.registry.borrow(conn_id))?;
        let driver = entry.driver.clone();
        let schema = rt.block_on(driver.describe(&table)).map_err(error::classify_driver_error)?;
        let pk = pk_clause_from_params(params, &schema, entry.driver_tag)?;

        self.run_operation(conn_id, Duration::from_secs(60), move |_cancel| async move { driver.delete_row(&table, &pk).await })?;
        Ok(json!({}))
    }

    fn handle_insert(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        let table = get_str(params, "table")?.to_string();
        let columns_arr = params.get("columns").and_then(Json::as_array).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "missing 'columns' array"))?;
        let values_arr = params.get("values").and_then(Json::as_array).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "missing 'values' array"))?;
        if columns_arr.len() != values_arr.len() {
            return Err(RpcError::new(error::INVALID_PARAMS, "'columns' and 'values' must be the same length"));
        }
        let mut columns = Vec::with_capacity(columns_arr.len());
        for c in columns_arr {
            columns.push(c.as_str().ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "'columns' entries must be strings"))?.to_string());
        }
        let mut values = Vec::with_capacity(values_arr.len());
        for v in values_arr {
            values.push(Value::from_json(v).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))?);
        }

        let entry = rt.block_on(self.registry.borrow(conn_id))?;
        let driver = entry.driver.clone();
        let pk = self.run_operation(conn_id, Duration::from_secs(60), move |_cancel| async move {
            driver.insert_row(&table, &columns, &values).await
        })?;
        // spec.md §4.7: insert's response is `{pk: [{column,value}]}`, the
        // same shape a `pk` argument to `update`/`delete` takes.
        let pk_json: Vec<Json> = pk.into_iter().map(|(column, value)| json!({ "column": column, "value": value.to_json() })).collect();
        Ok(json!({ "pk": pk_json }))
    }

    /// `cancel {conn_id}` (spec.md §4.7): sets the cancellation flag of
    /// whichever client-visible operation is currently running against
    /// this connection and asks the driver to abort it best-effort. A
    /// prefetch in flight on the same connection isn't addressed by this —
    /// it's speculative, not client-visible, and is left to finish or be
    /// superseded on the next `query`.
    fn handle_cancel(&mut self, params: &Json, rt: &tokio::runtime::Runtime) -> Result<Json, RpcError> {
        let conn_id = get_u64(params, "conn_id")?;
        if let Some(flag) = self.inflight.get(&conn_id) {
            flag.store(true, Ordering::SeqCst);
        }
        if let Ok(entry) = rt.block_on(self.registry.borrow(conn_id)) {
            rt.block_on(entry.driver.cancel_current());
        }
        Ok(json!({}))
    }
}

/// Parses `pk: [{column, value}]` (spec.md §4.7) into the parallel
/// column/value lists `build_pk_clause` expects. A table with a composite
/// key is addressed by listing every key column; the schema itself decides
/// whether that's one entry or several, the wire shape doesn't change.
fn pk_clause_from_params(params: &Json, schema: &Schema, driver: DriverTag) -> Result<crate::filter::BuiltClause, RpcError> {
    let pk_arr = params.get("pk").and_then(Json::as_array).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "missing 'pk' array"))?;
    if schema.primary_key_columns().is_empty() {
        return Err(RpcError::new(error::NO_SUCH_COLUMN, "table has no primary key"));
    }
    let mut columns = Vec::with_capacity(pk_arr.len());
    let mut values = Vec::with_capacity(pk_arr.len());
    for entry in pk_arr {
        let column = entry.get("column").and_then(Json::as_str).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "pk entry missing 'column'"))?;
        let value = entry.get("value").ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "pk entry missing 'value'"))?;
        columns.push(column.to_string());
        values.push(Value::from_json(value).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))?);
    }
    if columns.is_empty() {
        return Err(RpcError::new(error::INVALID_PARAMS, "'pk' array must not be empty"));
    }
    build_pk_clause(&columns, &values, driver, 1).map_err(|e| RpcError::new(error::INVALID_PARAMS, e))
}

fn parse_filters(params: &Json) -> Result<Option<Vec<FilterPredicate>>, RpcError> {
    let arr = match params.get("filters").and_then(Json::as_array) {
        Some(a) => a,
        None => return Ok(None),
    };
    let mut out = Vec::with_capacity(arr.len());
    for f in arr {
        let column_index = f.get("column_index").and_then(Json::as_u64).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "filter missing column_index"))? as usize;
        let op_str = f.get("operator").and_then(Json::as_str).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "filter missing operator"))?;
        let operator = parse_operator(op_str)?;
        let value = f.get("value").and_then(Json::as_str).map(str::to_string);
        let secondary_value = f.get("secondary_value").and_then(Json::as_str).map(str::to_string);
        out.push(FilterPredicate { column_index, operator, value, secondary_value });
    }
    Ok(Some(out))
}

fn parse_operator(s: &str) -> Result<Operator, RpcError> {
    Ok(match s {
        "eq" => Operator::Eq,
        "ne" => Operator::Ne,
        "lt" => Operator::Lt,
        "le" => Operator::Le,
        "gt" => Operator::Gt,
        "ge" => Operator::Ge,
        "in" => Operator::In,
        "contains" => Operator::Contains,
        "regex" => Operator::Regex,
        "between" => Operator::Between,
        "is_empty" => Operator::IsEmpty,
        "is_not_empty" => Operator::IsNotEmpty,
        "is_null" => Operator::IsNull,
        "is_not_null" => Operator::IsNotNull,
        "raw" => Operator::Raw,
        other => return Err(RpcError::new(error::INVALID_PARAMS, format!("unknown filter operator '{}'", other))),
    })
}

fn parse_sorts(params: &Json) -> Result<Option<Vec<SortEntry>>, RpcError> {
    let arr = match params.get("sorts").and_then(Json::as_array) {
        Some(a) => a,
        None => return Ok(None),
    };
    let mut out = Vec::with_capacity(arr.len());
    for s in arr {
        let column_index = s.get("column_index").and_then(Json::as_u64).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, "sort missing column_index"))? as usize;
        let direction = match s.get("direction").and_then(Json::as_str) {
            Some("desc") => crate::filter::SortDirection::Desc,
            _ => crate::filter::SortDirection::Asc,
        };
        out.push(SortEntry { column_index, direction });
    }
    Ok(Some(out))
}

fn get_str<'a>(params: &'a Json, key: &str) -> Result<&'a str, RpcError> {
    params.get(key).and_then(Json::as_str).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, format!("missing or non-string '{}'", key)))
}

fn get_opt_str(params: &Json, key: &str) -> Option<String> {
    params.get(key).and_then(Json::as_str).map(str::to_string)
}

fn get_u64(params: &Json, key: &str) -> Result<u64, RpcError> {
    params.get(key).and_then(Json::as_u64).ok_or_else(|| RpcError::new(error::INVALID_PARAMS, format!("missing or non-integer '{}'", key)))
}

fn write_response(stdout: &mut io::Stdout, resp: &JsonRpcResponse) -> io::Result<()> {
    let line = serde_json::to_string(resp).unwrap_or_else(|_| "{\"jsonrpc\":\"2.0\",\"error\":{\"code\":-32603,\"message\":\"failed to serialise response\"},\"id\":null}".to_string());
    stdout.write_all(line.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_returns_empty_object_without_touching_the_registry() {
        let mut d = Dispatcher::new(DEFAULT_MAX_REQUEST_BYTES);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = d.dispatch_method("ping", &json!({}), &rt).unwrap();
        assert_eq!(result, json!({}));
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let mut d = Dispatcher::new(DEFAULT_MAX_REQUEST_BYTES);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = d.dispatch_method("frobnicate", &json!({}), &rt).unwrap_err();
        assert_eq!(err.code, error::METHOD_NOT_FOUND);
    }

    #[test]
    fn connect_then_tables_then_disconnect_roundtrip() {
        let mut d = Dispatcher::new(DEFAULT_MAX_REQUEST_BYTES);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let connect_result = d.dispatch_method("connect", &json!({"connstr": "sqlite:///"}), &rt).unwrap();
        let id = connect_result["conn_id"].as_u64().unwrap();
        rt.block_on(d.registry.borrow(id)).expect("connection should exist");

        let tables = d.dispatch_method("tables", &json!({"conn_id": id}), &rt).unwrap();
        assert_eq!(tables, json!(Vec::<String>::new()));

        d.dispatch_method("disconnect", &json!({"conn_id": id}), &rt).unwrap();
        let err = d.dispatch_method("tables", &json!({"conn_id": id}), &rt).unwrap_err();
        assert_eq!(err.code, error::INVALID_CONN_ID);
    }

    #[test]
    fn query_insert_update_delete_roundtrip_through_run_operation() {
        let mut d = Dispatcher::new(DEFAULT_MAX_REQUEST_BYTES);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let id = d.dispatch_method("connect", &json!({"connstr": "sqlite:///"}), &rt).unwrap()["conn_id"].as_u64().unwrap();

        d.dispatch_method(
            "exec",
            &json!({"conn_id": id, "sql": "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT)"}),
            &rt,
        )
        .unwrap();

        let inserted = d
            .dispatch_method("insert", &json!({"conn_id": id, "table": "widgets", "columns": ["name"], "values": ["gizmo"]}), &rt)
            .unwrap();
        let pk = inserted["pk"].as_array().unwrap();
        assert_eq!(pk[0]["column"], "id");
        let new_id = pk[0]["value"].as_i64().unwrap();

        let queried = d.dispatch_method("query", &json!({"conn_id": id, "table": "widgets", "offset": 0}), &rt).unwrap();
        assert_eq!(queried["total_rows"], 1);

        d.dispatch_method(
            "update",
            &json!({"conn_id": id, "table": "widgets", "pk": [{"column": "id", "value": new_id}], "column": "name", "value": "sprocket"}),
            &rt,
        )
        .unwrap();

        d.dispatch_method("delete", &json!({"conn_id": id, "table": "widgets", "pk": [{"column": "id", "value": new_id}]}), &rt).unwrap();

        let count = d.dispatch_method("count", &json!({"conn_id": id, "table": "widgets"}), &rt).unwrap();
        assert_eq!(count["count"], 0);

        // `cancel` against an idle connection is a harmless no-op.
        d.dispatch_method("cancel", &json!({"conn_id": id}), &rt).unwrap();
    }
}
