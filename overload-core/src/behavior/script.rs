//! Script-driven client behavior.
//!
//! Each scripted client owns a single executor task that holds the compiled
//! script, its mutable state and a private PRNG. Hook invocations are work
//! items on a bounded channel answered over a oneshot, which makes script
//! evaluation logically single-threaded per client while thousands of
//! clients run concurrently. The script dialect is Rhai; scripts declare
//! optional top-level functions named `set_state`, `on_request`,
//! `on_response`, `on_error`, `on_fail` and `on_retry`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{ClientBehavior, HookDecision, RetryDecision};
use crate::clock::now_millis;
use crate::request::{Request, Response};
use crate::SimError;

/// Distinguishes executor seeds of interpreters created within the same
/// clock tick.
static EXECUTOR_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Request,
    Response,
    Error,
    Fail,
    Retry,
}

impl HookKind {
    fn fn_name(self) -> &'static str {
        match self {
            HookKind::Request => "on_request",
            HookKind::Response => "on_response",
            HookKind::Error => "on_error",
            HookKind::Fail => "on_fail",
            HookKind::Retry => "on_retry",
        }
    }
}

struct HookJob {
    kind: HookKind,
    req: Request,
    resp: Option<Response>,
    err: Option<String>,
    reply: oneshot::Sender<HookReply>,
}

struct HookReply {
    decision: HookDecision,
    /// Updated meta bag, absent when the hook did not run
    meta: Option<serde_json::Map<String, Value>>,
}

/// Which optional hook functions the script actually defines.
#[derive(Debug, Default, Clone, Copy)]
struct HookSet {
    set_state: bool,
    on_request: bool,
    on_response: bool,
    on_error: bool,
    on_fail: bool,
    on_retry: bool,
}

impl HookSet {
    fn from_ast(ast: &AST) -> Self {
        let mut hooks = Self::default();
        for f in ast.iter_functions() {
            match f.name {
                "set_state" => hooks.set_state = true,
                "on_request" => hooks.on_request = true,
                "on_response" => hooks.on_response = true,
                "on_error" => hooks.on_error = true,
                "on_fail" => hooks.on_fail = true,
                "on_retry" => hooks.on_retry = true,
                _ => {}
            }
        }
        hooks
    }

    fn defines(&self, kind: HookKind) -> bool {
        match kind {
            HookKind::Request => self.on_request,
            HookKind::Response => self.on_response,
            HookKind::Error => self.on_error,
            HookKind::Fail => self.on_fail,
            HookKind::Retry => self.on_retry,
        }
    }
}

/// A client behavior backed by a Rhai script.
pub struct ScriptBehavior {
    tx: mpsc::Sender<HookJob>,
    stop: CancellationToken,
}

impl ScriptBehavior {
    /// Compiles the script and spawns its executor task.
    ///
    /// Compile errors surface here so the caller can fall back to the noop
    /// behavior; runtime hook errors are logged and resolved to defaults.
    pub fn new(script: &str, queue_capacity: usize) -> crate::Result<Self> {
        let state: Arc<Mutex<Dynamic>> = Arc::new(Mutex::new(Dynamic::UNIT));
        let seq = EXECUTOR_SEQ.fetch_add(1, Ordering::Relaxed);
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            .wrapping_add(seq.wrapping_mul(0x9E37_79B9_7F4A_7C15));

        let engine = build_engine(state.clone(), seed);
        let ast = engine
            .compile(script)
            .map_err(|e| SimError::ScriptEvaluation {
                reason: e.to_string(),
            })?;
        let hooks = HookSet::from_ast(&ast);

        let (tx, rx) = mpsc::channel(queue_capacity);
        let stop = CancellationToken::new();

        tokio::spawn(run_executor(engine, ast, hooks, state, rx, stop.clone()));

        Ok(Self { tx, stop })
    }

    /// Enqueues a hook invocation and waits for the executor's reply.
    ///
    /// Returns `None` during shutdown; the caller maps that to the blocked
    /// defaults. Enqueueing blocks when the work queue is full: every hook
    /// must fire for script state to stay coherent.
    async fn run_hook(
        &self,
        kind: HookKind,
        req: &mut Request,
        resp: Option<Response>,
        err: Option<String>,
    ) -> Option<HookDecision> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = HookJob {
            kind,
            req: req.clone(),
            resp,
            err,
            reply: reply_tx,
        };

        tokio::select! {
            _ = self.stop.cancelled() => return None,
            sent = self.tx.send(job) => {
                if sent.is_err() {
                    return None;
                }
            }
        }

        tokio::select! {
            _ = self.stop.cancelled() => None,
            reply = reply_rx => match reply {
                Ok(reply) => {
                    if let Some(meta) = reply.meta {
                        req.meta = meta;
                    }
                    Some(reply.decision)
                }
                Err(_) => None,
            },
        }
    }
}

#[async_trait]
impl ClientBehavior for ScriptBehavior {
    async fn on_request(&self, req: &mut Request) -> HookDecision {
        self.run_hook(HookKind::Request, req, None, None)
            .await
            .unwrap_or_else(HookDecision::blocked)
    }

    async fn on_response(&self, req: &mut Request, resp: &Response) {
        self.run_hook(HookKind::Response, req, Some(resp.clone()), None)
            .await;
    }

    async fn on_error(&self, req: &mut Request, resp: &Response) {
        self.run_hook(HookKind::Error, req, Some(resp.clone()), None)
            .await;
    }

    async fn on_fail(&self, req: &mut Request, err: &SimError) {
        self.run_hook(HookKind::Fail, req, None, Some(err.to_string()))
            .await;
    }

    async fn on_retry(
        &self,
        req: &mut Request,
        resp: Option<&Response>,
        err: Option<&SimError>,
    ) -> RetryDecision {
        match self
            .run_hook(
                HookKind::Retry,
                req,
                resp.cloned(),
                err.map(|e| e.to_string()),
            )
            .await
        {
            Some(decision) => RetryDecision {
                allow: decision.allow,
                delay_ms: decision.delay_ms,
            },
            None => RetryDecision::no_retry(),
        }
    }

    fn close(&self) {
        self.stop.cancel();
    }
}

/// The executor task: owns engine, AST, scope and script state, evaluates
/// one hook at a time.
async fn run_executor(
    engine: Engine,
    ast: AST,
    hooks: HookSet,
    state: Arc<Mutex<Dynamic>>,
    mut rx: mpsc::Receiver<HookJob>,
    stop: CancellationToken,
) {
    let mut scope = Scope::new();

    if hooks.set_state {
        match engine.call_fn::<Dynamic>(&mut scope, &ast, "set_state", ()) {
            Ok(value) => *state.lock() = value.into_shared(),
            Err(e) => tracing::warn!("set_state failed: {e}"),
        }
    }

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => evaluate_job(&engine, &ast, hooks, &mut scope, job),
                None => break,
            },
        }
    }

    // Resolve queued work with shutdown defaults so no waiter is left
    // holding an open reply channel.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job.reply.send(HookReply {
            decision: HookDecision::blocked(),
            meta: None,
        });
    }
}

fn evaluate_job(engine: &Engine, ast: &AST, hooks: HookSet, scope: &mut Scope, job: HookJob) {
    let HookJob {
        kind,
        req,
        resp,
        err,
        reply,
    } = job;

    if !hooks.defines(kind) {
        let decision = match kind {
            HookKind::Request => HookDecision::allow_default(),
            _ => HookDecision::blocked(),
        };
        let _ = reply.send(HookReply {
            decision,
            meta: None,
        });
        return;
    }

    let shared_meta = meta_to_shared(&req.meta);
    let req_dyn = request_to_dynamic(&req, shared_meta.clone());

    let result = match kind {
        HookKind::Request => {
            engine.call_fn::<Dynamic>(scope, ast, kind.fn_name(), (req_dyn,))
        }
        HookKind::Response | HookKind::Error => {
            let resp_dyn = response_to_dynamic(resp.as_ref());
            engine.call_fn::<Dynamic>(scope, ast, kind.fn_name(), (req_dyn, resp_dyn))
        }
        HookKind::Fail => {
            let err_dyn = error_to_dynamic(err.as_deref());
            engine.call_fn::<Dynamic>(scope, ast, kind.fn_name(), (req_dyn, err_dyn))
        }
        HookKind::Retry => {
            let resp_dyn = response_to_dynamic(resp.as_ref());
            let err_dyn = error_to_dynamic(err.as_deref());
            engine.call_fn::<Dynamic>(scope, ast, kind.fn_name(), (req_dyn, resp_dyn, err_dyn))
        }
    };

    let decision = match result {
        Ok(value) => match kind {
            HookKind::Request | HookKind::Retry => decision_from_dynamic(&value),
            _ => HookDecision::allow_default(),
        },
        Err(e) => {
            tracing::warn!("{} error: {e}", kind.fn_name());
            match kind {
                // A raising on_request lets the request through; a raising
                // on_retry gives up.
                HookKind::Request => HookDecision::allow_default(),
                _ => HookDecision::blocked(),
            }
        }
    };

    let _ = reply.send(HookReply {
        decision,
        meta: Some(meta_from_shared(&shared_meta)),
    });
}

/// Builds the sandboxed engine with the script built-ins.
fn build_engine(state: Arc<Mutex<Dynamic>>, seed: u64) -> Engine {
    let mut engine = Engine::new();

    engine.on_print(|text| tracing::info!(target: "overload_core::behavior::script", "{text}"));

    let state_handle = state;
    engine.register_fn("get_state", move || -> Dynamic { state_handle.lock().clone() });

    engine.register_fn("now", || now_millis() as f64);

    let rng = Arc::new(Mutex::new(SmallRng::seed_from_u64(seed)));
    engine.register_fn("random", move || -> f64 { rng.lock().gen::<f64>() });

    engine.register_fn("pow", |base: f64, exp: f64| base.powf(exp));
    engine.register_fn("pow", |base: f64, exp: i64| base.powf(exp as f64));
    engine.register_fn("pow", |base: i64, exp: f64| (base as f64).powf(exp));
    engine.register_fn("pow", |base: i64, exp: i64| (base as f64).powf(exp as f64));

    engine.register_fn("round", |x: f64| round_half_to_even(x) as i64);
    engine.register_fn("round", |x: i64| x);
    engine.register_fn("round", |x: f64, ndigits: i64| {
        // Negative ndigits rounds to tens, hundreds, and so on
        let factor = 10f64.powi(ndigits as i32);
        round_half_to_even(x * factor) / factor
    });

    engine
}

/// Banker's rounding: ties go to the nearest even integer, matching IEEE
/// 754 round-half-to-even.
fn round_half_to_even(x: f64) -> f64 {
    if x.is_nan() || x.is_infinite() {
        return x;
    }
    let integer = x.trunc();
    let fraction = x - integer;
    if (fraction.abs() - 0.5).abs() < f64::EPSILON {
        if (integer.abs() % 2.0) == 0.0 {
            integer
        } else if x > 0.0 {
            integer + 1.0
        } else {
            integer - 1.0
        }
    } else {
        x.round()
    }
}

fn meta_to_shared(meta: &serde_json::Map<String, Value>) -> Dynamic {
    let value = Value::Object(meta.clone());
    match rhai::serde::to_dynamic(&value) {
        Ok(dynamic) => dynamic.into_shared(),
        Err(_) => Dynamic::from(rhai::Map::new()).into_shared(),
    }
}

fn meta_from_shared(shared: &Dynamic) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    if let Some(map) = shared.read_lock::<rhai::Map>() {
        for (key, value) in map.iter() {
            if let Ok(json) = rhai::serde::from_dynamic::<Value>(value) {
                out.insert(key.to_string(), json);
            }
        }
    }
    out
}

fn request_to_dynamic(req: &Request, shared_meta: Dynamic) -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("id".into(), req.id.clone().into());
    map.insert("client_id".into(), req.client_id.clone().into());
    map.insert("data".into(), req.data.clone().into());
    map.insert("timestamp".into(), Dynamic::from_float(req.timestamp as f64));
    map.insert("meta".into(), shared_meta);
    Dynamic::from(map)
}

fn response_to_dynamic(resp: Option<&Response>) -> Dynamic {
    let Some(resp) = resp else {
        return Dynamic::UNIT;
    };
    let mut map = rhai::Map::new();
    map.insert("id".into(), resp.id.clone().into());
    map.insert("ok".into(), resp.ok.into());
    map.insert("data".into(), resp.data.clone().into());
    map.insert("error".into(), resp.error.clone().into());
    map.insert("timestamp".into(), Dynamic::from_float(resp.timestamp as f64));
    Dynamic::from(map)
}

fn error_to_dynamic(err: Option<&str>) -> Dynamic {
    match err {
        Some(message) => message.to_string().into(),
        None => Dynamic::UNIT,
    }
}

/// Extracts `{allow, delay, timeout}` from a hook's return value.
///
/// Missing keys keep their defaults (`allow = true`); a non-map return is
/// treated as an empty map.
fn decision_from_dynamic(value: &Dynamic) -> HookDecision {
    let mut decision = HookDecision::allow_default();
    if let Some(map) = value.read_lock::<rhai::Map>() {
        if let Some(allow) = map.get("allow") {
            decision.allow = truthy(allow);
        }
        if let Some(delay) = map.get("delay").and_then(int_value) {
            decision.delay_ms = delay;
        }
        if let Some(timeout) = map.get("timeout").and_then(int_value) {
            decision.timeout_ms = timeout;
        }
    }
    decision
}

fn truthy(value: &Dynamic) -> bool {
    if let Ok(b) = value.as_bool() {
        b
    } else if let Ok(i) = value.as_int() {
        i != 0
    } else if let Ok(f) = value.as_float() {
        f != 0.0
    } else {
        !value.is_unit()
    }
}

fn int_value(value: &Dynamic) -> Option<i64> {
    if let Ok(i) = value.as_int() {
        Some(i)
    } else if let Ok(f) = value.as_float() {
        Some(f as i64)
    } else {
        None
    }
}
