//! Sandboxed JavaScript REPL with a capability-restricted API surface.
//!
//! The evaluator (Boa) is synchronous and runs on a dedicated OS thread that
//! lives for one task. The async engine talks to it over channels: commands
//! go in, and while a block is evaluating, capability calls come back out and
//! are serviced by the engine (`tokio::select!` over the outcome and the
//! host-call stream). All values crossing the boundary are JSON deep copies.

pub mod api;
pub mod hoist;
pub mod meta;
mod sandbox;
pub mod value;

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::BrowserDriver;
use crate::config::Limits;
use meta::VarDescriptor;

use std::sync::Arc;

/// Commands accepted by the evaluator thread.
enum ReplCommand {
    Execute {
        code: String,
        reply: oneshot::Sender<ExecuteOutcome>,
    },
    EnvMetadata {
        reply: oneshot::Sender<Vec<VarDescriptor>>,
    },
    SetGlobal {
        name: String,
        value: Value,
        reply: oneshot::Sender<()>,
    },
    Dispose,
}

/// A capability invocation escaping the sandbox.
///
/// The evaluator thread blocks on `reply` until the engine services the call;
/// an `Err` reply is rethrown inside the sandbox as a JS error.
pub(crate) struct HostCall {
    pub payload: HostCallPayload,
    pub reply: std_mpsc::Sender<Result<Value, String>>,
}

pub(crate) enum HostCallPayload {
    Driver(DriverOp),
    Log { message: String },
    Sleep { ms: u64 },
    SubQuery { prompt: String, data: Option<Value> },
    SubBatch { prompts: Vec<String> },
}

/// Tab operations routed to the external driver.
pub(crate) enum DriverOp {
    ListTabs,
    ActiveTab,
    OpenTab { url: Option<String> },
    CloseTab { tab: String },
    Navigate { tab: String, url: String },
    SwitchTab { tab: String },
    WaitForLoad { tab: String, timeout_ms: u64 },
    WaitForSelector { tab: String, selector: String, timeout_ms: u64 },
    ExecInTab { tab: String, code: String },
}

/// Result of one `execute` call.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    /// JSON copy of the block's completion value; `None` for `undefined`.
    pub result: Option<Value>,
    /// Present when the block threw (the result then holds the error sentinel).
    pub error: Option<String>,
    pub final_called: bool,
    pub final_value: Option<Value>,
}

impl ExecuteOutcome {
    fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            result: Some(value::rlm_error_sentinel(&message, "")),
            error: Some(message),
            final_called: false,
            final_value: None,
        }
    }
}

/// Callbacks from the REPL back into the engine.
///
/// This seam breaks the controller↔REPL ownership cycle: the REPL holds the
/// abstract handle, the controller provides the implementation, and tests can
/// mock it.
#[async_trait]
pub trait EngineCallbacks: Send {
    async fn on_log(&mut self, message: String);
    /// Run one sub-agent to completion; always resolves to a string.
    async fn on_sub_query(&mut self, prompt: String, data: Option<Value>) -> String;
    /// Run sub-agents concurrently with allSettled semantics.
    async fn on_sub_batch(&mut self, prompts: Vec<String>) -> Value;
}

/// Handle to one REPL instance. Dropping it disposes the evaluator thread.
pub struct ReplHandle {
    cmd_tx: std_mpsc::Sender<ReplCommand>,
    host_rx: mpsc::UnboundedReceiver<HostCall>,
    driver: Arc<dyn BrowserDriver>,
    limits: Limits,
    poisoned: bool,
    thread: Option<JoinHandle<()>>,
}

impl ReplHandle {
    /// Spawn a fresh evaluator. `recursion_enabled` is false for sub-agents,
    /// whose `llm_query`/`llm_batch` resolve to error strings instead.
    pub fn spawn(
        driver: Arc<dyn BrowserDriver>,
        limits: Limits,
        recursion_enabled: bool,
    ) -> Self {
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let thread_limits = limits.clone();
        let thread = std::thread::Builder::new()
            .name("rlm-repl".to_string())
            .spawn(move || sandbox::run(cmd_rx, host_tx, thread_limits, recursion_enabled))
            .expect("spawn repl thread");
        Self {
            cmd_tx,
            host_rx,
            driver,
            limits,
            poisoned: false,
            thread: Some(thread),
        }
    }

    /// Execute one code block, servicing capability calls until it settles.
    pub async fn execute(
        &mut self,
        code: &str,
        callbacks: &mut dyn EngineCallbacks,
        cancel: &CancellationToken,
    ) -> ExecuteOutcome {
        if self.poisoned {
            return ExecuteOutcome::failed("REPL evaluator unavailable after a timeout");
        }

        let (reply_tx, mut reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ReplCommand::Execute {
                code: code.to_string(),
                reply: reply_tx,
            })
            .is_err()
        {
            self.poisoned = true;
            return ExecuteOutcome::failed("REPL evaluator is gone");
        }

        let timeout = tokio::time::sleep(Duration::from_millis(self.limits.exec_timeout_ms));
        tokio::pin!(timeout);

        // Split the borrow: the host-call pump needs `host_rx` mutably while
        // serving reads `driver`/`limits`.
        let Self {
            host_rx,
            driver,
            limits,
            poisoned,
            ..
        } = self;

        loop {
            tokio::select! {
                outcome = &mut reply_rx => {
                    return outcome.unwrap_or_else(|_| {
                        *poisoned = true;
                        ExecuteOutcome::failed("REPL evaluator crashed")
                    });
                }
                Some(call) = host_rx.recv() => {
                    let result = serve(driver, limits, call.payload, callbacks, cancel).await;
                    let _ = call.reply.send(result);
                }
                _ = &mut timeout => {
                    // Boa cannot be preempted mid-evaluation; abandon the
                    // thread and report the timeout as a captured error.
                    *poisoned = true;
                    warn!(timeout_ms = limits.exec_timeout_ms, "code block timed out");
                    return ExecuteOutcome::failed(format!(
                        "execution timed out after {} ms",
                        limits.exec_timeout_ms
                    ));
                }
            }
        }
    }

    /// Define a global binding inside the sandbox (`__data` for sub-agents).
    pub async fn set_global(&mut self, name: &str, value: Value) {
        if self.poisoned {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ReplCommand::SetGlobal {
                name: name.to_string(),
                value,
                reply: reply_tx,
            })
            .is_err()
        {
            self.poisoned = true;
            return;
        }
        if tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .is_err()
        {
            self.poisoned = true;
        }
    }

    /// Collect variable descriptors for the context builder.
    pub async fn env_metadata(&mut self) -> Vec<VarDescriptor> {
        if self.poisoned {
            return Vec::new();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ReplCommand::EnvMetadata { reply: reply_tx })
            .is_err()
        {
            self.poisoned = true;
            return Vec::new();
        }
        match tokio::time::timeout(Duration::from_secs(5), reply_rx).await {
            Ok(Ok(descriptors)) => descriptors,
            _ => {
                self.poisoned = true;
                Vec::new()
            }
        }
    }

    /// Tear the evaluator down. Also invoked on drop.
    pub fn dispose(&mut self) {
        let _ = self.cmd_tx.send(ReplCommand::Dispose);
        if let Some(thread) = self.thread.take() {
            if self.poisoned {
                // Abandoned thread may be stuck inside an evaluation.
                debug!("leaving poisoned repl thread behind");
            } else {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for ReplHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn serve(
    driver: &Arc<dyn BrowserDriver>,
    limits: &Limits,
    payload: HostCallPayload,
    callbacks: &mut dyn EngineCallbacks,
    cancel: &CancellationToken,
) -> Result<Value, String> {
    if cancel.is_cancelled() {
        return Err("Task cancelled".to_string());
    }
    match payload {
        HostCallPayload::Driver(op) => serve_driver(driver, limits, op, cancel).await,
        HostCallPayload::Log { message } => {
            let mut message = message;
            value::truncate_chars(&mut message, limits.log_max_chars);
            callbacks.on_log(message).await;
            Ok(Value::Null)
        }
        HostCallPayload::Sleep { ms } => {
            let ms = ms.min(limits.sleep_cap_ms);
            tokio::select! {
                _ = cancel.cancelled() => Err("Task cancelled".to_string()),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Value::Null),
            }
        }
        HostCallPayload::SubQuery { prompt, data } => {
            let result = callbacks.on_sub_query(prompt, data).await;
            Ok(Value::String(result))
        }
        HostCallPayload::SubBatch { prompts } => Ok(callbacks.on_sub_batch(prompts).await),
    }
}

async fn serve_driver(
    driver: &Arc<dyn BrowserDriver>,
    limits: &Limits,
    op: DriverOp,
    cancel: &CancellationToken,
) -> Result<Value, String> {
    use rlm_core_types::TabId;

    let run = async {
        match op {
            DriverOp::ListTabs => {
                let tabs = driver.list_tabs().await.map_err(|err| err.to_string())?;
                serde_json::to_value(tabs).map_err(|err| err.to_string())
            }
            DriverOp::ActiveTab => {
                let active = driver.active_tab_id().await.map_err(|err| err.to_string())?;
                Ok(active
                    .map(|id| Value::String(id.0))
                    .unwrap_or(Value::Null))
            }
            DriverOp::OpenTab { url } => {
                let id = driver
                    .open_tab(url.as_deref())
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(Value::String(id.0))
            }
            DriverOp::CloseTab { tab } => {
                driver
                    .close_tab(&TabId(tab))
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            DriverOp::Navigate { tab, url } => {
                driver
                    .navigate(&TabId(tab), &url)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            DriverOp::SwitchTab { tab } => {
                driver
                    .switch_tab(&TabId(tab))
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            DriverOp::WaitForLoad { tab, timeout_ms } => {
                driver
                    .wait_for_load(&TabId(tab), timeout_ms)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            DriverOp::WaitForSelector {
                tab,
                selector,
                timeout_ms,
            } => {
                driver
                    .wait_for_selector(&TabId(tab), &selector, timeout_ms)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            DriverOp::ExecInTab { tab, code } => {
                let deadline = Duration::from_millis(limits.exec_in_tab_timeout_ms);
                let value = tokio::time::timeout(deadline, driver.exec(&TabId(tab), &code))
                    .await
                    .map_err(|_| {
                        format!(
                            "execInTab timed out after {} ms",
                            limits.exec_in_tab_timeout_ms
                        )
                    })?
                    .map_err(|err| err.to_string())?;
                Ok(value::cap_result(value, limits.exec_result_cap))
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err("Task cancelled".to_string()),
        result = run => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockBrowserDriver;
    use serde_json::json;

    struct NoopCallbacks {
        logs: Vec<String>,
    }

    impl NoopCallbacks {
        fn new() -> Self {
            Self { logs: Vec::new() }
        }
    }

    #[async_trait]
    impl EngineCallbacks for NoopCallbacks {
        async fn on_log(&mut self, message: String) {
            self.logs.push(message);
        }

        async fn on_sub_query(&mut self, _prompt: String, _data: Option<Value>) -> String {
            "sub result".to_string()
        }

        async fn on_sub_batch(&mut self, _prompts: Vec<String>) -> Value {
            Value::Array(Vec::new())
        }
    }

    fn spawn_repl() -> ReplHandle {
        ReplHandle::spawn(MockBrowserDriver::with_blank_tab(), Limits::default(), true)
    }

    #[tokio::test]
    async fn evaluates_trailing_expression() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl.execute("1 + 1", &mut callbacks, &cancel).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.and_then(|v| v.as_f64()), Some(2.0));
        assert!(!outcome.final_called);
    }

    #[tokio::test]
    async fn bindings_persist_across_executions() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();

        let first = repl
            .execute("const total = 40;", &mut callbacks, &cancel)
            .await;
        assert!(first.error.is_none());

        let second = repl.execute("total + 2", &mut callbacks, &cancel).await;
        assert_eq!(second.result.and_then(|v| v.as_f64()), Some(42.0));
    }

    #[tokio::test]
    async fn set_final_is_reported() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute("setFinal(\"done\")", &mut callbacks, &cancel)
            .await;
        assert!(outcome.final_called);
        assert_eq!(outcome.final_value, Some(json!("done")));
        // setFinal returns undefined, so the block's result is void.
        assert!(outcome.result.is_none());
    }

    #[tokio::test]
    async fn thrown_errors_become_sentinels() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute("noSuchFunction()", &mut callbacks, &cancel)
            .await;
        let error = outcome.error.expect("captured error");
        assert!(error.contains("noSuchFunction") || error.contains("not defined"));
        let sentinel = outcome.result.expect("sentinel value");
        assert!(value::is_rlm_error(&sentinel));
    }

    #[tokio::test]
    async fn env_metadata_lists_user_variables() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        repl.execute(
            "env.answer = 42; const rows = [\"a\", \"b\"];",
            &mut callbacks,
            &cancel,
        )
        .await;

        let descriptors = repl.env_metadata().await;
        let names: Vec<&str> = descriptors
            .iter()
            .map(|descriptor| descriptor.name.as_str())
            .collect();
        assert!(names.contains(&"env.answer"));
        assert!(names.contains(&"rows"));
        assert!(!names.iter().any(|name| *name == "setFinal"));
    }

    #[tokio::test]
    async fn log_routes_through_callbacks() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        repl.execute("log(\"checkpoint\")", &mut callbacks, &cancel)
            .await;
        assert_eq!(callbacks.logs, vec!["checkpoint".to_string()]);
    }

    #[tokio::test]
    async fn llm_query_resolves_via_callbacks() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute("await llm_query(\"help\")", &mut callbacks, &cancel)
            .await;
        assert_eq!(outcome.result, Some(json!("sub result")));
    }

    #[tokio::test]
    async fn recursion_disabled_returns_error_string() {
        let mut repl = ReplHandle::spawn(
            MockBrowserDriver::with_blank_tab(),
            Limits::default(),
            false,
        );
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute("await llm_query(\"nested\")", &mut callbacks, &cancel)
            .await;
        let text = outcome.result.and_then(|v| v.as_str().map(str::to_string));
        assert!(text.expect("string").starts_with("[SUB-CALL ERROR]"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn oversize_results_are_truncated() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute("\"x\".repeat(150000)", &mut callbacks, &cancel)
            .await;
        let result = outcome.result.expect("value");
        assert!(value::is_truncated(&result));
        assert!(result["originalLength"].as_u64().unwrap() > 100_000);
    }

    #[tokio::test]
    async fn parse_html_and_query() {
        let mut repl = spawn_repl();
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute(
                "const doc = parseHTML(\"<ul><li class='a'>one</li><li>two</li></ul>\");\n\
                 const items = domQueryAll(doc, \"li\");\n\
                 freeDoc(doc);\n\
                 items.map((item) => item.text).join(\"|\")",
                &mut callbacks,
                &cancel,
            )
            .await;
        assert_eq!(outcome.result, Some(json!("one|two")));
    }

    #[tokio::test]
    async fn tab_capabilities_reach_the_driver() {
        let driver = MockBrowserDriver::with_blank_tab();
        let mut repl = ReplHandle::spawn(driver.clone(), Limits::default(), true);
        let mut callbacks = NoopCallbacks::new();
        let cancel = CancellationToken::new();
        let outcome = repl
            .execute(
                "const tab = await openTab(\"https://example.com\");\ntabs.length",
                &mut callbacks,
                &cancel,
            )
            .await;
        assert_eq!(outcome.result.and_then(|v| v.as_f64()), Some(2.0));
        assert_eq!(driver.tab_count(), 2);
    }
}
