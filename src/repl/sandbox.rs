//! Boa-backed evaluator thread.
//!
//! Owns one `Context` per task. Capability functions are plain native
//! functions reading per-thread state; calls that need the host (driver,
//! sub-agents, log, sleep) block this thread on a reply channel while the
//! async side services them. No ambient host access exists inside the
//! context: the registered surface is the whole capability set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;

use boa_engine::{
    js_string,
    object::{builtins::JsPromise, FunctionObjectBuilder, ObjectInitializer},
    property::{Attribute, PropertyDescriptor, PropertyKey},
    builtins::promise::PromiseState,
    Context, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};
use rlm_core_types::DocHandle;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::api;
use super::hoist;
use super::meta::{self, VarDescriptor};
use super::value;
use super::{DriverOp, ExecuteOutcome, HostCall, HostCallPayload, ReplCommand};
use crate::config::Limits;

type NativeFn = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

struct SandboxState {
    host_tx: mpsc::UnboundedSender<HostCall>,
    limits: Limits,
    recursion_enabled: bool,
    final_called: bool,
    final_value: Option<Value>,
    docs: HashMap<DocHandle, (Html, usize)>,
    next_doc: u64,
    doc_bytes: usize,
}

thread_local! {
    static STATE: RefCell<Option<SandboxState>> = const { RefCell::new(None) };
}

// The state is installed before any command is processed and removed after
// the loop exits, so access from natives on this thread is infallible.
fn with_state<R>(f: impl FnOnce(&mut SandboxState) -> R) -> R {
    STATE.with(|cell| f(cell.borrow_mut().as_mut().expect("sandbox state installed")))
}

/// Evaluator thread entry point.
pub(crate) fn run(
    cmd_rx: std_mpsc::Receiver<ReplCommand>,
    host_tx: mpsc::UnboundedSender<HostCall>,
    limits: Limits,
    recursion_enabled: bool,
) {
    let mut context = Context::default();
    context.runtime_limits_mut().set_loop_iteration_limit(4_000_000);
    context.runtime_limits_mut().set_recursion_limit(1_000);

    STATE.with(|cell| {
        *cell.borrow_mut() = Some(SandboxState {
            host_tx,
            limits: limits.clone(),
            recursion_enabled,
            final_called: false,
            final_value: None,
            docs: HashMap::new(),
            next_doc: 1,
            doc_bytes: 0,
        });
    });

    if let Err(err) = register_api(&mut context) {
        error!(%err, "failed to register sandbox API");
        STATE.with(|cell| *cell.borrow_mut() = None);
        return;
    }

    while let Ok(command) = cmd_rx.recv() {
        match command {
            ReplCommand::Execute { code, reply } => {
                let outcome = execute_code(&mut context, &code, &limits);
                let _ = reply.send(outcome);
            }
            ReplCommand::EnvMetadata { reply } => {
                let descriptors = collect_env_metadata(&mut context, &limits);
                let _ = reply.send(descriptors);
            }
            ReplCommand::SetGlobal { name, value, reply } => {
                match JsValue::from_json(&value, &mut context) {
                    Ok(js) => {
                        if let Err(err) = context.register_global_property(
                            JsString::from(name.as_str()),
                            js,
                            Attribute::all(),
                        ) {
                            debug!(%err, name, "failed to define sandbox global");
                        }
                    }
                    Err(err) => debug!(%err, name, "global value not representable"),
                }
                let _ = reply.send(());
            }
            ReplCommand::Dispose => break,
        }
    }

    STATE.with(|cell| *cell.borrow_mut() = None);
}

fn execute_code(context: &mut Context, code: &str, limits: &Limits) -> ExecuteOutcome {
    with_state(|state| {
        state.final_called = false;
        state.final_value = None;
    });

    let hoisted = hoist::hoist(code);
    // Return the trailing expression so the block has a completion value.
    let body = match hoist::split_trailing_expression(&hoisted.code) {
        Some((head, tail)) => format!("{head}\nreturn ({tail});"),
        None => hoisted.code,
    };
    let source = if hoisted.names.is_empty() {
        format!("(async () => {{\n{body}\n}})()")
    } else {
        format!(
            "var {};\n(async () => {{\n{body}\n}})()",
            hoisted.names.join(", ")
        )
    };

    let settled = match context.eval(Source::from_bytes(source.as_bytes())) {
        Ok(evaluated) => settle_promise(evaluated, context),
        Err(err) => Err(err.to_string()),
    };

    let (result, error) = match settled {
        Ok(settled_value) => {
            let json = js_to_json(&settled_value, context);
            (
                json.map(|raw| value::cap_result(raw, limits.exec_result_cap)),
                None,
            )
        }
        Err(message) => (
            Some(value::rlm_error_sentinel(&message, &message)),
            Some(message),
        ),
    };

    let (final_called, final_value) =
        with_state(|state| (state.final_called, state.final_value.clone()));

    ExecuteOutcome {
        result,
        error,
        final_called,
        final_value,
    }
}

/// Drive the job queue and unwrap the wrapper promise.
fn settle_promise(evaluated: JsValue, context: &mut Context) -> Result<JsValue, String> {
    let Some(object) = evaluated.as_object() else {
        return Ok(evaluated);
    };
    let Ok(promise) = JsPromise::from_object(object.clone()) else {
        return Ok(evaluated);
    };
    context.run_jobs();
    match promise.state() {
        PromiseState::Fulfilled(settled) => Ok(settled),
        PromiseState::Rejected(reason) => {
            let err = JsError::from_opaque(reason.clone());
            Err(match err.try_native(context) {
                Ok(native) => native.to_string(),
                Err(_) => reason.display().to_string(),
            })
        }
        // Host capabilities resolve synchronously from the sandbox's point of
        // view, so a pending promise means user code awaited something that
        // can never settle.
        PromiseState::Pending => Err("async execution did not settle".to_string()),
    }
}

fn js_to_json(js: &JsValue, context: &mut Context) -> Option<Value> {
    if js.is_undefined() {
        return None;
    }
    match js.to_json(context) {
        Ok(raw) => Some(raw),
        Err(_) => Some(Value::String(js.display().to_string())),
    }
}

fn js_err(message: impl Into<String>) -> JsError {
    JsNativeError::error().with_message(message.into()).into()
}

fn host_call(payload: HostCallPayload) -> Result<Value, String> {
    let (reply_tx, reply_rx) = std_mpsc::channel();
    let sent = with_state(|state| {
        state
            .host_tx
            .send(HostCall {
                payload,
                reply: reply_tx,
            })
            .is_ok()
    });
    if !sent {
        return Err("engine disconnected".to_string());
    }
    reply_rx
        .recv()
        .map_err(|_| "engine disconnected".to_string())?
}

fn dispatch(payload: HostCallPayload, context: &mut Context) -> JsResult<JsValue> {
    match host_call(payload) {
        Ok(raw) => JsValue::from_json(&raw, context),
        Err(message) => Err(js_err(message)),
    }
}

// ---- argument helpers -------------------------------------------------------

fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or_default()
}

fn arg_str(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(arg(args, index).to_string(context)?.to_std_string_escaped())
}

fn arg_opt_str(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<Option<String>> {
    let js = arg(args, index);
    if js.is_undefined() || js.is_null() {
        Ok(None)
    } else {
        Ok(Some(js.to_string(context)?.to_std_string_escaped()))
    }
}

fn arg_u64_or(args: &[JsValue], index: usize, default: u64, context: &mut Context) -> JsResult<u64> {
    let js = arg(args, index);
    if js.is_undefined() || js.is_null() {
        Ok(default)
    } else {
        let number = js.to_number(context)?;
        Ok(if number.is_finite() && number > 0.0 {
            number as u64
        } else {
            default
        })
    }
}

// ---- tab management ---------------------------------------------------------

fn api_tabs(_this: &JsValue, _args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    dispatch(HostCallPayload::Driver(DriverOp::ListTabs), context)
}

fn api_active_tab(_this: &JsValue, _args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    dispatch(HostCallPayload::Driver(DriverOp::ActiveTab), context)
}

fn api_open_tab(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = arg_opt_str(args, 0, context)?;
    dispatch(HostCallPayload::Driver(DriverOp::OpenTab { url }), context)
}

fn api_close_tab(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    dispatch(HostCallPayload::Driver(DriverOp::CloseTab { tab }), context)
}

fn api_navigate(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let url = arg_str(args, 1, context)?;
    dispatch(HostCallPayload::Driver(DriverOp::Navigate { tab, url }), context)
}

fn api_switch_tab(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    dispatch(HostCallPayload::Driver(DriverOp::SwitchTab { tab }), context)
}

fn api_wait_for_load(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let default = with_state(|state| state.limits.wait_timeout_ms);
    let timeout_ms = arg_u64_or(args, 1, default, context)?;
    dispatch(
        HostCallPayload::Driver(DriverOp::WaitForLoad { tab, timeout_ms }),
        context,
    )
}

fn api_wait_for_selector(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_str(args, 1, context)?;
    let default = with_state(|state| state.limits.wait_timeout_ms);
    let timeout_ms = arg_u64_or(args, 2, default, context)?;
    dispatch(
        HostCallPayload::Driver(DriverOp::WaitForSelector {
            tab,
            selector,
            timeout_ms,
        }),
        context,
    )
}

// ---- DOM introspection ------------------------------------------------------

fn exec_snippet(tab: String, code: String, context: &mut Context) -> JsResult<JsValue> {
    dispatch(
        HostCallPayload::Driver(DriverOp::ExecInTab { tab, code }),
        context,
    )
}

fn api_exec_in_tab(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let code = arg_str(args, 1, context)?;
    exec_snippet(tab, code, context)
}

fn api_get_text(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_opt_str(args, 1, context)?;
    exec_snippet(tab, api::snippet_get_text(selector.as_deref()), context)
}

fn api_get_dom(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_opt_str(args, 1, context)?;
    exec_snippet(tab, api::snippet_get_dom(selector.as_deref()), context)
}

fn api_get_links(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    exec_snippet(tab, api::snippet_get_links(), context)
}

fn api_get_inputs(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    exec_snippet(tab, api::snippet_get_inputs(), context)
}

fn api_query_selector(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_str(args, 1, context)?;
    exec_snippet(tab, api::snippet_query_selector(&selector), context)
}

fn api_query_selector_all(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_str(args, 1, context)?;
    exec_snippet(tab, api::snippet_query_selector_all(&selector), context)
}

fn api_get_search_results(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    exec_snippet(tab, api::snippet_search_results(), context)
}

fn api_get_wiki_tables(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    exec_snippet(tab, api::snippet_wiki_tables(), context)
}

// ---- browser actions --------------------------------------------------------

fn api_click(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_str(args, 1, context)?;
    exec_snippet(tab, api::snippet_click(&selector), context)
}

fn api_type(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_str(args, 1, context)?;
    let text = arg_str(args, 2, context)?;
    exec_snippet(tab, api::snippet_type(&selector, &text), context)
}

fn api_scroll(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let direction = arg_opt_str(args, 1, context)?.unwrap_or_else(|| "down".to_string());
    let amount = arg_u64_or(args, 2, 500, context)? as f64;
    exec_snippet(tab, api::snippet_scroll(&direction, amount), context)
}

// ---- host DOM parsing -------------------------------------------------------

fn store_document(html: &str) -> Result<DocHandle, String> {
    with_state(|state| {
        let size = html.len();
        if state.doc_bytes + size > state.limits.repl_memory_limit_bytes {
            return Err(format!(
                "document store over its {} byte limit; freeDoc unused handles first",
                state.limits.repl_memory_limit_bytes
            ));
        }
        let handle = DocHandle(state.next_doc);
        state.next_doc += 1;
        state.doc_bytes += size;
        state.docs.insert(handle, (Html::parse_document(html), size));
        Ok(handle)
    })
}

fn api_parse_html(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let html = arg_str(args, 0, context)?;
    let handle = store_document(&html).map_err(js_err)?;
    Ok(JsValue::from(handle.0 as f64))
}

fn api_parse_page(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let tab = arg_str(args, 0, context)?;
    let selector = arg_opt_str(args, 1, context)?;
    let snippet = api::snippet_get_dom(selector.as_deref());
    let raw = host_call(HostCallPayload::Driver(DriverOp::ExecInTab {
        tab,
        code: snippet,
    }))
    .map_err(js_err)?;
    let Some(html) = raw.as_str() else {
        return Err(js_err("selector matched nothing on the page"));
    };
    let handle = store_document(html).map_err(js_err)?;
    Ok(JsValue::from(handle.0 as f64))
}

fn doc_handle_arg(args: &[JsValue], context: &mut Context) -> JsResult<DocHandle> {
    let number = arg(args, 0).to_number(context)?;
    if number.is_finite() && number >= 0.0 {
        Ok(DocHandle(number as u64))
    } else {
        Err(js_err("invalid document handle"))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, String> {
    Selector::parse(selector).map_err(|err| format!("invalid selector {selector:?}: {err}"))
}

fn serialize_element(element: scraper::ElementRef<'_>) -> Value {
    let mut text: String = element.text().collect::<Vec<_>>().join(" ");
    text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    value::truncate_chars(&mut text, 500);
    let attrs: serde_json::Map<String, Value> = element
        .value()
        .attrs()
        .map(|(name, attr)| (name.to_string(), Value::String(attr.to_string())))
        .collect();
    json!({
        "tag": element.value().name(),
        "id": element.value().attr("id").unwrap_or(""),
        "className": element.value().attr("class").unwrap_or(""),
        "text": text,
        "attrs": attrs,
    })
}

fn with_doc<R>(handle: DocHandle, f: impl FnOnce(&Html) -> R) -> Result<R, String> {
    with_state(|state| {
        state
            .docs
            .get(&handle)
            .map(|(document, _)| f(document))
            .ok_or_else(|| format!("unknown document handle {handle}"))
    })
}

fn api_dom_query_all(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let handle = doc_handle_arg(args, context)?;
    let selector_text = arg_str(args, 1, context)?;
    let selector = parse_selector(&selector_text).map_err(js_err)?;
    let items = with_doc(handle, |document| {
        document
            .select(&selector)
            .map(serialize_element)
            .collect::<Vec<_>>()
    })
    .map_err(js_err)?;
    JsValue::from_json(&Value::Array(items), context)
}

fn api_dom_query_one(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let handle = doc_handle_arg(args, context)?;
    let selector_text = arg_str(args, 1, context)?;
    let selector = parse_selector(&selector_text).map_err(js_err)?;
    let found = with_doc(handle, |document| {
        document.select(&selector).next().map(|element| {
            let mut serialized = serialize_element(element);
            let mut inner = element.inner_html();
            value::truncate_chars(&mut inner, 2_000);
            serialized["innerHTML"] = Value::String(inner);
            serialized["childCount"] =
                Value::from(element.children().filter(|child| child.value().is_element()).count());
            serialized
        })
    })
    .map_err(js_err)?;
    match found {
        Some(serialized) => JsValue::from_json(&serialized, context),
        None => Ok(JsValue::null()),
    }
}

fn api_dom_text(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let handle = doc_handle_arg(args, context)?;
    let selector_text = arg_opt_str(args, 1, context)?;
    let text = with_doc(handle, |document| match &selector_text {
        Some(selector_text) => match parse_selector(selector_text) {
            Ok(selector) => Ok(document
                .select(&selector)
                .map(|element| element.text().collect::<String>())
                .collect::<Vec<_>>()
                .join("\n")),
            Err(err) => Err(err),
        },
        None => Ok(document.root_element().text().collect::<String>()),
    })
    .map_err(js_err)?
    .map_err(js_err)?;
    Ok(JsValue::from(JsString::from(text.as_str())))
}

fn api_free_doc(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let handle = doc_handle_arg(args, context)?;
    with_state(|state| {
        if let Some((_, size)) = state.docs.remove(&handle) {
            state.doc_bytes = state.doc_bytes.saturating_sub(size);
        }
    });
    Ok(JsValue::undefined())
}

// ---- recursion --------------------------------------------------------------

fn api_llm_query(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    if !with_state(|state| state.recursion_enabled) {
        return Ok(JsValue::from(js_string!(
            "[SUB-CALL ERROR] Sub-agents cannot spawn further sub-agents."
        )));
    }
    let prompt = arg_str(args, 0, context)?;
    let data = {
        let js = arg(args, 1);
        js_to_json(&js, context)
    };
    match host_call(HostCallPayload::SubQuery { prompt, data }) {
        Ok(raw) => JsValue::from_json(&raw, context),
        Err(message) => Err(js_err(message)),
    }
}

fn api_llm_batch(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    if !with_state(|state| state.recursion_enabled) {
        return Ok(JsValue::from(js_string!(
            "[SUB-CALL ERROR] Sub-agents cannot spawn further sub-agents."
        )));
    }
    let list = arg(args, 0);
    let Some(Value::Array(items)) = js_to_json(&list, context) else {
        return Err(js_err("llm_batch expects an array of prompt strings"));
    };
    let prompts: Vec<String> = items
        .into_iter()
        .map(|item| match item {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect();
    match host_call(HostCallPayload::SubBatch { prompts }) {
        Ok(raw) => JsValue::from_json(&raw, context),
        Err(message) => Err(js_err(message)),
    }
}

// ---- state & output ---------------------------------------------------------

fn api_set_final(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let js = arg(args, 0);
    let final_value = js_to_json(&js, context).unwrap_or(Value::Null);
    with_state(|state| {
        state.final_called = true;
        state.final_value = Some(final_value);
    });
    Ok(JsValue::undefined())
}

fn api_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let js = arg(args, 0);
    let message = match js_to_json(&js, context) {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => "undefined".to_string(),
    };
    host_call(HostCallPayload::Log { message }).map_err(js_err)?;
    Ok(JsValue::undefined())
}

fn api_sleep(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let ms = arg_u64_or(args, 0, 0, context)?;
    host_call(HostCallPayload::Sleep { ms }).map_err(js_err)?;
    Ok(JsValue::undefined())
}

// ---- registration -----------------------------------------------------------

fn register_fn(context: &mut Context, name: &str, length: usize, f: NativeFn) -> JsResult<()> {
    context.register_global_callable(
        JsString::from(name),
        length,
        NativeFunction::from_fn_ptr(f),
    )
}

fn register_getter(context: &mut Context, name: &str, f: NativeFn) -> JsResult<()> {
    let getter = FunctionObjectBuilder::new(context.realm(), NativeFunction::from_fn_ptr(f))
        .name(JsString::from(name))
        .length(0)
        .build();
    let descriptor = PropertyDescriptor::builder()
        .get(getter)
        .enumerable(false)
        .configurable(true)
        .build();
    context
        .global_object()
        .define_property_or_throw(JsString::from(name), descriptor, context)?;
    Ok(())
}

fn register_api(context: &mut Context) -> JsResult<()> {
    let env = ObjectInitializer::new(context).build();
    context.register_global_property(js_string!("env"), env, Attribute::all())?;

    register_getter(context, "tabs", api_tabs)?;
    register_getter(context, "activeTab", api_active_tab)?;

    register_fn(context, "openTab", 1, api_open_tab)?;
    register_fn(context, "closeTab", 1, api_close_tab)?;
    register_fn(context, "navigate", 2, api_navigate)?;
    register_fn(context, "switchTab", 1, api_switch_tab)?;
    register_fn(context, "waitForLoad", 2, api_wait_for_load)?;
    register_fn(context, "waitForSelector", 3, api_wait_for_selector)?;

    register_fn(context, "execInTab", 2, api_exec_in_tab)?;
    register_fn(context, "getText", 2, api_get_text)?;
    register_fn(context, "getDOM", 2, api_get_dom)?;
    register_fn(context, "getLinks", 1, api_get_links)?;
    register_fn(context, "getInputs", 1, api_get_inputs)?;
    register_fn(context, "querySelector", 2, api_query_selector)?;
    register_fn(context, "querySelectorAll", 2, api_query_selector_all)?;
    register_fn(context, "getSearchResults", 1, api_get_search_results)?;
    register_fn(context, "getWikiTables", 1, api_get_wiki_tables)?;

    register_fn(context, "click", 2, api_click)?;
    register_fn(context, "type", 3, api_type)?;
    register_fn(context, "scroll", 3, api_scroll)?;

    register_fn(context, "parseHTML", 1, api_parse_html)?;
    register_fn(context, "parsePage", 2, api_parse_page)?;
    register_fn(context, "domQueryAll", 2, api_dom_query_all)?;
    register_fn(context, "domQueryOne", 2, api_dom_query_one)?;
    register_fn(context, "domText", 2, api_dom_text)?;
    register_fn(context, "freeDoc", 1, api_free_doc)?;

    register_fn(context, "llm_query", 2, api_llm_query)?;
    register_fn(context, "llm_batch", 1, api_llm_batch)?;

    register_fn(context, "setFinal", 1, api_set_final)?;
    register_fn(context, "log", 1, api_log)?;
    register_fn(context, "sleep", 1, api_sleep)?;

    Ok(())
}

// ---- metadata ---------------------------------------------------------------

fn collect_env_metadata(context: &mut Context, limits: &Limits) -> Vec<VarDescriptor> {
    let mut descriptors = Vec::new();
    let global = context.global_object();

    if let Ok(env_value) = global.get(js_string!("env"), context) {
        if let Some(env_object) = env_value.as_object() {
            if let Ok(keys) = env_object.own_property_keys(context) {
                for key in keys {
                    let PropertyKey::String(name) = &key else {
                        continue;
                    };
                    let name = name.to_std_string_escaped();
                    let Ok(js) = env_object.get(key.clone(), context) else {
                        continue;
                    };
                    if let Some(raw) = js_to_json(&js, context) {
                        descriptors.push(meta::describe(&format!("env.{name}"), &raw, limits));
                    }
                }
            }
        }
    }

    if let Ok(keys) = global.own_property_keys(context) {
        for key in keys {
            let PropertyKey::String(name) = &key else {
                continue;
            };
            let name = name.to_std_string_escaped();
            if api::API_NAMES.contains(&name.as_str())
                || api::GLOBAL_ALLOWLIST.contains(&name.as_str())
            {
                continue;
            }
            let Ok(js) = global.get(key.clone(), context) else {
                continue;
            };
            if js.is_undefined() {
                continue;
            }
            if js.as_object().map(|object| object.is_callable()).unwrap_or(false) {
                continue;
            }
            if let Some(raw) = js_to_json(&js, context) {
                descriptors.push(meta::describe(&name, &raw, limits));
            }
        }
    }

    descriptors
}
