//! Engine facade: one task slot, an event bus, and the public control API.

mod controller;
mod subagent;

pub use subagent::SubCallLedger;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rlm_event_bus::InMemoryBus;

use crate::browser::BrowserDriver;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::events::{EngineEvent, TaskState, TaskStatus};
use crate::llm::{build_model_client, ModelClient};
use crate::store::KvStore;
use crate::trace::TraceLog;

use controller::TaskController;

const EVENT_BUS_CAPACITY: usize = 4_096;

/// An owned engine instance: at most one running task, constructed with an
/// explicit configuration and referenced by the embedding layer through a
/// single handle.
pub struct Engine {
    config: EngineConfig,
    driver: Arc<dyn BrowserDriver>,
    clients: Mutex<Option<(Arc<dyn ModelClient>, Arc<dyn ModelClient>)>>,
    bus: Arc<InMemoryBus<EngineEvent>>,
    state: Arc<Mutex<TaskState>>,
    running: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
    kv: Option<KvStore>,
    /// Latest answer to a sensitive-action confirmation prompt. Recorded for
    /// the future driver-level gating hook; nothing consumes it yet.
    confirmation: Mutex<Option<bool>>,
}

impl Engine {
    /// Build an engine that instantiates model clients from the configuration
    /// at submit time.
    pub fn new(config: EngineConfig, driver: Arc<dyn BrowserDriver>) -> Arc<Self> {
        Self::build(config, driver, None)
    }

    /// Build an engine with injected model clients (tests, offline runs).
    pub fn with_model_clients(
        config: EngineConfig,
        driver: Arc<dyn BrowserDriver>,
        primary: Arc<dyn ModelClient>,
        sub: Arc<dyn ModelClient>,
    ) -> Arc<Self> {
        Self::build(config, driver, Some((primary, sub)))
    }

    fn build(
        config: EngineConfig,
        driver: Arc<dyn BrowserDriver>,
        clients: Option<(Arc<dyn ModelClient>, Arc<dyn ModelClient>)>,
    ) -> Arc<Self> {
        let config = config.normalized();
        let bus = InMemoryBus::new(EVENT_BUS_CAPACITY);
        if let Some(path) = &config.trace_path {
            TraceLog::attach(Arc::clone(&bus), path.clone());
        }
        let kv = config
            .store_path
            .as_ref()
            .and_then(|path| match KvStore::open(path.clone()) {
                Ok(store) => Some(store),
                Err(err) => {
                    debug!(%err, "key-value store unavailable");
                    None
                }
            });
        Arc::new(Self {
            config,
            driver,
            clients: Mutex::new(clients),
            bus,
            state: Arc::new(Mutex::new(TaskState::default())),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancellationToken::new()),
            kv,
            confirmation: Mutex::new(None),
        })
    }

    /// Subscribe to the ordered event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Current task state snapshot.
    pub fn get_state(&self) -> TaskState {
        self.state.lock().clone()
    }

    /// Submit a task. Fails with [`EngineError::TaskBusy`] while one runs;
    /// configuration problems surface as `error` + `complete{null}` events.
    pub fn submit_task(self: &Arc<Self>, message: &str) -> Result<(), EngineError> {
        let goal = message.trim();
        if goal.is_empty() {
            return Err(EngineError::invalid_task("task message is empty"));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::TaskBusy);
        }

        let clients = {
            let injected = self.clients.lock().clone();
            match injected {
                Some(pair) => Ok(pair),
                None => build_model_client(&self.config, &self.config.primary_model).and_then(
                    |primary| {
                        build_model_client(&self.config, self.config.sub_model())
                            .map(|sub| (primary, sub))
                    },
                ),
            }
        };
        let (primary, sub) = match clients {
            Ok(pair) => pair,
            Err(err) => {
                // Never raise across the event boundary: report and settle.
                self.state.lock().status = TaskStatus::Error;
                self.bus.emit(EngineEvent::Error {
                    error: err.to_string(),
                });
                self.bus.emit(EngineEvent::Complete { final_value: None });
                self.running.store(false, Ordering::SeqCst);
                return Ok(());
            }
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        {
            let mut state = self.state.lock();
            *state = TaskState {
                status: TaskStatus::Running,
                goal: Some(goal.to_string()),
                iteration: 0,
                final_value: None,
            };
        }

        let controller = TaskController {
            config: self.config.clone(),
            driver: Arc::clone(&self.driver),
            client: primary,
            sub_client: sub,
            bus: Arc::clone(&self.bus),
            cancel,
            state: Arc::clone(&self.state),
        };
        let running = Arc::clone(&self.running);
        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let goal = goal.to_string();
        tokio::spawn(async move {
            // Safety net: a panic inside the loop must still settle the
            // stream instead of leaving the observer hanging.
            let run = std::panic::AssertUnwindSafe(controller.run(goal)).catch_unwind();
            if run.await.is_err() {
                state.lock().status = TaskStatus::Error;
                bus.emit(EngineEvent::Error {
                    error: "internal engine failure".to_string(),
                });
                bus.emit(EngineEvent::Complete { final_value: None });
            }
            running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Request cooperative cancellation.
    ///
    /// Never silent: if no task is in flight (the loop already exited on its
    /// own), a `complete` event is re-emitted so the observer can reset.
    pub fn cancel(&self) {
        if self.running.load(Ordering::SeqCst) {
            info!("cancelling running task");
            self.cancel.lock().cancel();
        } else {
            let mut state = self.state.lock();
            state.status = TaskStatus::Cancelled;
            drop(state);
            self.bus.emit(EngineEvent::Complete {
                final_value: Some(Value::String("Task cancelled by user.".to_string())),
            });
        }
    }

    /// Record the user's answer to a sensitive-action confirmation prompt.
    pub fn confirmation_response(&self, approved: bool) {
        debug!(approved, "confirmation response recorded");
        *self.confirmation.lock() = Some(approved);
    }

    /// Persist a value in the cross-task key-value store.
    pub fn store(&self, key: &str, value: Value) -> Result<(), EngineError> {
        match &self.kv {
            Some(store) => store.put(key, value),
            None => Err(EngineError::storage("no store configured")),
        }
    }

    /// Read a value from the cross-task key-value store.
    pub fn retrieve(&self, key: &str) -> Result<Option<Value>, EngineError> {
        match &self.kv {
            Some(store) => store.get(key),
            None => Err(EngineError::storage("no store configured")),
        }
    }
}
