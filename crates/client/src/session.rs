use std::sync::{Arc, Mutex};

use sfq_common::{CancelFlag, EngineConfig, QueryRuntime};
use sfq_engine::{LambdaChannel, Planner};

/// Shared state behind every lazy handle: configuration, the runtime
/// (query lock + cancel flag), the planner, and an optional lambda channel
/// for externally evaluated transforms.
pub struct Session {
    config: EngineConfig,
    runtime: Arc<QueryRuntime>,
    planner: Planner,
    lambda: Mutex<Option<Arc<dyn LambdaChannel>>>,
}

pub type SharedSession = Arc<Session>;

impl Session {
    /// A session on the process-wide runtime.
    pub fn new(config: EngineConfig) -> SharedSession {
        Self::with_runtime(config, QueryRuntime::global())
    }

    /// A session on an isolated runtime (tests mostly).
    pub fn with_runtime(config: EngineConfig, runtime: Arc<QueryRuntime>) -> SharedSession {
        let planner = Planner::new(runtime.clone(), config.clone());
        Arc::new(Session {
            config,
            runtime,
            planner,
            lambda: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        self.runtime.cancel_flag()
    }

    /// Install the channel used by externally evaluated transforms.
    pub fn set_lambda_channel(&self, channel: Arc<dyn LambdaChannel>) {
        *self.lambda.lock().expect("lambda channel lock poisoned") = Some(channel);
    }

    pub fn lambda_channel(&self) -> Option<Arc<dyn LambdaChannel>> {
        self.lambda
            .lock()
            .expect("lambda channel lock poisoned")
            .clone()
    }
}
