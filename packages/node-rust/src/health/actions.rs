//! Reactions to a dependency becoming unavailable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::{ActionConfig, ActionKind};
use crate::error::{ActionError, ComponentUnavailableError, UnavailableKind};
use crate::lifecycle::NodeLifecycle;

/// One reaction to a [`ComponentUnavailableError`].
#[async_trait]
pub trait UnavailableAction: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn execute(&self, trigger: &ComponentUnavailableError) -> Result<(), ActionError>;
}

// ---------------------------------------------------------------------------
// CompositeAction
// ---------------------------------------------------------------------------

/// Runs actions in order, each in its own task bounded by `timeout`.
///
/// A failing or hung action does not stop the ones after it; a hung one is
/// aborted when its timeout fires. Once all have run the trigger is returned
/// as [`ActionError::Trigger`].
pub struct CompositeAction {
    actions: Vec<Arc<dyn UnavailableAction>>,
    timeout: Duration,
}

impl CompositeAction {
    /// Creates a composite running `actions` in order, each bounded by `timeout`.
    pub fn new(actions: Vec<Arc<dyn UnavailableAction>>, timeout: Duration) -> Self {
        Self { actions, timeout }
    }

    /// Names of the wrapped actions, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    async fn run_one(
        &self,
        action: &Arc<dyn UnavailableAction>,
        trigger: &ComponentUnavailableError,
    ) -> Result<(), ActionError> {
        let name = action.name();
        let task = {
            let action = Arc::clone(action);
            let trigger = trigger.clone();
            tokio::spawn(async move { action.execute(&trigger).await })
        };
        let abort = task.abort_handle();

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ActionError::Failed {
                action: name.to_string(),
                reason: join.to_string(),
            }),
            Err(_) => {
                abort.abort();
                Err(ActionError::TimedOut {
                    action: name.to_string(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

impl fmt::Debug for CompositeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAction")
            .field("actions", &self.names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl UnavailableAction for CompositeAction {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn execute(&self, trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
        for action in &self.actions {
            match self.run_one(action, trigger).await {
                Ok(()) => debug!(action = action.name(), "action completed"),
                Err(e) => warn!(action = action.name(), error = %e, "action did not complete"),
            }
        }
        Err(ActionError::Trigger(trigger.clone()))
    }
}

// ---------------------------------------------------------------------------
// TerminateAction / DrainAction
// ---------------------------------------------------------------------------

type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// Exits the process.
pub struct TerminateAction {
    code: i32,
    exit: ExitFn,
}

impl TerminateAction {
    /// Creates an action exiting with `code`.
    #[must_use]
    pub fn new(code: i32) -> Self {
        Self {
            code,
            exit: Arc::new(|code| std::process::exit(code)),
        }
    }

    /// Replaces `std::process::exit`.
    #[must_use]
    pub fn with_exit(mut self, exit: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit = Arc::new(exit);
        self
    }

    /// Exit code passed to the process.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.code
    }
}

impl Default for TerminateAction {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for TerminateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminateAction")
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UnavailableAction for TerminateAction {
    fn name(&self) -> &'static str {
        "terminate"
    }

    async fn execute(&self, trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
        error!(code = self.code, component = %trigger.component, "terminating process");
        (self.exit)(self.code);
        Ok(())
    }
}

/// Stops the node taking new work.
#[derive(Debug)]
pub struct DrainAction {
    lifecycle: Arc<NodeLifecycle>,
}

impl DrainAction {
    /// Creates an action draining `lifecycle`.
    pub fn new(lifecycle: Arc<NodeLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl UnavailableAction for DrainAction {
    fn name(&self) -> &'static str {
        "drain"
    }

    async fn execute(&self, trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
        if self.lifecycle.begin_drain() {
            info!(component = %trigger.component, "draining after dependency loss");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// UnavailableHandler
// ---------------------------------------------------------------------------

/// Maps each [`UnavailableKind`] to the action that reacts to it.
#[derive(Default)]
pub struct UnavailableHandler {
    actions: HashMap<UnavailableKind, Arc<dyn UnavailableAction>>,
}

impl UnavailableHandler {
    /// Creates a handler with no actions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `kind` to `action`, replacing any previous mapping.
    #[must_use]
    pub fn with(mut self, kind: UnavailableKind, action: Arc<dyn UnavailableAction>) -> Self {
        self.actions.insert(kind, action);
        self
    }

    /// One [`CompositeAction`] per configured kind.
    #[must_use]
    pub fn from_config(config: &ActionConfig, lifecycle: &Arc<NodeLifecycle>) -> Self {
        let mut handler = Self::new();
        for (kind, kinds) in &config.policies {
            let actions = kinds
                .iter()
                .map(|k| -> Arc<dyn UnavailableAction> {
                    match k {
                        ActionKind::Drain => Arc::new(DrainAction::new(Arc::clone(lifecycle))),
                        ActionKind::Terminate => Arc::new(TerminateAction::new(config.exit_code)),
                    }
                })
                .collect();
            handler = handler.with(
                *kind,
                Arc::new(CompositeAction::new(actions, config.action_timeout)),
            );
        }
        handler
    }

    /// Action configured for `kind`, if any.
    #[must_use]
    pub fn action_for(&self, kind: UnavailableKind) -> Option<&Arc<dyn UnavailableAction>> {
        self.actions.get(&kind)
    }

    /// Logs `unavailable` and runs the action configured for its kind.
    pub async fn handle(&self, unavailable: &ComponentUnavailableError) {
        error!(
            severity = "critical",
            kind = %unavailable.kind,
            component = %unavailable.component,
            reason = %unavailable.reason,
            "component unavailable"
        );
        let Some(action) = self.actions.get(&unavailable.kind) else {
            warn!(kind = %unavailable.kind, "no action configured");
            return;
        };
        match action.execute(unavailable).await {
            Ok(()) | Err(ActionError::Trigger(_)) => {
                debug!(action = action.name(), "unavailability handled");
            }
            Err(e) => error!(action = action.name(), error = %e, "unavailability action failed"),
        }
    }
}

impl fmt::Debug for UnavailableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.actions.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("UnavailableHandler")
            .field("kinds", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::lifecycle::NodeState;

    fn trigger() -> ComponentUnavailableError {
        ComponentUnavailableError::new(UnavailableKind::Executable, "ffmpeg", "not on PATH")
    }

    /// Appends its name to a shared log when run.
    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl UnavailableAction for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, _trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    /// Never finishes; flags whether it was dropped (aborted).
    struct Hang {
        aborted: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UnavailableAction for Hang {
        fn name(&self) -> &'static str {
            "hang"
        }

        async fn execute(&self, _trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
            let _flag = SetOnDrop(Arc::clone(&self.aborted));
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl UnavailableAction for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        async fn execute(&self, _trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
            Err(ActionError::Failed {
                action: "fail".to_string(),
                reason: "boom".to_string(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // CompositeAction
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn slow_action_is_aborted_and_the_rest_still_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let aborted = Arc::new(AtomicBool::new(false));
        let composite = CompositeAction::new(
            vec![
                Arc::new(Record { name: "first", log: Arc::clone(&log) }),
                Arc::new(Hang { aborted: Arc::clone(&aborted) }),
                Arc::new(Fail),
                Arc::new(Record { name: "last", log: Arc::clone(&log) }),
            ],
            Duration::from_millis(200),
        );

        let started = tokio::time::Instant::now();
        let result = composite.execute(&trigger()).await;

        assert!(matches!(result, Err(ActionError::Trigger(ref t)) if *t == trigger()));
        assert_eq!(*log.lock(), vec!["first", "last"]);
        assert!(started.elapsed() < Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn run_one_reports_timeout() {
        let composite = CompositeAction::new(vec![], Duration::from_millis(50));
        let hang: Arc<dyn UnavailableAction> = Arc::new(Hang {
            aborted: Arc::new(AtomicBool::new(false)),
        });
        let err = composite.run_one(&hang, &trigger()).await.unwrap_err();
        assert!(
            matches!(err, ActionError::TimedOut { ref action, timeout_ms: 50 } if action == "hang"),
            "{err}"
        );
    }

    // -----------------------------------------------------------------------
    // Terminate / Drain
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn terminate_calls_exit_with_code() {
        let code = Arc::new(AtomicI32::new(-1));
        let seen = Arc::clone(&code);
        let action = TerminateAction::new(7).with_exit(move |c| seen.store(c, Ordering::SeqCst));

        action.execute(&trigger()).await.unwrap();
        assert_eq!(code.load(Ordering::SeqCst), 7);
        assert_eq!(TerminateAction::default().code(), 1);
    }

    #[tokio::test]
    async fn drain_moves_lifecycle_to_draining() {
        let lifecycle = Arc::new(NodeLifecycle::new());
        lifecycle.set_ready();
        DrainAction::new(Arc::clone(&lifecycle))
            .execute(&trigger())
            .await
            .unwrap();
        assert_eq!(lifecycle.state(), NodeState::Draining);
    }

    // -----------------------------------------------------------------------
    // UnavailableHandler
    // -----------------------------------------------------------------------

    struct Count(Arc<AtomicU32>);

    #[async_trait]
    impl UnavailableAction for Count {
        fn name(&self) -> &'static str {
            "count"
        }

        async fn execute(&self, _trigger: &ComponentUnavailableError) -> Result<(), ActionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_runs_only_the_mapped_kind() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = UnavailableHandler::new()
            .with(UnavailableKind::Executable, Arc::new(Count(Arc::clone(&calls))));

        handler.handle(&trigger()).await;
        handler
            .handle(&ComponentUnavailableError::new(
                UnavailableKind::Broker,
                "tcp://broker",
                "refused",
            ))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_config_builds_one_composite_per_kind() {
        let lifecycle = Arc::new(NodeLifecycle::new());
        let handler = UnavailableHandler::from_config(&ActionConfig::default(), &lifecycle);

        assert_eq!(
            handler.action_for(UnavailableKind::Executable).map(|a| a.name()),
            Some("composite")
        );
        assert!(handler.action_for(UnavailableKind::Configuration).is_some());
        assert!(handler.action_for(UnavailableKind::RemoteService).is_none());
    }

    #[tokio::test]
    async fn configured_drain_runs_through_handler() {
        let lifecycle = Arc::new(NodeLifecycle::new());
        let mut config = ActionConfig::default();
        config.policies.clear();
        config
            .policies
            .insert(UnavailableKind::ContentStore, vec![ActionKind::Drain]);
        let handler = UnavailableHandler::from_config(&config, &lifecycle);

        handler
            .handle(&ComponentUnavailableError::new(
                UnavailableKind::ContentStore,
                "s3",
                "unreachable",
            ))
            .await;
        assert_eq!(lifecycle.state(), NodeState::Draining);
    }
}
