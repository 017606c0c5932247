use crate::{
    alert::{
        action::ActionExecutor,
        condition::ConditionError,
        provider::MetricProvider,
        throttle::Throttler,
        AdvancedAlertRule, AlertInstance, AlertStatus,
    },
    hub::{Hub, MessageKind, StreamMessage},
    logging::event,
    metrics::AlertMetricsCollector,
    ErrorClassification,
};
use chrono::Utc;
use slog::{error, info, o, warn, Logger};
use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
    time::Duration,
};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule id must not be empty")]
    EmptyId,
    #[error("rule {0} has no actions")]
    NoActions(String),
    #[error(transparent)]
    Condition(#[from] ConditionError),
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("alert instance {0} not found")]
    NotFound(String),
    #[error("cannot {action} an instance in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: AlertStatus,
    },
}

/// Why an evaluation cycle did or did not fire a rule. Gates that hold a
/// rule back are ordinary outcomes, not errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuleOutcome {
    Fired { instance_id: String },
    Disabled,
    ScheduleInactive,
    ConditionFalse,
    Throttled,
}

impl RuleOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, RuleOutcome::Fired { .. })
    }

    fn metrics_label(&self) -> &'static str {
        match self {
            RuleOutcome::Fired { .. } => "fired",
            RuleOutcome::Disabled => "disabled",
            RuleOutcome::ScheduleInactive => "schedule_inactive",
            RuleOutcome::ConditionFalse => "quiet",
            RuleOutcome::Throttled => "throttled",
        }
    }
}

/// The rule registry and evaluation orchestrator. A background loop walks
/// the registry on an interval; each rule passes through the gate sequence
/// enabled -> schedule -> condition -> throttle before its actions run.
/// Evaluator errors skip the rule for the cycle and never halt the loop.
pub struct AlertManager {
    rules: RwLock<HashMap<String, AdvancedAlertRule>>,
    instances: RwLock<HashMap<String, AlertInstance>>,
    provider: Arc<dyn MetricProvider>,
    throttler: Throttler,
    executor: ActionExecutor,
    hub: Option<Arc<Hub>>,
    metrics: Option<AlertMetricsCollector>,
    eval_interval: Duration,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl AlertManager {
    pub fn new(
        provider: Arc<dyn MetricProvider>,
        executor: ActionExecutor,
        eval_interval: Duration,
        parent_logger: &Logger,
    ) -> AlertManager {
        AlertManager {
            rules: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            provider,
            throttler: Throttler::new(),
            executor,
            hub: None,
            metrics: None,
            eval_interval,
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
            logger: parent_logger.new(o!("component" => "alert_manager")),
        }
    }

    /// Attach the WebSocket hub; firing rules then broadcast alert
    /// messages to subscribed clients.
    pub fn set_hub(&mut self, hub: Arc<Hub>) {
        self.hub = Some(hub);
    }

    pub fn set_metrics_collector(&mut self, collector: &AlertMetricsCollector) {
        self.metrics = Some(collector.clone());
    }

    /// Registers a rule after validating its invariants: a non-empty id, a
    /// well-formed condition tree, and at least one action.
    pub fn add_rule(&self, mut rule: AdvancedAlertRule) -> Result<(), RuleError> {
        if rule.id.is_empty() {
            return Err(RuleError::EmptyId);
        }
        if rule.actions.is_empty() {
            return Err(RuleError::NoActions(rule.id));
        }
        rule.condition.validate()?;

        let now = Utc::now();
        let mut rules = self.rules.write().unwrap();
        if let Some(existing) = rules.get(&rule.id) {
            rule.created_at = existing.created_at;
        } else {
            rule.created_at = now;
        }
        rule.updated_at = now;
        info!(
            self.logger, "rule registered";
            event::RULE_ID => rule.id.clone(),
        );
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let removed = self.rules.write().unwrap().remove(rule_id).is_some();
        if removed {
            self.throttler.forget(rule_id);
            info!(
                self.logger, "rule removed";
                event::RULE_ID => rule_id.to_owned(),
            );
        }
        removed
    }

    /// All registered rules, highest priority first.
    pub fn rules(&self) -> Vec<AdvancedAlertRule> {
        let mut rules: Vec<AdvancedAlertRule> =
            self.rules.read().unwrap().values().cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    /// All known instances, newest first.
    pub fn instances(&self) -> Vec<AlertInstance> {
        let mut instances: Vec<AlertInstance> =
            self.instances.read().unwrap().values().cloned().collect();
        instances.sort_by(|a, b| b.fired_at.cmp(&a.fired_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    /// Runs one rule through the gate sequence. Returns what happened;
    /// metric-read failures bubble up so the caller can skip the rule for
    /// this cycle.
    pub fn evaluate_rule(
        &self,
        rule: &AdvancedAlertRule,
    ) -> Result<RuleOutcome, ConditionError> {
        if !rule.enabled {
            return Ok(RuleOutcome::Disabled);
        }
        if let Some(schedule) = &rule.schedule {
            if !schedule.is_active() {
                return Ok(RuleOutcome::ScheduleInactive);
            }
        }
        if !rule.condition.evaluate(&*self.provider)? {
            return Ok(RuleOutcome::ConditionFalse);
        }
        if let Some(throttle) = &rule.throttle {
            if self.throttler.should_throttle(&rule.id, throttle) {
                return Ok(RuleOutcome::Throttled);
            }
        }

        let instance = self.fire(rule);
        Ok(RuleOutcome::Fired {
            instance_id: instance.id,
        })
    }

    /// Materializes a fresh instance for the rule, broadcasts it, and runs
    /// the rule's actions in order. An action failure is logged and the
    /// remaining actions still run.
    fn fire(&self, rule: &AdvancedAlertRule) -> AlertInstance {
        let instance = AlertInstance {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            status: AlertStatus::Firing,
            message: format!("{}: condition met", rule.name),
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
            fired_at: Utc::now(),
            resolved_at: None,
        };

        info!(
            self.logger, "rule fired";
            event::RULE_ID => rule.id.clone(),
            event::INSTANCE_ID => instance.id.clone(),
        );
        self.instances
            .write()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());

        if let Some(hub) = &self.hub {
            hub.broadcast(StreamMessage::new(
                MessageKind::Alert,
                serde_json::json!(instance),
            ));
        }

        for action in &rule.actions {
            if let Err(error) = self.executor.execute(action, &instance) {
                warn!(
                    self.logger, "alert action failed";
                    event::RULE_ID => rule.id.clone(),
                    event::ACTION_TYPE => action.kind.clone(),
                    "error" => error.to_string(),
                );
            }
        }

        instance
    }

    /// Evaluates every registered rule once, in priority order. Per-rule
    /// errors are logged and skipped; a transient error (an unavailable
    /// metric, say) will resolve itself on a later cycle, while a permanent
    /// one means the rule needs operator attention.
    pub fn evaluate_all(&self) {
        for rule in self.rules() {
            let outcome_label = match self.evaluate_rule(&rule) {
                Ok(outcome) => outcome.metrics_label(),
                Err(error) if error.is_retryable() => {
                    warn!(
                        self.logger, "rule evaluation skipped this cycle";
                        event::RULE_ID => rule.id.clone(),
                        "error" => error.to_string(),
                    );
                    "error"
                }
                Err(error) => {
                    error!(
                        self.logger, "rule cannot be evaluated until it is fixed";
                        event::RULE_ID => rule.id.clone(),
                        "error" => error.to_string(),
                    );
                    "error"
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics
                    .evaluations_total
                    .with_label_values(&[&rule.id, outcome_label])
                    .inc();
            }
        }
    }

    /// Starts the periodic evaluation loop.
    pub fn start(this: &Arc<AlertManager>) {
        let mut worker = this.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let manager = Arc::clone(this);
        let interval = this.eval_interval;

        let handle = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => manager.evaluate_all(),
            }
        });

        *this.shutdown.lock().unwrap() = Some(shutdown_tx);
        *worker = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    fn transition(
        &self,
        instance_id: &str,
        action: &'static str,
        from: &[AlertStatus],
        to: AlertStatus,
    ) -> Result<AlertInstance, InstanceError> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| InstanceError::NotFound(instance_id.to_owned()))?;
        if !from.contains(&instance.status) {
            return Err(InstanceError::InvalidTransition {
                action,
                state: instance.status,
            });
        }
        instance.status = to;
        if to == AlertStatus::Resolved {
            instance.resolved_at = Some(Utc::now());
        }
        Ok(instance.clone())
    }

    /// firing -> silenced.
    pub fn silence(&self, instance_id: &str) -> Result<AlertInstance, InstanceError> {
        self.transition(
            instance_id,
            "silence",
            &[AlertStatus::Firing],
            AlertStatus::Silenced,
        )
    }

    /// silenced -> firing.
    pub fn unsilence(&self, instance_id: &str) -> Result<AlertInstance, InstanceError> {
        self.transition(
            instance_id,
            "unsilence",
            &[AlertStatus::Silenced],
            AlertStatus::Firing,
        )
    }

    /// firing or silenced -> resolved. Resolved is terminal; a rule that
    /// fires again afterwards gets a brand-new instance.
    pub fn resolve(&self, instance_id: &str) -> Result<AlertInstance, InstanceError> {
        self.transition(
            instance_id,
            "resolve",
            &[AlertStatus::Firing, AlertStatus::Silenced],
            AlertStatus::Resolved,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alert::{
            condition::{AlertCondition, ThresholdOperator},
            AlertAction, Severity, ThrottleConfig,
        },
        http::RetryingAgent,
        logging::setup_test_logging,
        metrics::ApiClientMetricsCollector,
        test_utils::{RecordingNotifier, StaticMetricProvider},
    };
    use assert_matches::assert_matches;
    use serde_json::json;

    fn notification_action() -> AlertAction {
        AlertAction {
            kind: "notification".to_owned(),
            delay_secs: 0,
            settings: json!({"channel": "slack"}),
        }
    }

    fn rule(id: &str, condition: AlertCondition) -> AdvancedAlertRule {
        AdvancedAlertRule {
            id: id.to_owned(),
            name: format!("rule {}", id),
            description: String::new(),
            severity: Severity::High,
            priority: 0,
            enabled: true,
            condition,
            actions: vec![notification_action()],
            schedule: None,
            throttle: None,
            labels: Default::default(),
            annotations: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn cpu_over(threshold: f64) -> AlertCondition {
        AlertCondition::Simple {
            metric: "cpu".to_owned(),
            operator: ThresholdOperator::Gt,
            value: threshold,
            upper_value: None,
        }
    }

    fn manager_with(
        metric_name: &str,
        provider: StaticMetricProvider,
    ) -> (Arc<AlertManager>, RecordingNotifier) {
        let logger = setup_test_logging();
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let mut executor = ActionExecutor::new(RetryingAgent::new(metric_name, &api_metrics), &logger);
        let recorder = RecordingNotifier::new();
        executor.register_notifier("slack", Box::new(recorder.clone()));

        let manager = Arc::new(AlertManager::new(
            Arc::new(provider),
            executor,
            Duration::from_secs(3600),
            &logger,
        ));
        (manager, recorder)
    }

    #[test]
    fn registration_validates_invariants() {
        let (manager, _) = manager_with("mgr_validate", StaticMetricProvider::new(&[]));

        let mut no_id = rule("", cpu_over(50.0));
        no_id.id = String::new();
        assert_matches!(manager.add_rule(no_id), Err(RuleError::EmptyId));

        let mut no_actions = rule("r1", cpu_over(50.0));
        no_actions.actions.clear();
        assert_matches!(manager.add_rule(no_actions), Err(RuleError::NoActions(_)));

        let malformed = rule(
            "r2",
            AlertCondition::Composite {
                operator: crate::alert::condition::CompositeOperator::And,
                conditions: vec![],
            },
        );
        assert_matches!(manager.add_rule(malformed), Err(RuleError::Condition(_)));

        manager.add_rule(rule("r3", cpu_over(50.0))).unwrap();
        assert_eq!(manager.rules().len(), 1);
    }

    #[test]
    fn disabled_rule_never_fires() {
        let (manager, recorder) =
            manager_with("mgr_disabled", StaticMetricProvider::new(&[("cpu", 99.0)]));
        let mut disabled = rule("r1", cpu_over(50.0));
        disabled.enabled = false;
        manager.add_rule(disabled.clone()).unwrap();

        let outcome = manager.evaluate_rule(&disabled).unwrap();
        assert_eq!(outcome, RuleOutcome::Disabled);
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn quiet_condition_does_not_fire() {
        let (manager, recorder) =
            manager_with("mgr_quiet", StaticMetricProvider::new(&[("cpu", 40.0)]));
        let quiet = rule("r1", cpu_over(50.0));
        manager.add_rule(quiet.clone()).unwrap();

        let outcome = manager.evaluate_rule(&quiet).unwrap();
        assert_eq!(outcome, RuleOutcome::ConditionFalse);
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn firing_dispatches_actions_and_records_instance() {
        let (manager, recorder) =
            manager_with("mgr_fire", StaticMetricProvider::new(&[("cpu", 99.0)]));
        let firing = rule("r1", cpu_over(50.0));
        manager.add_rule(firing.clone()).unwrap();

        let outcome = manager.evaluate_rule(&firing).unwrap();
        assert!(outcome.fired());
        assert_eq!(recorder.sent().len(), 1);

        let instances = manager.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].rule_id, "r1");
        assert_eq!(instances[0].status, AlertStatus::Firing);
        assert_eq!(instances[0].severity, Severity::High);
    }

    #[test]
    fn throttle_caps_firings() {
        let (manager, recorder) =
            manager_with("mgr_throttle", StaticMetricProvider::new(&[("cpu", 99.0)]));
        let mut throttled = rule("r1", cpu_over(50.0));
        throttled.throttle = Some(ThrottleConfig {
            max_alerts: 3,
            time_window_secs: 300,
        });
        manager.add_rule(throttled.clone()).unwrap();

        for _ in 0..3 {
            assert!(manager.evaluate_rule(&throttled).unwrap().fired());
        }
        assert_eq!(
            manager.evaluate_rule(&throttled).unwrap(),
            RuleOutcome::Throttled
        );
        assert_eq!(recorder.sent().len(), 3);
    }

    #[test]
    fn action_errors_do_not_stop_later_actions() {
        let (manager, recorder) =
            manager_with("mgr_isolation", StaticMetricProvider::new(&[("cpu", 99.0)]));
        let mut two_actions = rule("r1", cpu_over(50.0));
        two_actions.actions = vec![
            AlertAction {
                kind: "carrier-pigeon".to_owned(),
                delay_secs: 0,
                settings: json!({}),
            },
            notification_action(),
        ];
        manager.add_rule(two_actions.clone()).unwrap();

        assert!(manager.evaluate_rule(&two_actions).unwrap().fired());
        // The second action still ran despite the first failing.
        assert_eq!(recorder.sent().len(), 1);
    }

    #[test]
    fn evaluation_errors_skip_the_rule() {
        let (manager, recorder) =
            manager_with("mgr_skip", StaticMetricProvider::new(&[]));
        let ghost = rule("r1", cpu_over(50.0));
        manager.add_rule(ghost.clone()).unwrap();

        assert!(manager.evaluate_rule(&ghost).is_err());
        // The loop-level wrapper must swallow the error.
        manager.evaluate_all();
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn state_machine_transitions() {
        let (manager, _) =
            manager_with("mgr_states", StaticMetricProvider::new(&[("cpu", 99.0)]));
        let firing = rule("r1", cpu_over(50.0));
        manager.add_rule(firing.clone()).unwrap();
        let outcome = manager.evaluate_rule(&firing).unwrap();
        let instance_id = match outcome {
            RuleOutcome::Fired { instance_id } => instance_id,
            other => panic!("expected fired, got {:?}", other),
        };

        // firing -> silenced -> firing -> resolved
        assert_eq!(
            manager.silence(&instance_id).unwrap().status,
            AlertStatus::Silenced
        );
        assert_matches!(
            manager.silence(&instance_id),
            Err(InstanceError::InvalidTransition { .. })
        );
        assert_eq!(
            manager.unsilence(&instance_id).unwrap().status,
            AlertStatus::Firing
        );
        assert_eq!(
            manager.resolve(&instance_id).unwrap().status,
            AlertStatus::Resolved
        );

        // Resolved is terminal.
        assert_matches!(
            manager.resolve(&instance_id),
            Err(InstanceError::InvalidTransition { .. })
        );
        assert_matches!(
            manager.unsilence(&instance_id),
            Err(InstanceError::InvalidTransition { .. })
        );
    }

    #[test]
    fn refiring_after_resolution_creates_fresh_instance() {
        let (manager, _) =
            manager_with("mgr_refire", StaticMetricProvider::new(&[("cpu", 99.0)]));
        let mut labeled = rule("r1", cpu_over(50.0));
        labeled
            .labels
            .insert("team".to_owned(), "platform".to_owned());
        manager.add_rule(labeled.clone()).unwrap();

        let first_id = match manager.evaluate_rule(&labeled).unwrap() {
            RuleOutcome::Fired { instance_id } => instance_id,
            other => panic!("expected fired, got {:?}", other),
        };
        manager.resolve(&first_id).unwrap();

        let second_id = match manager.evaluate_rule(&labeled).unwrap() {
            RuleOutcome::Fired { instance_id } => instance_id,
            other => panic!("expected fired, got {:?}", other),
        };
        assert_ne!(first_id, second_id);

        let instances = manager.instances();
        let second = instances.iter().find(|i| i.id == second_id).unwrap();
        assert_eq!(second.status, AlertStatus::Firing);
        // Labels carry forward from the rule template.
        assert_eq!(second.labels.get("team").map(String::as_str), Some("platform"));
    }

    #[test]
    fn rules_sort_by_priority() {
        let (manager, _) = manager_with("mgr_priority", StaticMetricProvider::new(&[]));
        let mut low = rule("low", cpu_over(50.0));
        low.priority = 1;
        let mut high = rule("high", cpu_over(50.0));
        high.priority = 10;
        manager.add_rule(low).unwrap();
        manager.add_rule(high).unwrap();

        let ids: Vec<String> = manager.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }
}
