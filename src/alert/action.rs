use crate::{
    alert::{digest::DigestCollector, AlertInstance, Severity},
    http::{Method, RequestParameters, RetryingAgent},
    logging::event,
    metrics::AlertMetricsCollector,
    ErrorClassification,
};
use dyn_clone::{clone_trait_object, DynClone};
use serde::{Deserialize, Serialize};
use slog::{info, o, Logger};
use std::{collections::HashMap, fmt::Debug, process::Command, sync::Arc, time::Duration};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action type {0:?}")]
    UnknownActionType(String),
    #[error("invalid action settings: {0}")]
    BadSettings(#[from] serde_json::Error),
    #[error("no notifier registered for channel {0:?}")]
    MissingChannel(String),
    #[error("notification to {channel} failed: {source}")]
    Notification {
        channel: String,
        source: anyhow::Error,
    },
    #[error("webhook delivery failed: {source}")]
    Webhook { source: Box<ureq::Error> },
    #[error("webhook URL invalid: {0}")]
    WebhookUrl(#[from] url::ParseError),
    #[error("script {command:?} could not be spawned: {source}")]
    ScriptSpawn {
        command: String,
        source: std::io::Error,
    },
    #[error("script {command:?} exited with status {status:?}")]
    ScriptFailed {
        command: String,
        status: Option<i32>,
    },
}

impl ErrorClassification for ActionError {
    fn is_retryable(&self) -> bool {
        match self {
            ActionError::Notification { .. }
            | ActionError::Webhook { .. }
            | ActionError::ScriptSpawn { .. }
            | ActionError::ScriptFailed { .. } => true,
            ActionError::UnknownActionType(_)
            | ActionError::BadSettings(_)
            | ActionError::MissingChannel(_)
            | ActionError::WebhookUrl(_) => false,
        }
    }
}

/// One action attached to an alert rule. The settings object is decoded
/// per-kind at execution time.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlertAction {
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds to wait before executing.
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// A notification channel (Slack, Discord, Teams, e-mail, ...). Payload
/// assembly for the concrete services lives outside this crate; the
/// contract here is only "deliver this instance or say why not".
pub trait Notifier: Debug + DynClone + Send + Sync {
    fn send_alert(&self, instance: &AlertInstance) -> anyhow::Result<()>;
}

clone_trait_object!(Notifier);

/// A generic JSON-webhook notifier, usable as the backing for any channel
/// that accepts an HTTP POST.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    url: Url,
    agent: RetryingAgent,
    logger: Logger,
}

impl WebhookNotifier {
    pub fn new(url: Url, agent: RetryingAgent, logger: Logger) -> WebhookNotifier {
        WebhookNotifier { url, agent, logger }
    }
}

impl Notifier for WebhookNotifier {
    fn send_alert(&self, instance: &AlertInstance) -> anyhow::Result<()> {
        let request = self.agent.prepare_request(&RequestParameters {
            url: self.url.clone(),
            method: Method::Post,
            headers: Vec::new(),
            timeout: Some(Duration::from_secs(10)),
        });
        self.agent
            .send_json_request(
                &self.logger,
                &request,
                "notify",
                &serde_json::json!(instance),
            )?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct NotificationSettings {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct WebhookSettings {
    url: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct ScriptSettings {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EscalationSettings {
    channel: String,
}

/// Dispatches alert actions. Notification actions route to a named
/// channel; the e-mail channel goes through the digest collector when one
/// is installed, so sub-immediate severities coalesce instead of paging.
pub struct ActionExecutor {
    notifiers: HashMap<String, Box<dyn Notifier>>,
    digest: Option<Arc<DigestCollector>>,
    agent: RetryingAgent,
    metrics: Option<AlertMetricsCollector>,
    logger: Logger,
}

impl ActionExecutor {
    pub fn new(agent: RetryingAgent, parent_logger: &Logger) -> ActionExecutor {
        ActionExecutor {
            notifiers: HashMap::new(),
            digest: None,
            agent,
            metrics: None,
            logger: parent_logger.new(o!("component" => "action_executor")),
        }
    }

    pub fn register_notifier(&mut self, channel: &str, notifier: Box<dyn Notifier>) {
        self.notifiers.insert(channel.to_owned(), notifier);
    }

    pub fn set_digest(&mut self, digest: Arc<DigestCollector>) {
        self.digest = Some(digest);
    }

    pub fn set_metrics_collector(&mut self, collector: &AlertMetricsCollector) {
        self.metrics = Some(collector.clone());
    }

    /// Executes one action for one instance, honoring the action's delay.
    pub fn execute(
        &self,
        action: &AlertAction,
        instance: &AlertInstance,
    ) -> Result<(), ActionError> {
        if action.delay_secs > 0 {
            std::thread::sleep(Duration::from_secs(action.delay_secs));
        }

        let result = match action.kind.as_str() {
            "notification" => self.execute_notification(action, instance),
            "webhook" => self.execute_webhook(action, instance),
            "script" => self.execute_script(action, instance),
            "escalation" => self.execute_escalation(action, instance),
            other => Err(ActionError::UnknownActionType(other.to_owned())),
        };

        if let Some(metrics) = &self.metrics {
            let status = if result.is_ok() { "success" } else { "failure" };
            metrics
                .actions_total
                .with_label_values(&[&action.kind, status])
                .inc();
        }
        result
    }

    fn notify_channel(
        &self,
        channel: &str,
        instance: &AlertInstance,
    ) -> Result<(), ActionError> {
        if channel == "email" {
            if let Some(digest) = &self.digest {
                return digest
                    .record(instance)
                    .map_err(|source| ActionError::Notification {
                        channel: channel.to_owned(),
                        source,
                    });
            }
        }
        let notifier = self
            .notifiers
            .get(channel)
            .ok_or_else(|| ActionError::MissingChannel(channel.to_owned()))?;
        notifier
            .send_alert(instance)
            .map_err(|source| ActionError::Notification {
                channel: channel.to_owned(),
                source,
            })
    }

    fn execute_notification(
        &self,
        action: &AlertAction,
        instance: &AlertInstance,
    ) -> Result<(), ActionError> {
        let settings: NotificationSettings = serde_json::from_value(action.settings.clone())?;
        self.notify_channel(&settings.channel, instance)
    }

    fn execute_webhook(
        &self,
        action: &AlertAction,
        instance: &AlertInstance,
    ) -> Result<(), ActionError> {
        let settings: WebhookSettings = serde_json::from_value(action.settings.clone())?;
        let url = Url::parse(&settings.url)?;
        let request = self.agent.prepare_request(&RequestParameters {
            url,
            method: Method::Post,
            headers: settings.headers,
            timeout: Some(Duration::from_secs(10)),
        });
        self.agent
            .send_json_request(
                &self.logger,
                &request,
                "webhook",
                &serde_json::json!(instance),
            )
            .map(|_| ())
            .map_err(|source| ActionError::Webhook {
                source: Box::new(source),
            })
    }

    fn execute_script(
        &self,
        action: &AlertAction,
        instance: &AlertInstance,
    ) -> Result<(), ActionError> {
        let settings: ScriptSettings = serde_json::from_value(action.settings.clone())?;
        let payload = serde_json::to_string(instance).unwrap_or_default();

        let status = Command::new(&settings.command)
            .args(&settings.args)
            .env("WATCHTOWER_ALERT", payload)
            .status()
            .map_err(|source| ActionError::ScriptSpawn {
                command: settings.command.clone(),
                source,
            })?;

        if status.success() {
            info!(
                self.logger, "alert script completed";
                event::INSTANCE_ID => instance.id.clone(),
            );
            Ok(())
        } else {
            Err(ActionError::ScriptFailed {
                command: settings.command,
                status: status.code(),
            })
        }
    }

    /// Escalation is a notification that treats the instance as critical,
    /// whatever the rule said.
    fn execute_escalation(
        &self,
        action: &AlertAction,
        instance: &AlertInstance,
    ) -> Result<(), ActionError> {
        let settings: EscalationSettings = serde_json::from_value(action.settings.clone())?;
        let mut escalated = instance.clone();
        escalated.severity = Severity::Critical;
        self.notify_channel(&settings.channel, &escalated)
    }
}

impl Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("channels", &self.notifiers.keys().collect::<Vec<_>>())
            .field("digest", &self.digest.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        logging::setup_test_logging,
        metrics::ApiClientMetricsCollector,
        test_utils::{sample_instance, RecordingNotifier},
    };
    use assert_matches::assert_matches;
    use mockito::mock;
    use serde_json::json;

    fn executor(metric: &str) -> ActionExecutor {
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name(metric).unwrap();
        ActionExecutor::new(
            RetryingAgent::new(metric, &api_metrics),
            &setup_test_logging(),
        )
    }

    #[test]
    fn notification_routes_to_channel() {
        let mut executor = executor("exec_notify");
        let recorder = RecordingNotifier::new();
        executor.register_notifier("slack", Box::new(recorder.clone()));

        let action = AlertAction {
            kind: "notification".to_owned(),
            delay_secs: 0,
            settings: json!({"channel": "slack"}),
        };
        executor.execute(&action, &sample_instance(Severity::High)).unwrap();
        assert_eq!(recorder.sent().len(), 1);
    }

    #[test]
    fn missing_channel_is_an_error() {
        let executor = executor("exec_missing");
        let action = AlertAction {
            kind: "notification".to_owned(),
            delay_secs: 0,
            settings: json!({"channel": "pager"}),
        };
        assert_matches!(
            executor.execute(&action, &sample_instance(Severity::High)),
            Err(ActionError::MissingChannel(channel)) => {
                assert_eq!(channel, "pager");
            }
        );
    }

    #[test]
    fn unknown_action_type_surfaces() {
        let executor = executor("exec_unknown");
        let action = AlertAction {
            kind: "carrier-pigeon".to_owned(),
            delay_secs: 0,
            settings: json!({}),
        };
        assert_matches!(
            executor.execute(&action, &sample_instance(Severity::Low)),
            Err(ActionError::UnknownActionType(_))
        );
    }

    #[test]
    fn webhook_posts_instance_json() {
        let mocked = mock("POST", "/hook").with_status(200).create();
        let executor = executor("exec_webhook");
        let action = AlertAction {
            kind: "webhook".to_owned(),
            delay_secs: 0,
            settings: json!({"url": format!("{}/hook", mockito::server_url())}),
        };
        executor.execute(&action, &sample_instance(Severity::Medium)).unwrap();
        mocked.assert();
    }

    #[test]
    fn script_success_and_failure() {
        let executor = executor("exec_script");

        let success = AlertAction {
            kind: "script".to_owned(),
            delay_secs: 0,
            settings: json!({"command": "true"}),
        };
        executor.execute(&success, &sample_instance(Severity::Low)).unwrap();

        let failure = AlertAction {
            kind: "script".to_owned(),
            delay_secs: 0,
            settings: json!({"command": "false"}),
        };
        assert_matches!(
            executor.execute(&failure, &sample_instance(Severity::Low)),
            Err(ActionError::ScriptFailed { .. })
        );
    }

    #[test]
    fn escalation_raises_severity() {
        let mut executor = executor("exec_escalate");
        let recorder = RecordingNotifier::new();
        executor.register_notifier("oncall", Box::new(recorder.clone()));

        let action = AlertAction {
            kind: "escalation".to_owned(),
            delay_secs: 0,
            settings: json!({"channel": "oncall"}),
        };
        executor.execute(&action, &sample_instance(Severity::Low)).unwrap();
        assert_eq!(recorder.sent()[0].severity, Severity::Critical);
    }
}
