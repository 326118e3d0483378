//! Event subsystem
//!
//! Filesystem and provider events flow through here: rules are matched,
//! action chains dispatched in order, schedules ticked and the defender
//! fed. Synchronous chains run inside the triggering operation and can
//! abort it; everything else is fire-and-forget.

pub mod actions;
pub mod defender;
pub mod rules;
pub mod scheduler;

use crate::config::SmtpConfig;
use crate::provider::{events as store, DataProvider};
use crate::util;
use actions::ActionExecutor;
use rules::{EventRule, EventTrigger, RuleAction};
use serde::Serialize;
use std::sync::Arc;
use wharf_common::{Error, Result};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A filesystem operation: upload, download, delete, rename,
    /// mkdir, rmdir, first-upload, first-download.
    Fs { event: String },
    /// A provider mutation: add, update, delete of a named object.
    Provider {
        action: String,
        object_type: String,
    },
    /// A cron schedule fired.
    Schedule,
    /// The defender banned an address.
    IpBlocked,
    CertificateRenewal,
}

/// The context a rule chain runs with.
#[derive(Debug, Clone, Serialize)]
pub struct EventContext {
    pub kind: EventKind,
    pub username: String,
    pub role: String,
    pub virtual_path: String,
    pub virtual_target_path: String,
    pub fs_path: String,
    /// Provider events: the mutated object's name.
    pub object_name: String,
    /// Provider events: the mutated object serialized with secrets
    /// redacted.
    pub object_data: String,
    pub file_size: i64,
    pub protocol: String,
    pub ip: String,
    /// 1 success, 0 failure of the triggering operation.
    pub status: i32,
    pub timestamp: i64,
}

impl EventContext {
    pub fn event_name(&self) -> &str {
        match &self.kind {
            EventKind::Fs { event } => event,
            EventKind::Provider { action, .. } => action,
            EventKind::Schedule => "schedule",
            EventKind::IpBlocked => "ip_blocked",
            EventKind::CertificateRenewal => "certificate_renewal",
        }
    }

    pub fn fs(event: &str, username: &str, virtual_path: &str) -> Self {
        Self {
            kind: EventKind::Fs {
                event: event.to_string(),
            },
            username: username.to_string(),
            role: String::new(),
            virtual_path: virtual_path.to_string(),
            virtual_target_path: String::new(),
            fs_path: String::new(),
            object_name: String::new(),
            object_data: String::new(),
            file_size: 0,
            protocol: String::new(),
            ip: String::new(),
            status: 1,
            timestamp: util::now_ms(),
        }
    }

    pub fn provider(action: &str, object_type: &str, object_name: &str, actor: &str) -> Self {
        Self {
            kind: EventKind::Provider {
                action: action.to_string(),
                object_type: object_type.to_string(),
            },
            username: actor.to_string(),
            role: String::new(),
            virtual_path: String::new(),
            virtual_target_path: String::new(),
            fs_path: String::new(),
            object_name: object_name.to_string(),
            object_data: String::new(),
            file_size: 0,
            protocol: String::new(),
            ip: String::new(),
            status: 1,
            timestamp: util::now_ms(),
        }
    }
}

/// Rule matcher plus action dispatcher.
pub struct EventManager {
    provider: Arc<DataProvider>,
    executor: ActionExecutor,
}

impl EventManager {
    pub fn new(provider: Arc<DataProvider>, smtp: SmtpConfig) -> Arc<Self> {
        let executor = ActionExecutor::new(provider.clone(), smtp);
        Arc::new(Self { provider, executor })
    }

    pub(crate) fn provider_pool(&self) -> &sqlx::SqlitePool {
        self.provider.pool()
    }

    /// Handle a filesystem event. Rules with synchronous actions run
    /// inside the caller; their failure aborts the triggering
    /// operation. Asynchronous rules are spawned.
    pub async fn handle_fs_event(self: &Arc<Self>, event: EventContext) -> Result<()> {
        let rules = store::list_rules(self.provider.pool(), EventTrigger::FsEvent).await?;
        for rule in rules {
            if !rule.matches(&event) {
                continue;
            }
            if rule.has_sync_actions() {
                self.execute_rule(&rule, &event).await?;
            } else {
                self.spawn_rule(rule, event.clone());
            }
        }
        Ok(())
    }

    /// Emit a provider event; matching and dispatch are asynchronous.
    pub fn emit_provider_event(self: &Arc<Self>, event: EventContext) {
        let manager = self.clone();
        tokio::spawn(async move {
            match store::list_rules(manager.provider.pool(), EventTrigger::ProviderEvent).await {
                Ok(rules) => {
                    for rule in rules {
                        if rule.matches(&event) {
                            manager.spawn_rule(rule, event.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("unable to load provider event rules: {}", e);
                }
            }
        });
    }

    /// Emit a defender ban event.
    pub fn emit_ip_blocked(self: &Arc<Self>, ip: &str) {
        let mut event = EventContext::fs("ip_blocked", "", "");
        event.kind = EventKind::IpBlocked;
        event.ip = ip.to_string();
        let manager = self.clone();
        tokio::spawn(async move {
            match store::list_rules(manager.provider.pool(), EventTrigger::IpBlocked).await {
                Ok(rules) => {
                    for rule in rules {
                        if rule.matches(&event) {
                            manager.spawn_rule(rule, event.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("unable to load defender event rules: {}", e);
                }
            }
        });
    }

    /// Run a scheduled rule; called by the scheduler on cron hits.
    pub fn run_scheduled_rule(self: &Arc<Self>, rule: EventRule) {
        let mut event = EventContext::fs("schedule", "", "");
        event.kind = EventKind::Schedule;
        event.object_name = rule.name.clone();
        self.spawn_rule(rule, event);
    }

    fn spawn_rule(self: &Arc<Self>, rule: EventRule, event: EventContext) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.execute_rule(&rule, &event).await {
                tracing::error!(rule = %rule.name, "event rule failed: {}", e);
            }
        });
    }

    /// Execute one rule chain, strictly by `order` ascending.
    ///
    /// A failing non-failure action flags the rule as failed and, with
    /// `stop_on_failure`, stops the chain. Failure handlers run only
    /// when something failed. The returned error is the first failure
    /// of a synchronous action, which aborts the triggering operation.
    pub async fn execute_rule(&self, rule: &EventRule, event: &EventContext) -> Result<()> {
        let mut rule_failed = false;
        let mut sync_failure: Option<Error> = None;
        for invocation in rule
            .ordered_actions()
            .iter()
            .filter(|a| !a.options.is_failure_action)
        {
            match self.run_action(invocation, event).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(
                        rule = %rule.name,
                        action = %invocation.name,
                        "event action failed: {}", e
                    );
                    rule_failed = true;
                    if invocation.options.execute_sync && sync_failure.is_none() {
                        sync_failure = Some(e);
                    }
                    if invocation.options.stop_on_failure {
                        break;
                    }
                }
            }
        }
        if rule_failed {
            for invocation in rule
                .ordered_actions()
                .iter()
                .filter(|a| a.options.is_failure_action)
            {
                if let Err(e) = self.run_action(invocation, event).await {
                    tracing::warn!(
                        rule = %rule.name,
                        action = %invocation.name,
                        "failure handler failed: {}", e
                    );
                }
            }
        }
        match sync_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_action(&self, invocation: &RuleAction, event: &EventContext) -> Result<()> {
        let action = store::get_action(self.provider.pool(), &invocation.name).await?;
        self.executor.execute(&action, event).await
    }

    /// Run one action outside any rule, used by the retention API.
    pub async fn execute_adhoc_action(
        &self,
        action: &actions::EventAction,
        event: &EventContext,
    ) -> Result<()> {
        self.executor.execute(action, event).await
    }
}
