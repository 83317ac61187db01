use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use zima_core::{EventKind, EventSink, NullSink, PermissionAction, PermissionRule};

const DEFAULT_APPROVAL_TTL_SECONDS: i64 = 3_600;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("rule index {index} is out of range (have {len} rules)")]
    RuleIndexOutOfRange { index: usize, len: usize },
}

/// Case-insensitive glob match where `*` is any run of characters (including
/// none) and `?` is exactly one. Every other character is literal.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let opts = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    match Pattern::new(&literal_glob(pattern)) {
        Ok(compiled) => compiled.matches_with(value, opts),
        Err(_) => pattern.eq_ignore_ascii_case(value),
    }
}

fn literal_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut prev_star = false;
    for ch in pattern.chars() {
        match ch {
            '*' if prev_star => continue,
            '*' => out.push('*'),
            '?' => out.push('?'),
            '[' => out.push_str("[[]"),
            ']' => out.push_str("[]]"),
            other => out.push(other),
        }
        prev_star = ch == '*';
    }
    out
}

fn first_match<'a>(
    rules: &'a [PermissionRule],
    permission: &str,
    value: &str,
) -> Option<&'a PermissionRule> {
    rules.iter().find(|rule| {
        wildcard_match(&rule.permission, permission) && wildcard_match(&rule.pattern, value)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub permission: String,
    pub value: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PermissionRequest {
    pub fn new(permission: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            permission: permission.into(),
            value: value.into(),
            session_id: None,
            reason: None,
        }
    }

    pub fn in_session(mut self, session_id: Option<Uuid>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionApproval {
    pub session_id: Option<Uuid>,
    pub permission: String,
    pub value: String,
    pub action: PermissionAction,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PermissionApproval {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Decides Ask-tier requests. Anything other than `Allow` counts as a denial.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: &PermissionRequest) -> PermissionAction;
}

/// Grants every Ask-tier request. Used when no operator is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn approve(&self, _request: &PermissionRequest) -> PermissionAction {
        PermissionAction::Allow
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DenyApprover;

#[async_trait]
impl Approver for DenyApprover {
    async fn approve(&self, _request: &PermissionRequest) -> PermissionAction {
        PermissionAction::Deny
    }
}

type ApprovalKey = (Option<Uuid>, String, String);

#[derive(Default)]
struct PolicyState {
    global: Vec<PermissionRule>,
    session: HashMap<Uuid, Vec<PermissionRule>>,
    agent: HashMap<Uuid, Vec<PermissionRule>>,
    approvals: HashMap<ApprovalKey, PermissionApproval>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    global: Vec<PermissionRule>,
    #[serde(default)]
    sessions: BTreeMap<Uuid, Vec<PermissionRule>>,
}

pub struct PermissionEvaluator {
    state: Mutex<PolicyState>,
    approver: Arc<dyn Approver>,
    sink: Arc<dyn EventSink>,
    ttl: Duration,
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(AutoApprover), Arc::new(NullSink))
    }
}

impl PermissionEvaluator {
    pub fn new(approver: Arc<dyn Approver>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(PolicyState::default()),
            approver,
            sink,
            ttl: Duration::seconds(DEFAULT_APPROVAL_TTL_SECONDS),
        }
    }

    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl = Duration::from_std(ttl)
            .unwrap_or_else(|_| Duration::seconds(DEFAULT_APPROVAL_TTL_SECONDS));
        self
    }

    pub fn with_rules(self, rules: Vec<PermissionRule>) -> Self {
        self.set_rules(rules);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Session overrides, then the session's agent rules, then global rules.
    /// The first matching rule wins; no match allows.
    pub fn evaluate(
        &self,
        permission: &str,
        value: &str,
        session_id: Option<Uuid>,
    ) -> PermissionAction {
        let state = self.state.lock().expect("policy lock");
        if let Some(id) = session_id {
            for tier in [state.session.get(&id), state.agent.get(&id)]
                .into_iter()
                .flatten()
            {
                if let Some(rule) = first_match(tier, permission, value) {
                    return rule.action;
                }
            }
        }
        first_match(&state.global, permission, value)
            .map(|rule| rule.action)
            .unwrap_or(PermissionAction::Allow)
    }

    pub async fn request(&self, request: &PermissionRequest) -> PermissionAction {
        self.request_at(request, Utc::now()).await
    }

    /// Resolves a request to `Allow` or `Deny`, consulting the approval cache
    /// and then the approver for Ask-tier matches.
    pub async fn request_at(
        &self,
        request: &PermissionRequest,
        now: DateTime<Utc>,
    ) -> PermissionAction {
        let action = self.evaluate(&request.permission, &request.value, request.session_id);
        if action != PermissionAction::Ask {
            self.sink.publish(EventKind::PermissionEvaluatedV1 {
                permission: request.permission.clone(),
                value: request.value.clone(),
                session_id: request.session_id,
                action,
            });
            return action;
        }

        let key: ApprovalKey = (
            request.session_id,
            request.permission.clone(),
            request.value.clone(),
        );
        let cached = {
            let mut state = self.state.lock().expect("policy lock");
            match state.approvals.get(&key) {
                Some(approval) if approval.is_live(now) => Some(approval.action),
                Some(_) => {
                    state.approvals.remove(&key);
                    None
                }
                None => None,
            }
        };
        if let Some(action) = cached {
            self.publish_approval(request, action, true);
            return action;
        }

        let verdict = match self.approver.approve(request).await {
            PermissionAction::Allow => PermissionAction::Allow,
            _ => PermissionAction::Deny,
        };
        tracing::debug!(
            permission = %request.permission,
            value = %request.value,
            verdict = %verdict,
            "approver decided ask-tier request"
        );
        self.state.lock().expect("policy lock").approvals.insert(
            key,
            PermissionApproval {
                session_id: request.session_id,
                permission: request.permission.clone(),
                value: request.value.clone(),
                action: verdict,
                granted_at: now,
                expires_at: now + self.ttl,
            },
        );
        self.publish_approval(request, verdict, false);
        verdict
    }

    fn publish_approval(&self, request: &PermissionRequest, action: PermissionAction, cached: bool) {
        self.sink.publish(EventKind::PermissionApprovedV1 {
            permission: request.permission.clone(),
            value: request.value.clone(),
            session_id: request.session_id,
            action,
            cached,
        });
    }

    pub fn add_rule(&self, rule: PermissionRule) {
        self.state.lock().expect("policy lock").global.push(rule);
    }

    pub fn insert_rule(&self, index: usize, rule: PermissionRule) -> Result<(), PolicyError> {
        let mut state = self.state.lock().expect("policy lock");
        let len = state.global.len();
        if index > len {
            return Err(PolicyError::RuleIndexOutOfRange { index, len });
        }
        state.global.insert(index, rule);
        Ok(())
    }

    pub fn set_rules(&self, rules: Vec<PermissionRule>) {
        self.state.lock().expect("policy lock").global = rules;
    }

    /// Drops every global rule whose permission pattern equals `permission`
    /// (case-insensitive). Returns how many were removed.
    pub fn remove_rules_for(&self, permission: &str) -> usize {
        let mut state = self.state.lock().expect("policy lock");
        let before = state.global.len();
        state
            .global
            .retain(|rule| !rule.permission.eq_ignore_ascii_case(permission));
        before - state.global.len()
    }

    pub fn rules(&self) -> Vec<PermissionRule> {
        self.state.lock().expect("policy lock").global.clone()
    }

    pub fn add_session_rule(&self, session_id: Uuid, rule: PermissionRule) {
        self.state
            .lock()
            .expect("policy lock")
            .session
            .entry(session_id)
            .or_default()
            .push(rule);
    }

    pub fn session_rules(&self, session_id: Uuid) -> Vec<PermissionRule> {
        self.state
            .lock()
            .expect("policy lock")
            .session
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_agent_rules(&self, session_id: Uuid, rules: Vec<PermissionRule>) {
        let mut state = self.state.lock().expect("policy lock");
        if rules.is_empty() {
            state.agent.remove(&session_id);
        } else {
            state.agent.insert(session_id, rules);
        }
    }

    pub fn agent_rules(&self, session_id: Uuid) -> Vec<PermissionRule> {
        self.state
            .lock()
            .expect("policy lock")
            .agent
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget everything scoped to a session: overrides, agent rules, approvals.
    pub fn clear_session(&self, session_id: Uuid) {
        let mut state = self.state.lock().expect("policy lock");
        state.session.remove(&session_id);
        state.agent.remove(&session_id);
        state
            .approvals
            .retain(|(sid, _, _), _| *sid != Some(session_id));
    }

    /// Live approvals for a session, ordered by permission then value.
    pub fn approvals(&self, session_id: Option<Uuid>) -> Vec<PermissionApproval> {
        let now = Utc::now();
        let state = self.state.lock().expect("policy lock");
        let mut out: Vec<PermissionApproval> = state
            .approvals
            .values()
            .filter(|a| a.session_id == session_id && a.is_live(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.permission, &a.value).cmp(&(&b.permission, &b.value)));
        out
    }

    pub fn revoke_approvals(&self, session_id: Option<Uuid>) -> usize {
        let mut state = self.state.lock().expect("policy lock");
        let before = state.approvals.len();
        state.approvals.retain(|(sid, _, _), _| *sid != session_id);
        before - state.approvals.len()
    }

    /// Replace global and session rules with the persisted ones. Returns the
    /// number of rules loaded; an absent file loads nothing.
    pub fn load_rules(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)?;
        let file: RulesFile = serde_json::from_str(&raw)?;
        let count = file.global.len() + file.sessions.values().map(Vec::len).sum::<usize>();
        let mut state = self.state.lock().expect("policy lock");
        state.global = file.global;
        state.session = file.sessions.into_iter().collect();
        Ok(count)
    }

    pub fn save_rules(&self, path: &Path) -> Result<()> {
        let file = {
            let state = self.state.lock().expect("policy lock");
            RulesFile {
                global: state.global.clone(),
                sessions: state
                    .session
                    .iter()
                    .map(|(id, rules)| (*id, rules.clone()))
                    .collect(),
            }
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recording(Mutex<Vec<EventKind>>);

    impl EventSink for Recording {
        fn publish(&self, kind: EventKind) {
            self.0.lock().expect("events lock").push(kind);
        }
    }

    #[derive(Default)]
    struct CountingApprover(AtomicUsize);

    #[async_trait]
    impl Approver for CountingApprover {
        async fn approve(&self, _request: &PermissionRequest) -> PermissionAction {
            self.0.fetch_add(1, Ordering::SeqCst);
            PermissionAction::Allow
        }
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything/at/all"));
        assert!(wildcard_match("delete_*", "DELETE_file"));
        assert!(wildcard_match("file?.txt", "file1.txt"));
        assert!(!wildcard_match("file?.txt", "file.txt"));
        assert!(wildcard_match("**", "x"));
        assert!(wildcard_match("[draft].docx", "[DRAFT].docx"));
        assert!(!wildcard_match("report", "report2"));
    }

    #[test]
    fn no_rules_means_allow() {
        let policy = PermissionEvaluator::default();
        assert_eq!(
            policy.evaluate("create_excel", "/tmp/a.xlsx", None),
            PermissionAction::Allow
        );
    }

    #[test]
    fn first_matching_global_rule_wins() {
        let policy = PermissionEvaluator::default().with_rules(vec![
            PermissionRule::allow("delete_file", "*.tmp"),
            PermissionRule::deny("delete_*", "*"),
        ]);
        assert_eq!(
            policy.evaluate("delete_file", "scratch.tmp", None),
            PermissionAction::Allow
        );
        assert_eq!(
            policy.evaluate("delete_file", "report.docx", None),
            PermissionAction::Deny
        );
    }

    #[test]
    fn agent_rules_sit_between_session_and_global() {
        let policy = PermissionEvaluator::default()
            .with_rules(vec![PermissionRule::allow("write_*", "*")]);
        let sid = Uuid::now_v7();
        policy.set_agent_rules(sid, vec![PermissionRule::deny("write_*", "*")]);
        assert_eq!(
            policy.evaluate("write_text_file", "a.txt", Some(sid)),
            PermissionAction::Deny
        );
        policy.add_session_rule(sid, PermissionRule::allow("write_text_file", "a.txt"));
        assert_eq!(
            policy.evaluate("write_text_file", "a.txt", Some(sid)),
            PermissionAction::Allow
        );
        assert_eq!(
            policy.evaluate("write_text_file", "a.txt", None),
            PermissionAction::Allow
        );
    }

    #[test]
    fn insert_rule_rejects_out_of_range_index() {
        let policy = PermissionEvaluator::default();
        policy
            .insert_rule(0, PermissionRule::deny("*", "*"))
            .expect("insert at 0");
        assert_eq!(
            policy.insert_rule(5, PermissionRule::allow("*", "*")),
            Err(PolicyError::RuleIndexOutOfRange { index: 5, len: 1 })
        );
    }

    #[test]
    fn remove_rules_for_only_touches_matching_permission() {
        let policy = PermissionEvaluator::default().with_rules(vec![
            PermissionRule::deny("delete_file", "*"),
            PermissionRule::ask("write_text_file", "*"),
            PermissionRule::deny("DELETE_FILE", "*.docx"),
        ]);
        assert_eq!(policy.remove_rules_for("delete_file"), 2);
        assert_eq!(policy.rules().len(), 1);
    }

    #[tokio::test]
    async fn ask_tier_approvals_are_cached_until_expiry() {
        let approver = Arc::new(CountingApprover::default());
        let sink = Arc::new(Recording::default());
        let policy = PermissionEvaluator::new(approver.clone(), sink.clone())
            .with_rules(vec![PermissionRule::ask("write_text_file", "*")]);
        let sid = Uuid::now_v7();
        let request = PermissionRequest::new("write_text_file", "notes.txt").in_session(Some(sid));
        let t0 = Utc::now();

        assert_eq!(policy.request_at(&request, t0).await, PermissionAction::Allow);
        assert_eq!(
            policy
                .request_at(&request, t0 + Duration::minutes(30))
                .await,
            PermissionAction::Allow
        );
        assert_eq!(approver.0.load(Ordering::SeqCst), 1);

        policy
            .request_at(&request, t0 + Duration::minutes(61))
            .await;
        assert_eq!(approver.0.load(Ordering::SeqCst), 2);

        let events = sink.0.lock().expect("events lock");
        let cached: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                EventKind::PermissionApprovedV1 { cached, .. } => Some(*cached),
                _ => None,
            })
            .collect();
        assert_eq!(cached, vec![false, true, false]);
    }

    #[tokio::test]
    async fn approvals_are_scoped_per_session() {
        let approver = Arc::new(CountingApprover::default());
        let policy = PermissionEvaluator::new(approver.clone(), Arc::new(NullSink))
            .with_rules(vec![PermissionRule::ask("*", "*")]);
        let a = PermissionRequest::new("delete_file", "x").in_session(Some(Uuid::now_v7()));
        let b = PermissionRequest::new("delete_file", "x").in_session(Some(Uuid::now_v7()));
        policy.request(&a).await;
        policy.request(&b).await;
        assert_eq!(approver.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deny_approver_verdict_is_cached_as_deny() {
        let policy = PermissionEvaluator::new(Arc::new(DenyApprover), Arc::new(NullSink))
            .with_rules(vec![PermissionRule::ask("delete_file", "*")]);
        let request = PermissionRequest::new("delete_file", "a.txt");
        assert_eq!(policy.request(&request).await, PermissionAction::Deny);
        let approvals = policy.approvals(None);
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].action, PermissionAction::Deny);
        assert_eq!(policy.revoke_approvals(None), 1);
        assert!(policy.approvals(None).is_empty());
    }

    #[tokio::test]
    async fn allow_and_deny_never_reach_the_approver() {
        let approver = Arc::new(CountingApprover::default());
        let policy = PermissionEvaluator::new(approver.clone(), Arc::new(NullSink))
            .with_rules(vec![PermissionRule::deny("delete_file", "*")]);
        assert_eq!(
            policy
                .request(&PermissionRequest::new("delete_file", "*"))
                .await,
            PermissionAction::Deny
        );
        assert_eq!(
            policy
                .request(&PermissionRequest::new("read_text_file", "*"))
                .await,
            PermissionAction::Allow
        );
        assert_eq!(approver.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_session_drops_rules_and_approvals() {
        let policy = PermissionEvaluator::default();
        let sid = Uuid::now_v7();
        policy.add_session_rule(sid, PermissionRule::deny("*", "*"));
        policy.set_agent_rules(sid, vec![PermissionRule::deny("*", "*")]);
        policy.clear_session(sid);
        assert!(policy.session_rules(sid).is_empty());
        assert!(policy.agent_rules(sid).is_empty());
        assert_eq!(policy.evaluate("x", "y", Some(sid)), PermissionAction::Allow);
    }

    #[test]
    fn rules_round_trip_through_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("permissions.json");
        let sid = Uuid::now_v7();
        let policy = PermissionEvaluator::default()
            .with_rules(vec![PermissionRule::deny("delete_*", "*")]);
        policy.add_session_rule(sid, PermissionRule::allow("delete_file", "tmp/*"));
        policy.save_rules(&path).expect("save");

        let restored = PermissionEvaluator::default();
        assert_eq!(restored.load_rules(&path).expect("load"), 2);
        assert_eq!(restored.rules(), policy.rules());
        assert_eq!(restored.session_rules(sid), policy.session_rules(sid));
        assert_eq!(
            restored
                .load_rules(&dir.path().join("absent.json"))
                .expect("absent"),
            0
        );
    }

    proptest! {
        #[test]
        fn star_matches_everything(value in ".{0,24}") {
            prop_assert!(wildcard_match("*", &value));
        }

        #[test]
        fn literal_patterns_match_case_insensitively(value in "[a-zA-Z0-9_./-]{0,16}") {
            prop_assert!(wildcard_match(&value, &value.to_ascii_uppercase()));
            prop_assert!(wildcard_match(&value, &value.to_ascii_lowercase()));
        }

        #[test]
        fn prefix_star_matches_any_suffix(
            prefix in "[a-z_]{1,8}",
            suffix in "[a-z0-9_./-]{0,12}",
        ) {
            let pattern = format!("{prefix}*");
            let candidate = format!("{prefix}{suffix}");
            prop_assert!(wildcard_match(&pattern, &candidate));
        }

        #[test]
        fn question_mark_matches_exactly_one_char(value in "[a-z]{0,6}") {
            let pattern = "?".repeat(3);
            prop_assert_eq!(wildcard_match(&pattern, &value), value.chars().count() == 3);
        }

        #[test]
        fn session_rule_always_precedes_global(
            permission in "[a-z_]{1,10}",
            value in "[a-z0-9./]{0,10}",
            session_allows in any::<bool>(),
        ) {
            let (session_rule, global_rule, expected) = if session_allows {
                (PermissionRule::allow("*", "*"), PermissionRule::deny("*", "*"), PermissionAction::Allow)
            } else {
                (PermissionRule::deny("*", "*"), PermissionRule::allow("*", "*"), PermissionAction::Deny)
            };
            let policy = PermissionEvaluator::default().with_rules(vec![global_rule]);
            let sid = Uuid::now_v7();
            policy.add_session_rule(sid, session_rule);
            prop_assert_eq!(policy.evaluate(&permission, &value, Some(sid)), expected);
        }

        #[test]
        fn unmatched_requests_default_to_allow(
            permission in "[a-z]{1,10}",
            value in "[a-z]{0,10}",
        ) {
            let policy = PermissionEvaluator::default()
                .with_rules(vec![PermissionRule::deny("zz_never_*", "*")]);
            prop_assert_eq!(policy.evaluate(&permission, &value, None), PermissionAction::Allow);
        }
    }
}
