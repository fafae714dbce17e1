//! Policy engine: pure rules composed by priority.
//!
//! A rule maps `(event, session state)` to a [`Decision`]. The engine
//! evaluates enabled rules in priority order; Block dominates Warn
//! dominates Allow, and the first Block short-circuits. Rules may also
//! request a working-tree checkpoint, which the dispatcher performs.

pub mod rules;

pub use rules::{TypecheckGate, standard_rules};

use crate::config::Config;
use crate::hooks::HookEvent;
use crate::project::ProjectPaths;
use crate::wsi::{FileHashCache, WsiStore};

/// Outcome of a single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No objection.
    Allow,
    /// Allow, with an advisory for the host's stderr.
    Warn(String),
    /// Refuse the operation with a reason.
    Block(String),
}

impl Decision {
    /// True for `Block`.
    #[must_use]
    pub const fn is_block(&self) -> bool {
        matches!(self, Self::Block(_))
    }
}

/// Mutable per-event view of the session's on-disk state.
pub struct SessionState<'a> {
    /// Turn counter value for this event.
    pub turn: u64,
    /// Resolved project layout.
    pub project: &'a ProjectPaths,
    /// Merged configuration.
    pub config: &'a Config,
    /// Duplicate-read cache (mutated by R1).
    pub hashes: &'a mut FileHashCache,
    /// Working set index (read-only for rules).
    pub wsi: &'a WsiStore,
    /// Typecheck gate state (read by R5).
    pub gate: &'a mut TypecheckGate,
}

/// A policy rule.
pub trait PolicyRule {
    /// Stable identifier used in config overrides and block messages.
    fn id(&self) -> &'static str;

    /// Evaluation order; higher runs first.
    fn priority(&self) -> u8 {
        50
    }

    /// Evaluates the rule for one event.
    fn evaluate(&self, event: &HookEvent, state: &mut SessionState<'_>) -> Decision;

    /// Checkpoint trigger, when this rule wants a snapshot first.
    fn checkpoint_trigger(&self, _event: &HookEvent, _state: &SessionState<'_>) -> Option<String> {
        None
    }
}

/// Composed result of an engine run.
#[derive(Debug, Default)]
pub struct Verdict {
    /// The blocking rule and its reason, if any rule blocked.
    pub block: Option<(String, String)>,
    /// Accumulated warnings from non-blocking rules.
    pub warnings: Vec<String>,
    /// Checkpoint triggers requested by rules.
    pub checkpoint_triggers: Vec<String>,
}

impl Verdict {
    /// Host exit code: 2 block, 1 warn, 0 silent allow.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.block.is_some() {
            2
        } else if !self.warnings.is_empty() {
            1
        } else {
            0
        }
    }
}

/// Priority-ordered rule set.
pub struct PolicyEngine {
    rules: Vec<Box<dyn PolicyRule>>,
}

impl PolicyEngine {
    /// Builds the engine from an explicit rule list (tests, custom sets).
    #[must_use]
    pub fn new(mut rules: Vec<Box<dyn PolicyRule>>) -> Self {
        rules.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id().cmp(b.id())));
        Self { rules }
    }

    /// Builds the shipped rule set, honoring config enable flags.
    /// Unknown rule ids in config are ignored.
    #[must_use]
    pub fn standard(config: &Config) -> Self {
        let rules = standard_rules(config)
            .into_iter()
            .filter(|r| config.policy.rule_enabled(r.id()))
            .collect();
        Self::new(rules)
    }

    /// Rule ids in evaluation order.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Evaluates all rules for one event.
    ///
    /// Checkpoint triggers are collected from every rule regardless of
    /// decisions; decisions are composed with Block short-circuiting.
    pub fn evaluate(&self, event: &HookEvent, state: &mut SessionState<'_>) -> Verdict {
        let mut verdict = Verdict::default();

        for rule in &self.rules {
            if let Some(trigger) = rule.checkpoint_trigger(event, state) {
                verdict.checkpoint_triggers.push(trigger);
            }
        }

        for rule in &self.rules {
            match rule.evaluate(event, state) {
                Decision::Allow => {}
                Decision::Warn(message) => verdict.warnings.push(message),
                Decision::Block(reason) => {
                    verdict.block = Some((rule.id().to_string(), reason));
                    break;
                }
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookEventKind;
    use tempfile::TempDir;

    struct FixedRule {
        id: &'static str,
        priority: u8,
        decision: Decision,
        trigger: Option<String>,
    }

    impl PolicyRule for FixedRule {
        fn id(&self) -> &'static str {
            self.id
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn evaluate(&self, _event: &HookEvent, _state: &mut SessionState<'_>) -> Decision {
            self.decision.clone()
        }

        fn checkpoint_trigger(
            &self,
            _event: &HookEvent,
            _state: &SessionState<'_>,
        ) -> Option<String> {
            self.trigger.clone()
        }
    }

    fn with_state<R>(f: impl FnOnce(&HookEvent, &mut SessionState<'_>) -> R) -> R {
        let dir = TempDir::new().unwrap();
        let project = ProjectPaths::resolve(Some(dir.path())).unwrap();
        let config = Config::default();
        let mut hashes = FileHashCache::load(&project.hashes_path);
        let wsi = WsiStore::load(&project.wsi_path, &config.wsi);
        let mut gate = TypecheckGate::load(&project.gate_path);
        let mut state = SessionState {
            turn: 1,
            project: &project,
            config: &config,
            hashes: &mut hashes,
            wsi: &wsi,
            gate: &mut gate,
        };
        let event = HookEvent::new(HookEventKind::PreTool, serde_json::json!({})).unwrap();
        f(&event, &mut state)
    }

    #[test]
    fn test_block_dominates_and_short_circuits() {
        let engine = PolicyEngine::new(vec![
            Box::new(FixedRule {
                id: "warns",
                priority: 90,
                decision: Decision::Warn("careful".to_string()),
                trigger: None,
            }),
            Box::new(FixedRule {
                id: "blocks",
                priority: 80,
                decision: Decision::Block("denied".to_string()),
                trigger: None,
            }),
            Box::new(FixedRule {
                id: "later_warn",
                priority: 10,
                decision: Decision::Warn("never reached".to_string()),
                trigger: None,
            }),
        ]);

        let verdict = with_state(|event, state| engine.evaluate(event, state));
        assert_eq!(verdict.exit_code(), 2);
        let (rule, reason) = verdict.block.unwrap();
        assert_eq!(rule, "blocks");
        assert_eq!(reason, "denied");
        // The earlier warn was recorded, the later one never evaluated
        assert_eq!(verdict.warnings, vec!["careful".to_string()]);
    }

    #[test]
    fn test_warnings_accumulate() {
        let engine = PolicyEngine::new(vec![
            Box::new(FixedRule {
                id: "w1",
                priority: 60,
                decision: Decision::Warn("first".to_string()),
                trigger: None,
            }),
            Box::new(FixedRule {
                id: "w2",
                priority: 50,
                decision: Decision::Warn("second".to_string()),
                trigger: None,
            }),
        ]);

        let verdict = with_state(|event, state| engine.evaluate(event, state));
        assert_eq!(verdict.exit_code(), 1);
        assert_eq!(verdict.warnings.len(), 2);
    }

    #[test]
    fn test_all_allow_is_silent() {
        let engine = PolicyEngine::new(vec![Box::new(FixedRule {
            id: "quiet",
            priority: 50,
            decision: Decision::Allow,
            trigger: None,
        })]);

        let verdict = with_state(|event, state| engine.evaluate(event, state));
        assert_eq!(verdict.exit_code(), 0);
        assert!(verdict.block.is_none());
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn test_checkpoint_triggers_collected_even_with_block() {
        let engine = PolicyEngine::new(vec![
            Box::new(FixedRule {
                id: "snap",
                priority: 10,
                decision: Decision::Allow,
                trigger: Some("periodic".to_string()),
            }),
            Box::new(FixedRule {
                id: "blocks",
                priority: 90,
                decision: Decision::Block("no".to_string()),
                trigger: None,
            }),
        ]);

        let verdict = with_state(|event, state| engine.evaluate(event, state));
        assert_eq!(verdict.checkpoint_triggers, vec!["periodic".to_string()]);
        assert!(verdict.block.is_some());
    }

    #[test]
    fn test_priority_ordering() {
        let engine = PolicyEngine::new(vec![
            Box::new(FixedRule {
                id: "low",
                priority: 10,
                decision: Decision::Allow,
                trigger: None,
            }),
            Box::new(FixedRule {
                id: "high",
                priority: 90,
                decision: Decision::Allow,
                trigger: None,
            }),
        ]);
        assert_eq!(engine.rule_ids(), vec!["high", "low"]);
    }

    #[test]
    fn test_standard_respects_config_disable() {
        let mut config = Config::default();
        config.policy.rules.insert(
            "duplicate_read".to_string(),
            crate::config::RuleConfig {
                enabled: false,
                params: serde_json::Value::Null,
            },
        );
        let engine = PolicyEngine::standard(&config);
        assert!(!engine.rule_ids().contains(&"duplicate_read"));

        let default_engine = PolicyEngine::standard(&Config::default());
        assert!(default_engine.rule_ids().contains(&"duplicate_read"));
    }
}
