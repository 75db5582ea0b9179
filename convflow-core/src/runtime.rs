//! Conversation runtime - drives instances of one definition as messages arrive.

use crate::definition::{ConversationDefinition, PromptAction, StateId, Target};
use crate::instance::{ConversationInstance, CurrentState, InstanceKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of dispatching a trigger or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// A new instance was created at the entry state.
    Started,
    /// A rule fired and the instance moved to another state.
    Advanced { from: StateId, to: StateId },
    /// A terminal rule fired; the instance ended.
    Completed,
    /// The cancel command ended the instance.
    Cancelled,
    /// No rule of the current state matched; nothing changed.
    NoMatch,
    /// No live instance for the key (or a live one on entry trigger).
    Ignored,
}

impl DispatchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchResult::Started => "started",
            DispatchResult::Advanced { .. } => "advanced",
            DispatchResult::Completed => "completed",
            DispatchResult::Cancelled => "cancelled",
            DispatchResult::NoMatch => "no_match",
            DispatchResult::Ignored => "ignored",
        }
    }

    /// Returns true if the instance ended as a result.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchResult::Completed | DispatchResult::Cancelled)
    }
}

/// A dispatch result together with the prompt to deliver, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub result: DispatchResult,
    pub reply: Option<PromptAction>,
}

impl Dispatch {
    fn silent(result: DispatchResult) -> Self {
        Self {
            result,
            reply: None,
        }
    }

    fn reply(result: DispatchResult, action: &PromptAction) -> Self {
        Self {
            result,
            reply: Some(action.clone()),
        }
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    pub started: AtomicU64,
    pub advanced: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
    pub no_match: AtomicU64,
    pub ignored: AtomicU64,
    pub evicted: AtomicU64,
}

impl RuntimeStats {
    fn record(&self, result: DispatchResult) {
        let counter = match result {
            DispatchResult::Started => &self.started,
            DispatchResult::Advanced { .. } => &self.advanced,
            DispatchResult::Completed => &self.completed,
            DispatchResult::Cancelled => &self.cancelled,
            DispatchResult::NoMatch => &self.no_match,
            DispatchResult::Ignored => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type InstanceHandle = Arc<Mutex<ConversationInstance>>;

/// Drives conversation instances against a shared definition.
///
/// Instances for different keys never contend beyond a map shard. Messages
/// for the same key are serialized by that instance's mutex, so each
/// read-modify-write of the current state is atomic.
pub struct ConversationRuntime {
    /// Shared read-only definition.
    definition: Arc<ConversationDefinition>,

    /// Live instances indexed by conversation identity.
    instances: DashMap<InstanceKey, InstanceHandle>,

    stats: RuntimeStats,
}

impl ConversationRuntime {
    pub fn new(definition: Arc<ConversationDefinition>) -> Self {
        Self {
            definition,
            instances: DashMap::new(),
            stats: RuntimeStats::default(),
        }
    }

    /// Returns the definition driven by this runtime.
    pub fn definition(&self) -> &Arc<ConversationDefinition> {
        &self.definition
    }

    /// Starts a conversation for `key` unless one is already live.
    pub fn on_entry_trigger(&self, key: InstanceKey) -> Dispatch {
        let def = &self.definition;

        // Lock order: map shard, then instance.
        let dispatch = match self.instances.entry(key) {
            Entry::Occupied(mut occupied) => {
                let ended = occupied.get().lock().is_ended();
                if ended {
                    occupied.insert(new_handle(key, def.entry_state));
                    Dispatch::reply(DispatchResult::Started, &def.entry_action)
                } else {
                    Dispatch::silent(DispatchResult::Ignored)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(new_handle(key, def.entry_state));
                Dispatch::reply(DispatchResult::Started, &def.entry_action)
            }
        };

        match dispatch.result {
            DispatchResult::Started => {
                tracing::debug!("[{}] Conversation '{}' started", key, def.name)
            }
            _ => tracing::debug!("[{}] Entry trigger ignored, conversation is live", key),
        }

        self.stats.record(dispatch.result);
        dispatch
    }

    /// Dispatches a message to the instance for `key`.
    pub fn on_message(&self, key: InstanceKey, text: &str) -> Dispatch {
        let Some(handle) = self.instances.get(&key).map(|r| Arc::clone(r.value())) else {
            self.stats.record(DispatchResult::Ignored);
            return Dispatch::silent(DispatchResult::Ignored);
        };

        let dispatch = {
            let mut instance = handle.lock();
            self.step(&mut instance, text)
        };

        // The instance lock is released before touching the map again.
        if dispatch.result.is_terminal() {
            self.instances
                .remove_if(&key, |_, stored| Arc::ptr_eq(stored, &handle));
        }

        self.stats.record(dispatch.result);
        dispatch
    }

    fn step(&self, instance: &mut ConversationInstance, text: &str) -> Dispatch {
        let def = &self.definition;
        let key = instance.key;

        let CurrentState::Active(current) = instance.current else {
            return Dispatch::silent(DispatchResult::Ignored);
        };

        if def.cancel_command.matches(text) {
            instance.end();
            tracing::info!("[{}] User canceled the conversation", key);
            return Dispatch::reply(DispatchResult::Cancelled, &def.cancel_action);
        }

        let Some(rule) = def.find_rule(&current, text) else {
            tracing::debug!("[{}] No rule matched in state {}", key, current);
            return Dispatch::silent(DispatchResult::NoMatch);
        };

        match rule.target {
            Target::State(next) => {
                instance.advance(next);
                tracing::debug!("[{}] {} -> {}", key, current, next);
                Dispatch::reply(
                    DispatchResult::Advanced {
                        from: current,
                        to: next,
                    },
                    &rule.action,
                )
            }
            Target::Terminal => {
                instance.end();
                tracing::debug!("[{}] {} -> TERMINAL", key, current);
                Dispatch::reply(DispatchResult::Completed, &rule.action)
            }
        }
    }

    // =========================================================================
    // Instance inspection
    // =========================================================================

    /// Returns a copy of the live instance for `key`.
    pub fn get_instance(&self, key: &InstanceKey) -> Option<ConversationInstance> {
        self.instances.get(key).map(|r| r.value().lock().clone())
    }

    /// Returns the current state of `key`, or `Ended` if there is no live
    /// instance.
    pub fn current_state(&self, key: &InstanceKey) -> CurrentState {
        self.get_instance(key)
            .map(|i| i.current)
            .unwrap_or(CurrentState::Ended)
    }

    /// Returns the number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Returns the keys of all live instances.
    pub fn active_keys(&self) -> Vec<InstanceKey> {
        self.instances.iter().map(|r| *r.key()).collect()
    }

    /// Removes instances idle for longer than `max_idle`. Returns the number
    /// removed.
    ///
    /// Evicted instances are ended under their own lock, so a message that
    /// already holds a handle to one is ignored instead of advancing it.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let max_idle_ms = i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);
        let before = self.instances.len();
        self.instances.retain(|key, handle| {
            let mut instance = handle.lock();
            if instance.idle_millis() <= max_idle_ms {
                return true;
            }
            instance.end();
            tracing::debug!("[{}] Evicting idle conversation", key);
            false
        });
        let evicted = before.saturating_sub(self.instances.len());
        self.stats
            .evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Returns dispatch counters.
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }
}

fn new_handle(key: InstanceKey, entry_state: StateId) -> InstanceHandle {
    Arc::new(Mutex::new(ConversationInstance::new(key, entry_state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowBuilder;
    use proptest::prelude::*;
    use std::thread;

    fn survey() -> Arc<ConversationDefinition> {
        let def = FlowBuilder::named("survey")
            .start(PromptAction::new("gender?").with_options([["Boy", "Girl", "Other"]]))
            .attach_reply("age?", r"^(Boy|Girl|Other)$")
            .unwrap()
            .stop_with("thanks", r"^\d+$")
            .unwrap()
            .chain_conversation("cancelled")
            .unwrap();
        Arc::new(def)
    }

    fn key(n: i64) -> InstanceKey {
        InstanceKey::new(n, n)
    }

    #[test]
    fn test_full_conversation() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);

        let d = runtime.on_entry_trigger(k);
        assert_eq!(d.result, DispatchResult::Started);
        let reply = d.reply.unwrap();
        assert_eq!(reply.text, "gender?");
        assert!(reply.has_keyboard());

        let entry = runtime.definition().entry_state;
        assert_eq!(runtime.current_state(&k), CurrentState::Active(entry));

        let d = runtime.on_message(k, "Boy");
        assert!(matches!(d.result, DispatchResult::Advanced { from, .. } if from == entry));
        assert_eq!(d.reply.unwrap().text, "age?");
        assert_ne!(runtime.current_state(&k), CurrentState::Active(entry));

        let d = runtime.on_message(k, "9");
        assert_eq!(d.result, DispatchResult::Completed);
        let reply = d.reply.unwrap();
        assert_eq!(reply.text, "thanks");
        assert!(reply.clear_keyboard);
        assert_eq!(runtime.current_state(&k), CurrentState::Ended);
        assert_eq!(runtime.instance_count(), 0);

        let d = runtime.on_message(k, "anything");
        assert_eq!(d.result, DispatchResult::Ignored);
        assert!(d.reply.is_none());
    }

    #[test]
    fn test_message_before_entry_is_ignored() {
        let runtime = ConversationRuntime::new(survey());
        let d = runtime.on_message(key(1), "Boy");
        assert_eq!(d.result, DispatchResult::Ignored);
        assert!(d.reply.is_none());
        assert_eq!(runtime.instance_count(), 0);
    }

    #[test]
    fn test_no_match_leaves_state_unchanged() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);
        runtime.on_message(k, "Girl");
        let before = runtime.current_state(&k);

        let d = runtime.on_message(k, "Purple");
        assert_eq!(d.result, DispatchResult::NoMatch);
        assert!(d.reply.is_none());
        assert_eq!(runtime.current_state(&k), before);

        // A well-formed answer still works afterwards
        let d = runtime.on_message(k, "12");
        assert_eq!(d.result, DispatchResult::Completed);
    }

    #[test]
    fn test_guard_requires_full_match() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);
        assert_eq!(runtime.on_message(k, "Boys").result, DispatchResult::NoMatch);
        assert_eq!(runtime.on_message(k, "A Girl").result, DispatchResult::NoMatch);
    }

    #[test]
    fn test_cancel_from_entry_state() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);

        let d = runtime.on_message(k, "/cancel");
        assert_eq!(d.result, DispatchResult::Cancelled);
        let reply = d.reply.unwrap();
        assert_eq!(reply.text, "cancelled");
        assert!(reply.clear_keyboard);
        assert_eq!(runtime.current_state(&k), CurrentState::Ended);
        assert_eq!(runtime.on_message(k, "Boy").result, DispatchResult::Ignored);
    }

    #[test]
    fn test_cancel_from_middle_state() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);
        runtime.on_message(k, "Other");

        let d = runtime.on_message(k, "/cancel@survey_bot");
        assert_eq!(d.result, DispatchResult::Cancelled);
        assert_eq!(runtime.current_state(&k), CurrentState::Ended);
    }

    #[test]
    fn test_entry_trigger_while_live_is_ignored() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);
        runtime.on_message(k, "Boy");
        let state = runtime.current_state(&k);

        let d = runtime.on_entry_trigger(k);
        assert_eq!(d.result, DispatchResult::Ignored);
        assert!(d.reply.is_none());
        assert_eq!(runtime.current_state(&k), state);
    }

    #[test]
    fn test_restart_after_end() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);
        runtime.on_message(k, "/cancel");

        let d = runtime.on_entry_trigger(k);
        assert_eq!(d.result, DispatchResult::Started);
        assert_eq!(
            runtime.current_state(&k),
            CurrentState::Active(runtime.definition().entry_state)
        );
    }

    #[test]
    fn test_first_matching_rule_wins() {
        use crate::definition::TransitionRule;
        use crate::guard::{Command, GuardPattern};
        use std::collections::HashMap;

        let entry = StateId::mint();
        let digits = StateId::mint();
        let rule = |guard: &str, text: &str, target: Target| TransitionRule {
            guard: GuardPattern::new(guard).unwrap(),
            action: PromptAction::new(text),
            target,
        };
        let mut states = HashMap::new();
        states.insert(
            entry,
            vec![
                rule(r"\d", "one digit", Target::State(digits)),
                rule(".*", "anything", Target::Terminal),
            ],
        );
        states.insert(digits, Vec::new());
        let def = ConversationDefinition::from_parts(
            "pick".to_string(),
            entry,
            PromptAction::new("pick a number"),
            states,
            PromptAction::new("bye").clearing(),
            Command::new("start"),
            Command::new("cancel"),
        );

        let runtime = ConversationRuntime::new(Arc::new(def));
        let (a, b) = (key(1), key(2));
        runtime.on_entry_trigger(a);
        runtime.on_entry_trigger(b);

        let d = runtime.on_message(a, "4");
        assert_eq!(d.reply.unwrap().text, "one digit");
        assert_eq!(runtime.current_state(&a), CurrentState::Active(digits));

        let d = runtime.on_message(b, "42");
        assert_eq!(d.result, DispatchResult::Completed);
        assert_eq!(d.reply.unwrap().text, "anything");
    }

    #[test]
    fn test_stuck_in_dangling_state() {
        let def = FlowBuilder::new()
            .start("q")
            .attach_reply("last", ".*")
            .unwrap()
            .chain_conversation("bye")
            .unwrap();
        let runtime = ConversationRuntime::new(Arc::new(def));
        let k = key(1);
        runtime.on_entry_trigger(k);
        runtime.on_message(k, "x");
        assert_eq!(runtime.on_message(k, "y").result, DispatchResult::NoMatch);
        assert_eq!(runtime.on_message(k, "/cancel").result, DispatchResult::Cancelled);
    }

    #[test]
    fn test_evict_idle() {
        let runtime = ConversationRuntime::new(survey());
        runtime.on_entry_trigger(key(1));
        runtime.on_entry_trigger(key(2));
        assert_eq!(runtime.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(runtime.instance_count(), 2);

        thread::sleep(Duration::from_millis(5));
        assert_eq!(runtime.evict_idle(Duration::ZERO), 2);
        assert_eq!(runtime.instance_count(), 0);
        assert_eq!(runtime.stats().evicted.load(Ordering::Relaxed), 2);
        assert_eq!(runtime.on_message(key(1), "Boy").result, DispatchResult::Ignored);
    }

    #[test]
    fn test_evict_idle_with_huge_limit_keeps_everything() {
        let runtime = ConversationRuntime::new(survey());
        runtime.on_entry_trigger(key(1));
        assert_eq!(runtime.evict_idle(Duration::from_secs(u64::MAX / 1000)), 0);
        assert_eq!(runtime.evict_idle(Duration::MAX), 0);
        assert_eq!(runtime.instance_count(), 1);
    }

    #[test]
    fn test_evicted_instance_cannot_be_advanced_by_held_handle() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);

        // A message that cloned the handle before eviction ran
        let held = runtime
            .instances
            .get(&k)
            .map(|r| Arc::clone(r.value()))
            .unwrap();

        thread::sleep(Duration::from_millis(5));
        assert_eq!(runtime.evict_idle(Duration::ZERO), 1);

        assert!(held.lock().is_ended());
        let dispatch = runtime.step(&mut held.lock(), "Boy");
        assert_eq!(dispatch.result, DispatchResult::Ignored);
        assert!(dispatch.reply.is_none());
    }

    #[test]
    fn test_stats() {
        let runtime = ConversationRuntime::new(survey());
        let k = key(1);
        runtime.on_entry_trigger(k);
        runtime.on_message(k, "nope");
        runtime.on_message(k, "Boy");
        runtime.on_message(k, "3");
        runtime.on_message(k, "late");

        let stats = runtime.stats();
        assert_eq!(stats.started.load(Ordering::Relaxed), 1);
        assert_eq!(stats.no_match.load(Ordering::Relaxed), 1);
        assert_eq!(stats.advanced.load(Ordering::Relaxed), 1);
        assert_eq!(stats.completed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.ignored.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_instances_are_isolated() {
        let runtime = Arc::new(ConversationRuntime::new(survey()));
        let handles: Vec<_> = (0..16)
            .map(|n| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    let k = key(n);
                    assert_eq!(runtime.on_entry_trigger(k).result, DispatchResult::Started);
                    if n % 2 == 0 {
                        assert!(matches!(
                            runtime.on_message(k, "Girl").result,
                            DispatchResult::Advanced { .. }
                        ));
                        assert_eq!(runtime.on_message(k, "30").result, DispatchResult::Completed);
                    } else {
                        assert_eq!(runtime.on_message(k, "30").result, DispatchResult::NoMatch);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entry = runtime.definition().entry_state;
        for n in 0..16 {
            let expected = if n % 2 == 0 {
                CurrentState::Ended
            } else {
                CurrentState::Active(entry)
            };
            assert_eq!(runtime.current_state(&key(n)), expected);
        }
        assert_eq!(runtime.instance_count(), 8);
    }

    #[test]
    fn test_same_instance_messages_serialize() {
        let runtime = Arc::new(ConversationRuntime::new(survey()));
        let k = key(1);
        runtime.on_entry_trigger(k);

        // Only one of the racing answers can advance out of the entry state.
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || runtime.on_message(k, "Boy").result)
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let advanced = results
            .iter()
            .filter(|r| matches!(r, DispatchResult::Advanced { .. }))
            .count();
        assert_eq!(advanced, 1);
        assert_eq!(
            results.iter().filter(|r| **r == DispatchResult::NoMatch).count(),
            7
        );
        assert_eq!(runtime.get_instance(&k).unwrap().steps, 1);
    }

    proptest! {
        #[test]
        fn prop_termination_is_idempotent(messages in proptest::collection::vec("[A-Za-z0-9/ ]{0,12}", 0..20)) {
            let runtime = ConversationRuntime::new(survey());
            let k = key(1);
            runtime.on_entry_trigger(k);
            runtime.on_message(k, "/cancel");

            for text in &messages {
                let d = runtime.on_message(k, text);
                prop_assert_eq!(d.result, DispatchResult::Ignored);
                prop_assert!(d.reply.is_none());
                prop_assert_eq!(runtime.current_state(&k), CurrentState::Ended);
            }
        }

        #[test]
        fn prop_cancel_ends_from_any_depth(depth in 0usize..2) {
            let runtime = ConversationRuntime::new(survey());
            let k = key(1);
            runtime.on_entry_trigger(k);
            if depth == 1 {
                runtime.on_message(k, "Boy");
            }
            let d = runtime.on_message(k, "/cancel");
            prop_assert_eq!(d.result, DispatchResult::Cancelled);
            prop_assert_eq!(d.reply.map(|r| r.text), Some("cancelled".to_string()));
            prop_assert_eq!(runtime.current_state(&k), CurrentState::Ended);
        }
    }
}
