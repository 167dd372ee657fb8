//! Scheduler: picks the next (actor, action, parameters) triple.
//!
//! All randomness comes from one seeded stream, so a run is a pure function
//! of its seed and the states it observes.

use crate::actor::{ActionChoice, Actor, ActorRegistry};
use protosim_core::{ActionCatalogue, ParameterDraw, Parameters, WorldState};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How the acting actor is drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorWeighting {
    /// Every eligible actor is equally likely
    #[default]
    Uniform,
    /// Proportional to the actor's roster weight
    Weighted,
}

/// A fully resolved choice for the next step.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Index into the actor registry
    pub actor_index: usize,
    pub action: String,
    pub params: Parameters,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleDecision {
    Selected(Selection),
    /// No actor has any action with eligible parameters in this state
    NoEligibleAction,
    /// A parameter rule of `action` could not be evaluated
    AuthoringError { action: String, message: String },
}

/// Seeded step scheduler.
pub struct Scheduler {
    rng: ChaCha8Rng,
    weighting: ActorWeighting,
    /// Actions tried per actor before moving on
    max_attempts: usize,
}

impl Scheduler {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self {
            rng,
            weighting: ActorWeighting::Uniform,
            max_attempts: 3,
        }
    }

    pub fn with_weighting(mut self, weighting: ActorWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Selects the next step against `state`.
    ///
    /// An actor whose every permitted action yields no eligible parameters
    /// is dropped for this step and another actor is drawn. A generation
    /// error ends selection with [`ScheduleDecision::AuthoringError`].
    pub fn select_next(
        &mut self,
        registry: &ActorRegistry,
        catalogue: &ActionCatalogue,
        state: &WorldState,
    ) -> ScheduleDecision {
        let mut candidates: Vec<usize> = registry
            .iter()
            .enumerate()
            .filter(|(_, a)| a.has_selectable_actions())
            .map(|(i, _)| i)
            .collect();

        while !candidates.is_empty() {
            let slot = self.pick_actor(registry, &candidates);
            let actor_index = candidates[slot];
            let Some(actor) = registry.get(actor_index) else {
                candidates.remove(slot);
                continue;
            };

            for choice in self.action_order(actor).into_iter().take(self.max_attempts) {
                let Some(model) = catalogue.get(&choice.name) else {
                    continue;
                };
                match model.generate_parameters(&mut self.rng, state, actor.primary_account()) {
                    Ok(ParameterDraw::Ready(params)) => {
                        debug!("Selected {} -> {}{}", actor.id, model.name, params);
                        return ScheduleDecision::Selected(Selection {
                            actor_index,
                            action: model.name.clone(),
                            params,
                        });
                    }
                    Ok(ParameterDraw::NoEligibleParameters { reason }) => {
                        debug!("{} cannot {}: {}", actor.id, model.name, reason);
                    }
                    Err(e) => {
                        warn!("Parameter generation for '{}' failed: {}", model.name, e);
                        return ScheduleDecision::AuthoringError {
                            action: model.name.clone(),
                            message: e.to_string(),
                        };
                    }
                }
            }

            candidates.remove(slot);
        }

        ScheduleDecision::NoEligibleAction
    }

    fn pick_actor(&mut self, registry: &ActorRegistry, candidates: &[usize]) -> usize {
        if self.weighting == ActorWeighting::Weighted {
            let weights: Vec<f64> = candidates
                .iter()
                .map(|&i| registry.get(i).map(|a| a.weight).unwrap_or(0.0))
                .collect();
            if let Ok(dist) = WeightedIndex::new(&weights) {
                return dist.sample(&mut self.rng);
            }
        }
        self.rng.gen_range(0..candidates.len())
    }

    /// One weighted draw first, then the remaining actions by descending
    /// probability. Zero-probability actions are never tried.
    fn action_order<'a>(&mut self, actor: &'a Actor) -> Vec<&'a ActionChoice> {
        let mut selectable: Vec<&ActionChoice> =
            actor.actions.iter().filter(|a| a.probability > 0.0).collect();
        if selectable.is_empty() {
            return selectable;
        }

        let weights: Vec<f64> = selectable.iter().map(|a| a.probability).collect();
        let first = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0,
        };

        let head = selectable.remove(first);
        selectable.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        selectable.insert(0, head);
        selectable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::DeterministicAccountProvider;
    use crate::actor::ActorRoster;
    use protosim_env::Value;
    use rand::SeedableRng;

    const ACTIONS: &str = r#"[
        {"name": "ping", "contract": "C",
         "pre_execution_parameter_generation_rules": [
            {"name": "n", "rule": {"kind": "range", "min": 1, "max": 10}}]},
        {"name": "poke", "contract": "C",
         "pre_execution_parameter_generation_rules": [
            {"name": "id", "rule": {"kind": "existing", "source": "C.items"}}]}
    ]"#;

    fn setup(roster: &str) -> (ActorRegistry, ActionCatalogue) {
        let catalogue = ActionCatalogue::from_json(ACTIONS).unwrap();
        let roster = ActorRoster::from_json(roster, &catalogue).unwrap();
        let registry = ActorRegistry::from_roster(&roster, &mut DeterministicAccountProvider::new(3));
        (registry, catalogue)
    }

    fn scheduler(seed: u64) -> Scheduler {
        Scheduler::new(ChaCha8Rng::seed_from_u64(seed))
    }

    #[test]
    fn test_falls_back_to_eligible_action() {
        let (registry, catalogue) = setup(
            r#"{"actors": [{"name": "A", "actions": [
                {"name": "poke", "probability": 0.9}, {"name": "ping", "probability": 0.1}]}]}"#,
        );
        let mut s = scheduler(5);
        for _ in 0..20 {
            match s.select_next(&registry, &catalogue, &WorldState::default()) {
                ScheduleDecision::Selected(sel) => assert_eq!(sel.action, "ping"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_no_eligible_action() {
        let (registry, catalogue) = setup(
            r#"{"actors": [{"name": "A", "count": 2, "actions": [{"name": "poke", "probability": 1.0}]}]}"#,
        );
        let decision = scheduler(1).select_next(&registry, &catalogue, &WorldState::default());
        assert_eq!(decision, ScheduleDecision::NoEligibleAction);
    }

    #[test]
    fn test_uses_visible_entities() {
        let (registry, catalogue) = setup(
            r#"{"actors": [{"name": "A", "actions": [{"name": "poke", "probability": 1.0}]}]}"#,
        );
        let mut state = WorldState::default();
        state
            .contracts
            .insert("C".into(), serde_json::from_str(r#"{"items": {"4": true}}"#).unwrap());
        match scheduler(2).select_next(&registry, &catalogue, &state) {
            ScheduleDecision::Selected(sel) => assert_eq!(sel.params.get("id"), Some(&Value::int(4))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_zero_weight_actor_skipped_when_weighted() {
        let (registry, catalogue) = setup(
            r#"{"actors": [
                {"name": "Idle", "weight": 0.0, "actions": [{"name": "ping", "probability": 1.0}]},
                {"name": "Busy", "weight": 1.0, "actions": [{"name": "ping", "probability": 1.0}]}
            ]}"#,
        );
        let mut s = scheduler(9).with_weighting(ActorWeighting::Weighted);
        for _ in 0..20 {
            match s.select_next(&registry, &catalogue, &WorldState::default()) {
                ScheduleDecision::Selected(sel) => assert_eq!(sel.actor_index, 1),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_generation_error_is_reported() {
        let catalogue = ActionCatalogue::from_json(
            r#"[{"name": "broken", "contract": "C",
                 "pre_execution_parameter_generation_rules": [
                    {"name": "n", "rule": {"kind": "range", "min": 1, "max": "10 / (2 - 2)"}}]}]"#,
        )
        .unwrap();
        let roster = ActorRoster::from_json(
            r#"{"actors": [{"name": "A", "actions": [{"name": "broken", "probability": 1.0}]}]}"#,
            &catalogue,
        )
        .unwrap();
        let registry = ActorRegistry::from_roster(&roster, &mut DeterministicAccountProvider::new(3));

        let decision = scheduler(4).select_next(&registry, &catalogue, &WorldState::default());
        match decision {
            ScheduleDecision::AuthoringError { action, message } => {
                assert_eq!(action, "broken");
                assert!(message.contains("zero"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let roster = r#"{"actors": [{"name": "A", "count": 3, "actions": [{"name": "ping", "probability": 1.0}]}]}"#;
        let (registry, catalogue) = setup(roster);
        let run = |seed| {
            let mut s = scheduler(seed);
            (0..10)
                .map(|_| s.select_next(&registry, &catalogue, &WorldState::default()))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
    }
}
