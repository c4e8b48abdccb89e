//! Human-like pacing between requests.
//!
//! A small state machine over a closed set of pacing profiles. Transitions
//! are stochastic self-switches with low per-request probability, plus one
//! forced transition: a streak of coordinator failures drops the controller
//! into its most cautious profile.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

use crate::engine::session::Session;

/// Closed set of pacing profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacingProfile {
    /// Short gaps, confident clicking-through.
    Brisk,
    /// Baseline browsing envelope.
    Normal,
    /// Long deliberate gaps after trouble.
    Cautious,
    /// Wide spread, simulates a distracted operator.
    Erratic,
}

impl PacingProfile {
    pub const ALL: [PacingProfile; 4] = [
        PacingProfile::Brisk,
        PacingProfile::Normal,
        PacingProfile::Cautious,
        PacingProfile::Erratic,
    ];

    /// Inter-request delay envelope in seconds.
    pub fn delay_range(self) -> (f64, f64) {
        match self {
            PacingProfile::Brisk => (0.8, 2.5),
            PacingProfile::Normal => (2.0, 8.0),
            PacingProfile::Cautious => (6.0, 18.0),
            PacingProfile::Erratic => (0.5, 12.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Per-request probability of a spontaneous profile switch.
    pub switch_probability: f64,
    /// Consecutive coordinator failures before the forced Cautious switch.
    pub failure_streak_threshold: u32,
    /// The first requests of a session pace slower (orientation).
    pub orientation_requests: u32,
    pub orientation_factor: f64,
    /// A middle window paces faster (flow), then back to baseline.
    pub flow_window: (u32, u32),
    pub flow_factor: f64,
    /// Multiplicative jitter applied to every sampled delay.
    pub jitter: f64,
    /// Session rotation threshold is re-rolled uniformly from this range.
    pub rotation_threshold_range: (u32, u32),
    pub initial_profile: PacingProfile,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            switch_probability: 0.08,
            failure_streak_threshold: 3,
            orientation_requests: 3,
            orientation_factor: 1.5,
            flow_window: (8, 15),
            flow_factor: 0.6,
            jitter: 0.2,
            rotation_threshold_range: (15, 25),
            initial_profile: PacingProfile::Normal,
        }
    }
}

/// Pacing state machine, one per logical session chain.
///
/// Holds no resources; runs for the life of the orchestration loop.
#[derive(Debug, Clone)]
pub struct TimingController {
    config: TimingConfig,
    active: PacingProfile,
    consecutive_failures: u32,
}

impl TimingController {
    pub fn new(config: TimingConfig) -> Self {
        let active = config.initial_profile;
        Self {
            config,
            active,
            consecutive_failures: 0,
        }
    }

    pub fn active_profile(&self) -> PacingProfile {
        self.active
    }

    /// Sample the delay to wait before the session's next request.
    pub fn next_delay(&mut self, session: &Session) -> Duration {
        let mut rng = rand::thread_rng();

        if self.active != PacingProfile::Cautious || self.consecutive_failures == 0 {
            self.maybe_switch(&mut rng);
        }

        let (min, max) = self.active.delay_range();
        let mut delay = rng.gen_range(min..=max);

        let jitter = rng.gen_range(1.0 - self.config.jitter..=1.0 + self.config.jitter);
        delay *= jitter;

        delay *= self.positional_bias(session.downloads_this_session);

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// True iff the session has served its rolled quota.
    pub fn should_rotate_session(&self, session: &Session) -> bool {
        session.is_due_for_rotation()
    }

    /// Feed back the retry coordinator's terminal result for a target.
    /// A failure streak forces the most cautious profile; a success clears it.
    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.config.failure_streak_threshold {
                self.active = PacingProfile::Cautious;
            }
        }
    }

    /// Roll a fresh rotation threshold for a new session.
    pub fn roll_rotation_threshold(&self) -> u32 {
        let (low, high) = self.config.rotation_threshold_range;
        if low >= high {
            return low.max(1);
        }
        rand::thread_rng().gen_range(low..=high)
    }

    /// The profile a newly created session starts under.
    pub fn roll_pattern(&self) -> PacingProfile {
        self.active
    }

    fn maybe_switch(&mut self, rng: &mut impl Rng) {
        if rng.gen_bool(self.config.switch_probability) {
            let next = PacingProfile::ALL
                .iter()
                .filter(|p| **p != self.active)
                .collect::<Vec<_>>();
            if let Some(profile) = next.choose(rng) {
                self.active = **profile;
            }
        }
    }

    /// Early requests in a session pace slower (orientation), a middle window
    /// faster (flow), after which the baseline applies.
    fn positional_bias(&self, position: u32) -> f64 {
        if position < self.config.orientation_requests {
            self.config.orientation_factor
        } else if position >= self.config.flow_window.0 && position < self.config.flow_window.1 {
            self.config.flow_factor
        } else {
            1.0
        }
    }
}

impl Default for TimingController {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::Session;
    use crate::modules::identity::IdentityGenerator;

    fn session_at(position: u32) -> Session {
        let identity = IdentityGenerator::new().generate().unwrap();
        let mut session = Session::new(identity, None, 100, PacingProfile::Normal);
        session.downloads_this_session = position;
        session
    }

    fn fixed_controller() -> TimingController {
        TimingController::new(TimingConfig {
            switch_probability: 0.0,
            ..TimingConfig::default()
        })
    }

    #[test]
    fn delays_stay_within_biased_envelope() {
        let mut controller = fixed_controller();
        let (min, max) = PacingProfile::Normal.delay_range();

        // Baseline position: jitter widens the envelope by at most 20%.
        let session = session_at(20);
        for _ in 0..100 {
            let delay = controller.next_delay(&session).as_secs_f64();
            assert!(delay >= min * 0.8 - 1e-9 && delay <= max * 1.2 + 1e-9, "{delay}");
        }
    }

    #[test]
    fn orientation_requests_pace_slower_than_flow() {
        let mut controller = fixed_controller();
        let early = session_at(0);
        let flowing = session_at(10);

        let avg = |controller: &mut TimingController, session: &Session| {
            (0..200)
                .map(|_| controller.next_delay(session).as_secs_f64())
                .sum::<f64>()
                / 200.0
        };

        let early_avg = avg(&mut controller, &early);
        let flow_avg = avg(&mut controller, &flowing);
        assert!(early_avg > flow_avg);
    }

    #[test]
    fn failure_streak_forces_cautious() {
        let mut controller = fixed_controller();
        assert_eq!(controller.active_profile(), PacingProfile::Normal);
        controller.record_outcome(false);
        controller.record_outcome(false);
        assert_eq!(controller.active_profile(), PacingProfile::Normal);
        controller.record_outcome(false);
        assert_eq!(controller.active_profile(), PacingProfile::Cautious);
        controller.record_outcome(true);
        assert_eq!(controller.active_profile(), PacingProfile::Cautious);
    }

    #[test]
    fn rotation_threshold_rolls_inside_range_and_varies() {
        let controller = fixed_controller();
        let rolls: Vec<u32> = (0..100).map(|_| controller.roll_rotation_threshold()).collect();
        assert!(rolls.iter().all(|r| (15..=25).contains(r)));
        assert!(rolls.iter().any(|r| *r != rolls[0]), "threshold never varied");
    }

    #[test]
    fn rotation_follows_session_quota() {
        let controller = fixed_controller();
        let mut session = session_at(0);
        session.rotation_threshold = 2;
        assert!(!controller.should_rotate_session(&session));
        session.record_download();
        session.record_download();
        assert!(controller.should_rotate_session(&session));
    }
}
