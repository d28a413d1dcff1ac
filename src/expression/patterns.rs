//! Per-phase motion and indicator patterns.

use super::Phase;
use crate::robot::{
    neutral_pose, JointTarget, Rgb, BODY_Y, HEAD_P, HEAD_R, HEAD_Y, L_ELBOW_P, L_SHOULDER_P,
    R_ELBOW_P, R_SHOULDER_P,
};
use rand::Rng;
use std::time::Duration;

/// Extra settle time after every pose.
pub const POSE_SETTLE: Duration = Duration::from_millis(50);

pub const SPEAKING_PATTERN_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionStep {
    Pose {
        targets: Vec<JointTarget>,
        duration: Duration,
    },
    Hold(Duration),
}

impl MotionStep {
    fn pose(targets: &[(u8, i16)], duration_ms: u64) -> Self {
        MotionStep::Pose {
            targets: targets
                .iter()
                .map(|&(servo, position)| JointTarget::new(servo, position))
                .collect(),
            duration: Duration::from_millis(duration_ms),
        }
    }

    fn hold(ms: u64) -> Self {
        MotionStep::Hold(Duration::from_millis(ms))
    }

    /// Time this step occupies the motion worker.
    pub fn occupancy(&self) -> Duration {
        match self {
            MotionStep::Pose { duration, .. } => *duration + POSE_SETTLE,
            MotionStep::Hold(duration) => *duration,
        }
    }
}

fn between<R: Rng>(rng: &mut R, min: i16, max: i16) -> i16 {
    rng.gen_range(min..=max)
}

fn either<R: Rng>(rng: &mut R, value: i16) -> i16 {
    if rng.gen_bool(0.5) {
        value
    } else {
        -value
    }
}

/// One iteration of the motion loop for `phase`.
pub fn motion_for<R: Rng>(phase: Phase, rng: &mut R) -> Vec<MotionStep> {
    match phase {
        Phase::Idle => idle_sway(rng),
        Phase::Recognizing => vec![
            MotionStep::pose(&[(HEAD_P, between(rng, 30, 80)), (HEAD_R, 0), (BODY_Y, 0)], 500),
            MotionStep::hold(800),
        ],
        Phase::Registering => vec![
            MotionStep::pose(
                &[
                    (HEAD_R, either(rng, 120)),
                    (HEAD_P, 50),
                    (HEAD_Y, between(rng, -80, 80)),
                ],
                700,
            ),
            MotionStep::hold(1200),
        ],
        Phase::Listening => vec![
            MotionStep::pose(
                &[
                    (HEAD_Y, between(rng, -50, 50)),
                    (HEAD_P, 40),
                    (BODY_Y, between(rng, -30, 30)),
                ],
                800,
            ),
            MotionStep::hold(rng.gen_range(1500..2500)),
            MotionStep::pose(&[(HEAD_P, between(rng, 20, 80))], 400),
        ],
        Phase::Thinking => vec![
            MotionStep::pose(
                &[
                    (HEAD_R, either(rng, 200)),
                    (HEAD_P, -50),
                    (R_SHOULDER_P, between(rng, -500, -350)),
                    (R_ELBOW_P, between(rng, -700, -500)),
                ],
                800,
            ),
            MotionStep::hold(500),
        ],
        Phase::Greeting | Phase::Responding => speaking(rng.gen_range(0..SPEAKING_PATTERN_COUNT), rng),
        Phase::Closing => {
            let mut steps = wave_goodbye();
            steps.push(MotionStep::hold(2000));
            steps
        }
    }
}

fn idle_sway<R: Rng>(rng: &mut R) -> Vec<MotionStep> {
    vec![
        MotionStep::pose(
            &[
                (HEAD_Y, between(rng, -80, 80)),
                (HEAD_P, between(rng, -30, 60)),
                (HEAD_R, 0),
            ],
            1200,
        ),
        MotionStep::hold(rng.gen_range(2000..4000)),
    ]
}

/// Speaking gesture variant `pattern` (taken modulo the variant count).
pub fn speaking<R: Rng>(pattern: usize, rng: &mut R) -> Vec<MotionStep> {
    match pattern % SPEAKING_PATTERN_COUNT {
        0 => vec![MotionStep::pose(
            &[
                (HEAD_P, between(rng, -150, 150)),
                (HEAD_Y, between(rng, -200, 200)),
                (L_SHOULDER_P, between(rng, -400, 50)),
                (R_SHOULDER_P, between(rng, -400, 50)),
                (L_ELBOW_P, between(rng, -300, 50)),
                (R_ELBOW_P, between(rng, -300, 50)),
            ],
            rng.gen_range(500..1000),
        )],
        1 => {
            let shoulder = between(rng, -600, -300);
            let elbow = between(rng, -400, -100);
            vec![
                MotionStep::pose(
                    &[
                        (HEAD_P, between(rng, -50, 80)),
                        (HEAD_Y, between(rng, -100, 100)),
                        (L_SHOULDER_P, shoulder),
                        (R_SHOULDER_P, shoulder),
                        (L_ELBOW_P, elbow),
                        (R_ELBOW_P, elbow),
                    ],
                    rng.gen_range(700..1000),
                ),
                MotionStep::hold(200),
                MotionStep::pose(
                    &[
                        (L_SHOULDER_P, between(rng, -200, 0)),
                        (R_SHOULDER_P, between(rng, -200, 0)),
                        (L_ELBOW_P, between(rng, -100, 0)),
                        (R_ELBOW_P, between(rng, -100, 0)),
                    ],
                    500,
                ),
            ]
        }
        2 => vec![MotionStep::pose(
            &[
                (HEAD_Y, between(rng, -200, -50)),
                (HEAD_P, between(rng, -50, 100)),
                (BODY_Y, between(rng, -200, -50)),
                (L_SHOULDER_P, between(rng, -700, -400)),
                (L_ELBOW_P, between(rng, -500, -200)),
                (R_SHOULDER_P, between(rng, -100, 50)),
            ],
            rng.gen_range(600..1000),
        )],
        3 => vec![MotionStep::pose(
            &[
                (HEAD_Y, between(rng, 50, 200)),
                (HEAD_P, between(rng, -50, 100)),
                (BODY_Y, between(rng, 50, 200)),
                (R_SHOULDER_P, between(rng, -700, -400)),
                (R_ELBOW_P, between(rng, -500, -200)),
                (L_SHOULDER_P, between(rng, -100, 50)),
            ],
            rng.gen_range(600..1000),
        )],
        _ => {
            let body = if rng.gen_bool(0.5) {
                between(rng, 200, 450)
            } else {
                between(rng, -450, -200)
            };
            vec![MotionStep::pose(
                &[
                    (BODY_Y, body),
                    (HEAD_Y, -body / 3),
                    (L_SHOULDER_P, between(rng, -400, -100)),
                    (R_SHOULDER_P, between(rng, -400, -100)),
                    (L_ELBOW_P, between(rng, -300, -50)),
                    (R_ELBOW_P, between(rng, -300, -50)),
                ],
                rng.gen_range(700..1100),
            )]
        }
    }
}

pub fn wave_goodbye() -> Vec<MotionStep> {
    let mut steps = vec![
        MotionStep::pose(&[(HEAD_P, 50), (R_SHOULDER_P, -900), (R_ELBOW_P, -400)], 600),
        MotionStep::hold(300),
    ];
    for _ in 0..3 {
        steps.push(MotionStep::pose(&[(R_ELBOW_P, -200)], 250));
        steps.push(MotionStep::hold(250));
        steps.push(MotionStep::pose(&[(R_ELBOW_P, -500)], 250));
        steps.push(MotionStep::hold(250));
    }
    steps.push(MotionStep::Pose {
        targets: neutral_pose(),
        duration: Duration::from_millis(600),
    });
    steps
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorStep {
    pub color: Rgb,
    pub brightness: u8,
    pub hold: Duration,
}

const BREATH_MIN: u8 = 100;
const BREATH_MAX: u8 = 220;
const BREATH_STEP: u8 = 12;

/// Indicator pattern state carried across loop iterations.
#[derive(Debug, Clone)]
pub struct IndicatorPattern {
    breath: u8,
    rising: bool,
    pulse: u64,
}

impl Default for IndicatorPattern {
    fn default() -> Self {
        Self {
            breath: BREATH_MIN,
            rising: true,
            pulse: 0,
        }
    }
}

impl IndicatorPattern {
    pub fn next(&mut self, phase: Phase) -> IndicatorStep {
        let step = |color, brightness, hold_ms| IndicatorStep {
            color,
            brightness,
            hold: Duration::from_millis(hold_ms),
        };
        match phase {
            Phase::Idle => {
                self.advance_breath();
                step(Rgb::WHITE, self.breath, 120)
            }
            Phase::Recognizing => step(Rgb::ORANGE, 220, 150),
            Phase::Registering => step(Rgb::GOLDENROD, 200, 150),
            Phase::Greeting | Phase::Responding => step(Rgb::GREEN, 255, 120),
            Phase::Listening => {
                let even = self.pulse % 2 == 0;
                self.pulse = self.pulse.wrapping_add(1);
                if even {
                    step(Rgb::CYAN, 220, 300)
                } else {
                    step(Rgb::OCEAN, 180, 300)
                }
            }
            Phase::Thinking => step(Rgb::YELLOW, 200, 200),
            Phase::Closing => step(Rgb::WHITE, 150, 200),
        }
    }

    fn advance_breath(&mut self) {
        if self.rising {
            self.breath = self.breath.saturating_add(BREATH_STEP);
            if self.breath >= BREATH_MAX {
                self.breath = BREATH_MAX;
                self.rising = false;
            }
        } else {
            self.breath = self.breath.saturating_sub(BREATH_STEP);
            if self.breath <= BREATH_MIN {
                self.breath = BREATH_MIN;
                self.rising = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn poses(steps: &[MotionStep]) -> Vec<&[JointTarget]> {
        steps
            .iter()
            .filter_map(|step| match step {
                MotionStep::Pose { targets, .. } => Some(targets.as_slice()),
                MotionStep::Hold(_) => None,
            })
            .collect()
    }

    #[test]
    fn every_phase_issues_at_least_one_pose() {
        let mut rng = StdRng::seed_from_u64(7);
        for phase in Phase::ALL {
            let steps = motion_for(phase, &mut rng);
            assert!(!poses(&steps).is_empty(), "{phase:?} has no pose");
        }
    }

    #[test]
    fn speaking_variants_stay_in_servo_ranges() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..200 {
            let steps = speaking(round, &mut rng);
            for target in poses(&steps).into_iter().flatten() {
                assert!((-900..=900).contains(&target.position), "{target:?}");
                assert!((1..=8).contains(&target.servo));
            }
        }
    }

    #[test]
    fn registering_tilt_is_plus_or_minus_120() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let steps = motion_for(Phase::Registering, &mut rng);
            let roll = poses(&steps)[0]
                .iter()
                .find(|target| target.servo == HEAD_R)
                .map(|target| target.position);
            assert!(matches!(roll, Some(120) | Some(-120)));
        }
    }

    #[test]
    fn goodbye_waves_three_times_then_returns_to_neutral() {
        let steps = wave_goodbye();
        let all = poses(&steps);
        assert_eq!(all.len(), 1 + 6 + 1);
        assert_eq!(all.last().copied(), Some(neutral_pose().as_slice()));
    }

    #[test]
    fn pose_occupancy_includes_settle_time() {
        let step = MotionStep::pose(&[(HEAD_P, 10)], 400);
        assert_eq!(step.occupancy(), Duration::from_millis(450));
        assert_eq!(MotionStep::hold(300).occupancy(), Duration::from_millis(300));
    }

    #[test]
    fn idle_breathing_ramps_between_bounds() {
        let mut pattern = IndicatorPattern::default();
        let levels: Vec<u8> = (0..30)
            .map(|_| pattern.next(Phase::Idle).brightness)
            .collect();
        assert_eq!(levels[0], 112);
        assert!(levels.iter().all(|level| (BREATH_MIN..=BREATH_MAX).contains(level)));
        assert!(levels.contains(&BREATH_MAX));
        let peak = levels.iter().position(|&level| level == BREATH_MAX).unwrap_or(0);
        assert!(levels[peak + 1] < BREATH_MAX);
    }

    #[test]
    fn listening_alternates_two_blues() {
        let mut pattern = IndicatorPattern::default();
        let first = pattern.next(Phase::Listening);
        let second = pattern.next(Phase::Listening);
        let third = pattern.next(Phase::Listening);
        assert_eq!((first.color, first.brightness), (Rgb::CYAN, 220));
        assert_eq!((second.color, second.brightness), (Rgb::OCEAN, 180));
        assert_eq!(third, first);
        assert_eq!(first.hold, Duration::from_millis(300));
    }

    #[test]
    fn steady_phases_use_fixed_colors() {
        let mut pattern = IndicatorPattern::default();
        assert_eq!(pattern.next(Phase::Recognizing).color, Rgb::ORANGE);
        assert_eq!(pattern.next(Phase::Registering).color, Rgb::GOLDENROD);
        assert_eq!(pattern.next(Phase::Responding).brightness, 255);
        assert_eq!(pattern.next(Phase::Thinking).color, Rgb::YELLOW);
        assert_eq!(pattern.next(Phase::Closing).brightness, 150);
    }
}
