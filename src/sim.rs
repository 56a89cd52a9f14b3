//! In-process stand-in for the robot: a unicycle in a walled arena with a
//! monolith to reach and, for the obstacle variant, pillars to avoid.

use crate::action::ActionTranslator;
use crate::config::EnvConfig;
use crate::episode::EpisodeStateMachine;
use crate::error::{GymError, Result};
use crate::observation::{Observation, ObservationBuilder};
use crate::reward::strategy_for;
use crate::spaces::{Action, ActionSpec, ObservationSpec};
use crate::transport::codec;
use crate::transport::wire::{Pose, RobotCommand, Telemetry};
use crate::transport::{DepthBytes, Frame};
use crate::{render_latest, Env, Info, RenderFrame, RenderMode, StepResult};
use chrono::Utc;
use image::{ImageFormat, Rgb, RgbImage};
use itertools::iproduct;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::f64::consts::{FRAC_PI_3, FRAC_PI_4};
use std::io::Cursor;
use tracing::{debug, info};

/// Half the side of the square arena, in metres.
const ARENA_HALF: f64 = 2.0;
const ROBOT_RADIUS: f64 = 0.15;
const MONOLITH: Circle = Circle {
    x: 1.4,
    y: 1.4,
    r: 0.2,
};
const GOAL_RADIUS: f64 = 0.45;
const START: Pose = Pose {
    x: -1.4,
    y: -1.4,
    yaw: FRAC_PI_4,
};
const FOV: f64 = FRAC_PI_3 * 1.5;
/// Longest distance the simulated depth camera reports.
const DEPTH_RANGE: f32 = 8.0;

const FLOOR: [u8; 3] = [120, 96, 72];
const WALL: [u8; 3] = [180, 180, 180];
const MONOLITH_RGB: [u8; 3] = [20, 20, 24];
const OBSTACLE_RGB: [u8; 3] = [170, 40, 30];

#[derive(Debug, Clone, Copy, PartialEq)]
struct Circle {
    x: f64,
    y: f64,
    r: f64,
}

impl Circle {
    fn distance(&self, x: f64, y: f64) -> f64 {
        ((x - self.x).powi(2) + (y - self.y).powi(2)).sqrt() - self.r
    }

    /// Distance along a unit ray to the circle, if it is hit ahead.
    fn intersect(&self, ox: f64, oy: f64, dx: f64, dy: f64) -> Option<f64> {
        let (cx, cy) = (ox - self.x, oy - self.y);
        let b = cx * dx + cy * dy;
        let c = cx * cx + cy * cy - self.r * self.r;
        let disc = b * b - c;
        if disc < 0. {
            return None;
        }
        let t = -b - disc.sqrt();
        (t > 0.).then_some(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Hit {
    Wall,
    Monolith,
    Obstacle,
}

/// Kinematic world state.
#[derive(Debug, Clone)]
pub struct SimWorld {
    pose: Pose,
    obstacles: Vec<Circle>,
    collided: bool,
}

impl SimWorld {
    pub fn new(with_obstacles: bool, rng: &mut StdRng) -> Self {
        let mut world = Self {
            pose: START,
            obstacles: Vec::new(),
            collided: false,
        };
        if with_obstacles {
            world.obstacles = (0..3)
                .map(|i| Circle {
                    x: -0.6 + 0.6 * i as f64 + rng.gen_range(-0.2..0.2),
                    y: 0.6 - 0.6 * i as f64 + rng.gen_range(-0.2..0.2),
                    r: 0.15,
                })
                .collect();
        }
        world
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn reset(&mut self, rng: &mut StdRng) {
        self.pose = Pose {
            x: START.x + rng.gen_range(-0.05..0.05),
            y: START.y + rng.gen_range(-0.05..0.05),
            yaw: START.yaw + rng.gen_range(-0.1..0.1),
        };
        self.collided = false;
    }

    pub fn apply(&mut self, command: &RobotCommand) {
        let (linear, angular, duration_ms) = match *command {
            RobotCommand::Motion {
                linear,
                angular,
                duration_ms,
                ..
            } => (linear, angular, duration_ms),
            RobotCommand::Velocity {
                angular,
                linear,
                duration_ms,
            } => (linear, angular, duration_ms),
            RobotCommand::Reset | RobotCommand::Probe | RobotCommand::SafePark => return,
        };

        // Integrate in small slices so a fast move cannot tunnel through a pillar.
        let dt = duration_ms as f64 / 1000. / 10.;
        for _ in 0..10 {
            self.pose.yaw = wrap_angle(self.pose.yaw + angular * dt);
            let (x, y) = (
                self.pose.x + linear * dt * self.pose.yaw.cos(),
                self.pose.y + linear * dt * self.pose.yaw.sin(),
            );
            if self.clearance_at(x, y) <= ROBOT_RADIUS {
                self.collided = true;
                return;
            }
            self.pose.x = x;
            self.pose.y = y;
            if self.out_of_bounds() {
                return;
            }
        }
    }

    fn clearance_at(&self, x: f64, y: f64) -> f64 {
        self.obstacles
            .iter()
            .chain(std::iter::once(&MONOLITH))
            .map(|c| c.distance(x, y))
            .fold(f64::INFINITY, f64::min)
    }

    fn out_of_bounds(&self) -> bool {
        self.pose.x.abs() > ARENA_HALF - ROBOT_RADIUS || self.pose.y.abs() > ARENA_HALF - ROBOT_RADIUS
    }

    pub fn telemetry(&self) -> Telemetry {
        let goal_distance = MONOLITH.distance(self.pose.x, self.pose.y).max(0.);
        let obstacle_distance = (!self.obstacles.is_empty()).then(|| {
            self.obstacles
                .iter()
                .map(|c| c.distance(self.pose.x, self.pose.y) - ROBOT_RADIUS)
                .fold(f64::INFINITY, f64::min)
                .max(0.)
        });

        Telemetry {
            pose: self.pose,
            goal_distance,
            obstacle_distance,
            // Touching the monolith is the goal, not a crash.
            collision: self.collided && goal_distance > GOAL_RADIUS,
            out_of_bounds: self.out_of_bounds(),
            goal_reached: goal_distance <= GOAL_RADIUS,
            at_start_pose: (self.pose.x - START.x).abs() < 0.1 && (self.pose.y - START.y).abs() < 0.1,
            reward: None,
        }
    }

    fn cast(&self, angle: f64) -> (f64, Hit) {
        let (ox, oy) = (self.pose.x, self.pose.y);
        let (dx, dy) = (angle.cos(), angle.sin());

        let wall = [
            (dx > 0.).then(|| (ARENA_HALF - ox) / dx),
            (dx < 0.).then(|| (-ARENA_HALF - ox) / dx),
            (dy > 0.).then(|| (ARENA_HALF - oy) / dy),
            (dy < 0.).then(|| (-ARENA_HALF - oy) / dy),
        ]
        .into_iter()
        .flatten()
        .fold(f64::INFINITY, f64::min);

        let mut nearest = (wall, Hit::Wall);
        let circles = self
            .obstacles
            .iter()
            .map(|c| (c, Hit::Obstacle))
            .chain(std::iter::once((&MONOLITH, Hit::Monolith)));
        for (circle, hit) in circles {
            if let Some(t) = circle.intersect(ox, oy, dx, dy) {
                if t < nearest.0 {
                    nearest = (t, hit);
                }
            }
        }
        nearest
    }

    /// Render the camera view at `width` x `height`.
    pub fn render(&self, seq: u64, width: u32, height: u32) -> Result<Frame> {
        let (w, h) = (width as usize, height as usize);
        let horizon = h as f64 / 2.;

        let columns = (0..w)
            .map(|col| {
                let offset = FOV * (0.5 - (col as f64 + 0.5) / w as f64);
                let (t, hit) = self.cast(self.pose.yaw + offset);
                // Perpendicular distance keeps walls straight.
                (t, (t * offset.cos()).max(0.05), hit)
            })
            .collect::<Vec<_>>();

        let mut rgb = RgbImage::new(width, height);
        let mut depth = vec![0f32; w * h];
        for (row, col) in iproduct!(0..h, 0..w) {
            let (t, perp, hit) = columns[col];
            let half_extent = match hit {
                Hit::Wall => horizon * 0.4 / perp,
                Hit::Monolith => horizon * 1.2 / perp,
                Hit::Obstacle => horizon * 0.5 / perp,
            };
            let dy = row as f64 + 0.5 - horizon;
            let (colour, d) = if dy.abs() <= half_extent {
                let colour = match hit {
                    Hit::Wall => WALL,
                    Hit::Monolith => MONOLITH_RGB,
                    Hit::Obstacle => OBSTACLE_RGB,
                };
                (colour, t as f32)
            } else if dy > 0. {
                // Floor distance grows towards the horizon.
                (FLOOR, (horizon * 0.4 / dy) as f32)
            } else {
                (WALL, t as f32)
            };
            rgb.put_pixel(col as u32, row as u32, Rgb(colour));
            depth[row * w + col] = d.min(DEPTH_RANGE);
        }

        let mut encoded = Cursor::new(Vec::new());
        rgb.write_to(&mut encoded, ImageFormat::Png)?;

        Ok(Frame {
            seq,
            timestamp: Utc::now(),
            image: Some(encoded.into_inner()),
            depth: Some(DepthBytes {
                width,
                height,
                data: codec::f32s_to_le_bytes(&depth),
            }),
            telemetry: self.telemetry(),
        })
    }
}

fn wrap_angle(a: f64) -> f64 {
    let two_pi = std::f64::consts::TAU;
    let a = a.rem_euclid(two_pi);
    if a > std::f64::consts::PI {
        a - two_pi
    } else {
        a
    }
}

/// Simulated environment with the same contract as [`crate::RealEnv`].
pub struct SimEnv {
    config: EnvConfig,
    action_spec: ActionSpec,
    obs_spec: ObservationSpec,
    translator: ActionTranslator,
    builder: ObservationBuilder,
    episode: EpisodeStateMachine,
    world: SimWorld,
    rng: StdRng,
    seq: u64,
    last_observation: Option<Observation>,
    closed: bool,
}

impl SimEnv {
    pub fn new(config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let action_spec = ActionSpec::for_kind(config.action_space);
        let obs_spec = ObservationSpec::from_config(&config);
        let world = SimWorld::new(config.variant.has_obstacles(), &mut rng);
        info!(variant = config.variant.id(), "simulated environment has been started");

        Ok(Self {
            translator: ActionTranslator::new(action_spec, config.variant),
            builder: ObservationBuilder::new(obs_spec),
            episode: EpisodeStateMachine::new(
                config.step_budget,
                strategy_for(config.variant, config.reward),
            ),
            action_spec,
            obs_spec,
            world,
            rng,
            seq: 0,
            last_observation: None,
            closed: false,
            config,
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn episode(&self) -> &EpisodeStateMachine {
        &self.episode
    }

    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.seq += 1;
        self.world.render(
            self.seq,
            self.obs_spec.width as u32,
            self.obs_spec.height as u32,
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(GymError::invalid_state("an open environment", "closed"))
        } else {
            Ok(())
        }
    }
}

impl Env for SimEnv {
    fn action_space(&self) -> &ActionSpec {
        &self.action_spec
    }

    fn observation_space(&self) -> &ObservationSpec {
        &self.obs_spec
    }

    fn reset(&mut self) -> Result<Observation> {
        self.ensure_open()?;
        self.world.reset(&mut self.rng);
        let frame = self.next_frame()?;
        let obs = self.builder.reset(&frame)?;
        self.episode.reset(frame.telemetry);
        self.last_observation = Some(obs.clone());
        debug!("simulated reset complete");

        Ok(obs)
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        self.ensure_open()?;
        self.episode.ensure_running()?;
        let translation = self.translator.translate(action)?;

        self.world.apply(&translation.command);
        let frame = self.next_frame()?;
        let observation = self.builder.push(Some(&frame))?;
        let transition = self.episode.advance(Some(frame.telemetry))?;

        let mut info = Info::new();
        info.insert("seq".into(), json!(frame.seq));
        info.insert("frame_stale".into(), json!(observation.stale));
        translation.record(&mut info);
        self.episode.record(&mut info);
        self.last_observation = Some(observation.clone());

        Ok(StepResult {
            observation,
            reward: transition.reward,
            terminated: transition.terminated,
            truncated: transition.truncated,
            info,
        })
    }

    fn render(&self, mode: RenderMode) -> Result<RenderFrame> {
        render_latest(self.last_observation.as_ref(), &self.obs_spec, mode)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.episode.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvVariant;

    fn world() -> SimWorld {
        let mut rng = StdRng::seed_from_u64(1);
        SimWorld::new(false, &mut rng)
    }

    #[test]
    fn starts_at_start_pose_far_from_goal() {
        let t = world().telemetry();
        assert!(t.at_start_pose);
        assert!(!t.goal_reached && !t.collision && !t.out_of_bounds);
        assert!(t.goal_distance > 3.);
        assert!(t.obstacle_distance.is_none());
    }

    #[test]
    fn driving_forward_approaches_the_monolith() {
        let mut w = world();
        let before = w.telemetry().goal_distance;
        w.apply(&RobotCommand::Velocity {
            angular: 0.,
            linear: 0.5,
            duration_ms: 1000,
        });
        let after = w.telemetry().goal_distance;
        assert!((before - after - 0.5).abs() < 1e-6);
        assert!(!w.telemetry().at_start_pose);
    }

    #[test]
    fn reaching_the_monolith_is_the_goal() {
        let mut w = world();
        for _ in 0..20 {
            w.apply(&RobotCommand::Velocity {
                angular: 0.,
                linear: 0.5,
                duration_ms: 1000,
            });
        }
        let t = w.telemetry();
        assert!(t.goal_reached);
        assert!(!t.collision);
    }

    #[test]
    fn driving_backwards_leaves_the_arena() {
        let mut w = world();
        for _ in 0..5 {
            w.apply(&RobotCommand::Velocity {
                angular: 0.,
                linear: -0.5,
                duration_ms: 1000,
            });
        }
        assert!(w.telemetry().out_of_bounds);
    }

    #[test]
    fn render_produces_both_modalities() {
        let frame = world().render(3, 32, 24).unwrap();
        assert_eq!(frame.seq, 3);
        assert!(frame.image.is_some());
        let depth = frame.depth.unwrap();
        assert_eq!((depth.width, depth.height), (32, 24));
        let values = codec::f32s_from_le_bytes(&depth.data).unwrap();
        assert!(values.iter().all(|d| (0.0..=DEPTH_RANGE).contains(d)));
    }

    #[test]
    fn obstacle_variant_reports_clearance() {
        let mut rng = StdRng::seed_from_u64(2);
        let w = SimWorld::new(EnvVariant::MonolithObstacle.has_obstacles(), &mut rng);
        assert!(w.telemetry().obstacle_distance.is_some());
    }
}
