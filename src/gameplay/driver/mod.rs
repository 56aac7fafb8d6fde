use crate::config::{GameConfig, VehicleConfig};
use crate::gameplay::SimStep;
use crate::states::GameState;
use bevy::prelude::*;
use bevy_rapier3d::prelude::*;

const CAMERA_OFFSET_M: Vec3 = Vec3::new(0.0, 5.5, -9.0);
const CAMERA_LOOK_AHEAD_M: Vec3 = Vec3::new(0.0, 1.2, 8.0);
const CAMERA_FOLLOW_RATE: f32 = 10.0;
const ROAD_SUPPORT_HALF_WIDTH_M: f32 = 5_000.0;
const ROAD_SUPPORT_HALF_LENGTH_M: f32 = 50_000.0;
const ROAD_SUPPORT_HALF_THICKNESS_M: f32 = 0.5;

pub struct DriverPlugin;

impl Plugin for DriverPlugin {
    fn build(&self, app: &mut App) {
        app.add_message::<SteerInput>()
            .init_resource::<SteerBindings>()
            .init_resource::<DriveTelemetry>()
            .add_systems(OnEnter(GameState::InRun), spawn_player_scene)
            .add_systems(OnExit(GameState::InRun), cleanup_player_scene)
            .add_systems(
                Update,
                (read_steer_input, apply_lane_motion, camera_follow_player)
                    .chain()
                    .in_set(SimStep::Drive)
                    .run_if(in_state(GameState::InRun))
                    .run_if(resource_exists::<GameConfig>),
            );
    }
}

#[derive(Component)]
pub struct PlayerVehicle;

/// Flips to false exactly once, on crash. Never reset for the rest of the run.
#[derive(Component, Debug, Clone, Copy)]
pub struct DriveControl {
    pub is_controlled: bool,
}

#[derive(Component)]
struct RoadSupport;

#[derive(Message, Debug, Clone, Copy)]
pub struct SteerInput {
    pub direction: SteerDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerDirection {
    Left,
    Right,
}

impl SteerDirection {
    fn lane_delta(self) -> i32 {
        match self {
            Self::Left => -1,
            Self::Right => 1,
        }
    }

    /// Steering left banks the nose left (positive yaw), right banks it right.
    fn tilt_sign(self) -> f32 {
        match self {
            Self::Left => 1.0,
            Self::Right => -1.0,
        }
    }
}

#[derive(Resource, Debug, Clone)]
pub struct SteerBindings {
    left: Vec<KeyCode>,
    right: Vec<KeyCode>,
}

impl Default for SteerBindings {
    fn default() -> Self {
        Self {
            left: vec![KeyCode::ArrowLeft, KeyCode::KeyA],
            right: vec![KeyCode::ArrowRight, KeyCode::KeyD],
        }
    }
}

#[derive(Resource, Debug, Clone, Default)]
pub struct DriveTelemetry {
    pub distance_m: f32,
    pub speed_mps: f32,
    pub lane: i32,
}

/// Discrete lane position plus the cosmetic steering-tilt state.
///
/// The lane index is a free integer lattice: steering never clamps it.
#[derive(Component, Debug, Clone)]
pub struct LaneRig {
    pub target_lane: i32,
    pub lane_change_speed: f32,
    steer_sign: f32,
    pub yaw_degrees: f32,
    last_steer_at_s: f64,
}

impl LaneRig {
    pub fn new() -> Self {
        Self {
            target_lane: 0,
            lane_change_speed: 0.0,
            steer_sign: 0.0,
            yaw_degrees: 0.0,
            last_steer_at_s: f64::NEG_INFINITY,
        }
    }

    fn apply_steer(&mut self, direction: SteerDirection, now_s: f64, vehicle: &VehicleConfig) {
        self.target_lane += direction.lane_delta();

        let window_s = vehicle.rapid_steer_window_seconds as f64;
        if now_s - self.last_steer_at_s <= window_s {
            self.lane_change_speed =
                (self.lane_change_speed + 1.0).min(vehicle.tilt_saturation_steers.max(1.0));
        } else {
            self.lane_change_speed = 1.0;
        }

        self.steer_sign = direction.tilt_sign();
        self.last_steer_at_s = now_s;
    }

    fn tick_tilt(&mut self, dt: f32, now_s: f64, vehicle: &VehicleConfig) {
        let window_s = vehicle.rapid_steer_window_seconds as f64;
        if now_s - self.last_steer_at_s > window_s {
            self.lane_change_speed = move_towards(
                self.lane_change_speed,
                0.0,
                vehicle.steer_decay_per_second * dt,
            );
        }

        let target_yaw = if self.lane_change_speed > 0.0 {
            let saturation = (self.lane_change_speed / vehicle.tilt_saturation_steers.max(1.0))
                .clamp(0.0, 1.0);
            self.steer_sign * vehicle.max_tilt_degrees * saturation
        } else {
            0.0
        };

        self.yaw_degrees = move_towards(
            self.yaw_degrees,
            target_yaw,
            vehicle.tilt_rate_degrees_per_s * dt,
        );
    }

    pub fn target_x(&self, lane_distance_m: f32) -> f32 {
        self.target_lane as f32 * lane_distance_m
    }
}

impl Default for LaneRig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MotionFrame {
    pub x: f32,
    pub z: f32,
    pub yaw_degrees: f32,
}

/// One controller tick: consume buffered steer events, smooth the lateral
/// position toward the target lane, advance forward, settle the tilt.
/// Once control is lost the frame passes through untouched, whatever the
/// input.
pub(crate) fn advance_motion(
    rig: &mut LaneRig,
    control: &DriveControl,
    frame: MotionFrame,
    steers: &[SteerDirection],
    now_s: f64,
    dt: f32,
    vehicle: &VehicleConfig,
    lane_distance_m: f32,
) -> MotionFrame {
    if !control.is_controlled {
        return frame;
    }

    for direction in steers {
        rig.apply_steer(*direction, now_s, vehicle);
    }
    rig.tick_tilt(dt, now_s, vehicle);

    let target_x = rig.target_x(lane_distance_m);
    let blend = (vehicle.lane_snap_rate * dt).clamp(0.0, 1.0);

    MotionFrame {
        x: frame.x.lerp(target_x, blend),
        z: frame.z + vehicle.forward_speed_mps * dt,
        yaw_degrees: rig.yaw_degrees,
    }
}

fn move_towards(current: f32, target: f32, max_delta: f32) -> f32 {
    let delta = target - current;
    if delta.abs() <= max_delta {
        target
    } else {
        current + max_delta.copysign(delta)
    }
}

fn spawn_player_scene(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    config: Res<GameConfig>,
    existing_player: Query<Entity, With<PlayerVehicle>>,
    existing_support: Query<Entity, With<RoadSupport>>,
) {
    if existing_player.is_empty() {
        let Some(vehicle) = config.vehicles_by_id.get(&config.game.app.default_vehicle) else {
            return;
        };

        let size = Vec3::from_array(vehicle.chassis_size_m);
        let half = size * 0.5;
        let chassis_mesh = meshes.add(Cuboid::new(size.x, size.y, size.z));
        let chassis_material = materials.add(StandardMaterial {
            base_color: Color::srgb(vehicle.color[0], vehicle.color[1], vehicle.color[2]),
            perceptual_roughness: 0.55,
            ..default()
        });

        commands.spawn((
            Name::new("PlayerVehicle"),
            PlayerVehicle,
            DriveControl {
                is_controlled: true,
            },
            LaneRig::new(),
            Mesh3d(chassis_mesh),
            MeshMaterial3d(chassis_material),
            Transform::from_xyz(0.0, half.y, 0.0),
            RigidBody::KinematicPositionBased,
            Collider::cuboid(half.x, half.y, half.z),
            ActiveEvents::COLLISION_EVENTS,
            ActiveCollisionTypes::default() | ActiveCollisionTypes::KINEMATIC_KINEMATIC,
            Ccd::enabled(),
        ));
    }

    if existing_support.is_empty() {
        // Invisible slab under the streamed tiles so the post-crash dynamic
        // body has something to land on.
        commands.spawn((
            Name::new("RoadSupport"),
            RoadSupport,
            RigidBody::Fixed,
            Collider::cuboid(
                ROAD_SUPPORT_HALF_WIDTH_M,
                ROAD_SUPPORT_HALF_THICKNESS_M,
                ROAD_SUPPORT_HALF_LENGTH_M,
            ),
            Friction::coefficient(1.1),
            Restitution::coefficient(0.05),
            Transform::from_xyz(0.0, -ROAD_SUPPORT_HALF_THICKNESS_M, 0.0),
        ));
    }
}

fn cleanup_player_scene(
    mut commands: Commands,
    mut telemetry: ResMut<DriveTelemetry>,
    player_query: Query<Entity, With<PlayerVehicle>>,
    support_query: Query<Entity, With<RoadSupport>>,
) {
    for entity in &player_query {
        commands.entity(entity).try_despawn();
    }
    for entity in &support_query {
        commands.entity(entity).try_despawn();
    }
    *telemetry = DriveTelemetry::default();
}

fn read_steer_input(
    keyboard: Res<ButtonInput<KeyCode>>,
    bindings: Res<SteerBindings>,
    player_query: Query<&DriveControl, With<PlayerVehicle>>,
    mut steer_events: MessageWriter<SteerInput>,
) {
    // One message per physical press; nothing is emitted for held keys, and
    // nothing at all once control has been lost.
    let Ok(control) = player_query.single() else {
        return;
    };
    if !control.is_controlled {
        return;
    }

    if bindings.left.iter().any(|key| keyboard.just_pressed(*key)) {
        steer_events.write(SteerInput {
            direction: SteerDirection::Left,
        });
    }
    if bindings.right.iter().any(|key| keyboard.just_pressed(*key)) {
        steer_events.write(SteerInput {
            direction: SteerDirection::Right,
        });
    }
}

fn apply_lane_motion(
    time: Res<Time>,
    config: Res<GameConfig>,
    mut steer_events: MessageReader<SteerInput>,
    mut telemetry: ResMut<DriveTelemetry>,
    mut player_query: Query<(&mut Transform, &mut LaneRig, &DriveControl), With<PlayerVehicle>>,
) {
    let steers: Vec<SteerDirection> = steer_events.read().map(|steer| steer.direction).collect();

    let Ok((mut transform, mut rig, control)) = player_query.single_mut() else {
        return;
    };
    let Some(vehicle) = config.vehicles_by_id.get(&config.game.app.default_vehicle) else {
        return;
    };

    let current = MotionFrame {
        x: transform.translation.x,
        z: transform.translation.z,
        yaw_degrees: rig.yaw_degrees,
    };
    let frame = advance_motion(
        &mut rig,
        control,
        current,
        &steers,
        time.elapsed_secs_f64(),
        time.delta_secs(),
        vehicle,
        config.lane_distance_m(),
    );

    if !control.is_controlled {
        return;
    }

    transform.translation.x = frame.x;
    transform.translation.z = frame.z;
    transform.rotation = Quat::from_rotation_y(frame.yaw_degrees.to_radians());

    telemetry.distance_m = transform.translation.z.max(0.0);
    telemetry.speed_mps = vehicle.forward_speed_mps;
    telemetry.lane = rig.target_lane;
}

fn camera_follow_player(
    time: Res<Time>,
    player_query: Query<&Transform, With<PlayerVehicle>>,
    mut camera_query: Query<&mut Transform, (With<Camera3d>, Without<PlayerVehicle>)>,
) {
    let Ok(player_transform) = player_query.single() else {
        return;
    };
    let Ok(mut camera_transform) = camera_query.single_mut() else {
        return;
    };

    let target = player_transform.translation + CAMERA_OFFSET_M;
    let blend = (CAMERA_FOLLOW_RATE * time.delta_secs()).clamp(0.0, 1.0);
    camera_transform.translation = camera_transform.translation.lerp(target, blend);

    let look_at = player_transform.translation + CAMERA_LOOK_AHEAD_M;
    camera_transform.look_at(look_at, Vec3::Y);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;

    const DT: f32 = 1.0 / 60.0;

    fn test_vehicle() -> VehicleConfig {
        sample_config().vehicles.vehicles[0].clone()
    }

    fn controlled() -> DriveControl {
        DriveControl {
            is_controlled: true,
        }
    }

    #[test]
    fn lane_index_is_unbounded() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();

        // Slow steers, one per second, far outside any clamped lane set.
        let mut now = 0.0_f64;
        for _ in 0..40 {
            rig.apply_steer(SteerDirection::Left, now, &vehicle);
            now += 1.0;
        }
        for _ in 0..15 {
            rig.apply_steer(SteerDirection::Right, now, &vehicle);
            now += 1.0;
        }

        assert_eq!(rig.target_lane, -25);
    }

    #[test]
    fn simultaneous_left_and_right_cancel_out() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();
        let control = controlled();
        let frame = MotionFrame {
            x: 0.0,
            z: 0.0,
            yaw_degrees: 0.0,
        };

        advance_motion(
            &mut rig,
            &control,
            frame,
            &[SteerDirection::Left, SteerDirection::Right],
            0.0,
            DT,
            &vehicle,
            4.0,
        );

        assert_eq!(rig.target_lane, 0);
    }

    #[test]
    fn rapid_left_steers_saturate_tilt_without_overshoot() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();

        rig.apply_steer(SteerDirection::Left, 0.0, &vehicle);
        rig.apply_steer(SteerDirection::Left, 0.1, &vehicle);
        rig.apply_steer(SteerDirection::Left, 0.2, &vehicle);

        assert_eq!(rig.target_lane, -3);
        assert!((rig.lane_change_speed - vehicle.tilt_saturation_steers).abs() < f32::EPSILON);

        // Keep ticking inside the rapid-steer window: the yaw must climb
        // toward +max_tilt_degrees and never pass it.
        let now = 0.2;
        let mut previous_yaw = rig.yaw_degrees;
        for _ in 0..240 {
            rig.tick_tilt(DT, now, &vehicle);
            assert!(rig.yaw_degrees <= vehicle.max_tilt_degrees + 1e-4);
            assert!(rig.yaw_degrees >= previous_yaw - 1e-4);
            previous_yaw = rig.yaw_degrees;
        }
        assert!((rig.yaw_degrees - vehicle.max_tilt_degrees).abs() < 1e-3);
    }

    #[test]
    fn tilt_relaxes_to_zero_after_steering_stops() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();

        rig.apply_steer(SteerDirection::Right, 0.0, &vehicle);
        rig.apply_steer(SteerDirection::Right, 0.1, &vehicle);
        for _ in 0..30 {
            rig.tick_tilt(DT, 0.1, &vehicle);
        }
        assert!(rig.yaw_degrees < 0.0);

        // Well past the rapid-steer window, the counter decays and the yaw
        // settles back to level.
        for _ in 0..600 {
            rig.tick_tilt(DT, 10.0, &vehicle);
        }
        assert!((rig.lane_change_speed).abs() < f32::EPSILON);
        assert!(rig.yaw_degrees.abs() < 1e-3);
    }

    #[test]
    fn lateral_motion_smooths_toward_target_without_snapping() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();
        let control = controlled();
        let lane_distance = 4.0;

        let mut frame = MotionFrame {
            x: 0.0,
            z: 0.0,
            yaw_degrees: 0.0,
        };
        frame = advance_motion(
            &mut rig,
            &control,
            frame,
            &[SteerDirection::Right],
            0.0,
            DT,
            &vehicle,
            lane_distance,
        );

        let target_x = lane_distance;
        let mut previous_gap = (frame.x - target_x).abs();
        assert!(previous_gap > 0.0, "first tick must not hard-snap");

        let mut now = DT as f64;
        for _ in 0..400 {
            frame = advance_motion(
                &mut rig,
                &control,
                frame,
                &[],
                now,
                DT,
                &vehicle,
                lane_distance,
            );
            let gap = (frame.x - target_x).abs();
            assert!(gap <= previous_gap + 1e-5);
            previous_gap = gap;
            now += DT as f64;
        }
        assert!(previous_gap < 1e-2);
    }

    #[test]
    fn forward_motion_accumulates_while_controlled() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();
        let control = controlled();

        let mut frame = MotionFrame {
            x: 0.0,
            z: 0.0,
            yaw_degrees: 0.0,
        };
        for tick in 0..120 {
            frame = advance_motion(
                &mut rig,
                &control,
                frame,
                &[],
                tick as f64 * DT as f64,
                DT,
                &vehicle,
                4.0,
            );
        }

        let expected = vehicle.forward_speed_mps * 120.0 * DT;
        assert!((frame.z - expected).abs() < 1e-3);
    }

    #[test]
    fn crash_is_terminal_for_the_controller() {
        let vehicle = test_vehicle();
        let mut rig = LaneRig::new();
        let mut control = controlled();
        control.is_controlled = false;

        let start = MotionFrame {
            x: 2.5,
            z: 140.0,
            yaw_degrees: 6.0,
        };
        let mut frame = start;
        for tick in 0..120 {
            frame = advance_motion(
                &mut rig,
                &control,
                frame,
                &[SteerDirection::Left, SteerDirection::Left],
                tick as f64 * DT as f64,
                DT,
                &vehicle,
                4.0,
            );
        }

        assert_eq!(frame, start);
        assert_eq!(rig.target_lane, 0, "input after the crash is discarded");
    }

    #[test]
    fn move_towards_clamps_at_the_target() {
        assert_eq!(move_towards(0.0, 10.0, 3.0), 3.0);
        assert_eq!(move_towards(9.5, 10.0, 3.0), 10.0);
        assert_eq!(move_towards(10.0, 0.0, 4.0), 6.0);
        assert_eq!(move_towards(-1.0, -1.0, 0.5), -1.0);
    }
}
