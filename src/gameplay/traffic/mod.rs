use crate::config::{GameConfig, TrafficConfig};
use crate::gameplay::driver::PlayerVehicle;
use crate::gameplay::SimStep;
use crate::states::GameState;
use bevy::prelude::*;
use bevy_rapier3d::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::f32::consts::PI;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct TrafficPlugin;

impl Plugin for TrafficPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<TrafficState>()
            .init_resource::<TrafficTelemetry>()
            .add_systems(
                OnEnter(GameState::InRun),
                (cache_car_assets, reset_traffic_state).chain(),
            )
            .add_systems(OnExit(GameState::InRun), cleanup_traffic)
            .add_systems(
                Update,
                (
                    spawn_traffic_batches,
                    advance_oncoming_cars,
                    retire_passed_cars,
                    update_traffic_telemetry,
                )
                    .chain()
                    .in_set(SimStep::Spawn)
                    .run_if(in_state(GameState::InRun))
                    .run_if(resource_exists::<GameConfig>),
            );
    }
}

#[derive(Component)]
pub struct OncomingCar;

#[derive(Resource)]
struct TrafficState {
    spawn_timer: Timer,
    last_spawn_z: f32,
    rng: Pcg32,
}

impl Default for TrafficState {
    fn default() -> Self {
        Self {
            spawn_timer: Timer::from_seconds(0.35, TimerMode::Repeating),
            last_spawn_z: 0.0,
            rng: Pcg32::seed_from_u64(unix_timestamp_seconds()),
        }
    }
}

#[derive(Resource, Debug, Clone, Default)]
pub struct TrafficTelemetry {
    pub active_cars: usize,
    pub last_spawn_z: f32,
}

struct CarVisual {
    mesh: Handle<Mesh>,
    material: Handle<StandardMaterial>,
    half_extents: Vec3,
}

#[derive(Resource, Default)]
struct CarAssets {
    variants: Vec<CarVisual>,
}

/// One planned obstacle: lane-snapped x plus a spawn z pushed past the
/// global spacing watermark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PlannedCar {
    pub x: f32,
    pub z: f32,
    pub variant_index: usize,
}

pub(crate) fn snap_to_lane(x: f32, lane_distance_m: f32, lane_offset_m: f32) -> f32 {
    (x / lane_distance_m).round() * lane_distance_m + lane_offset_m
}

/// Draws one spawn batch. Every car checks its z against the global
/// last-spawned watermark and is pushed forward to keep at least
/// `min_car_spacing * car_width_m` of longitudinal gap; the watermark is
/// global, not per-lane, so streams in different lanes still space out.
pub(crate) fn plan_spawn_batch(
    rng: &mut impl Rng,
    traffic: &TrafficConfig,
    lane_distance_m: f32,
    variant_count: usize,
    player_x: f32,
    player_z: f32,
    last_spawn_z: &mut f32,
) -> Vec<PlannedCar> {
    let count = rng.random_range(traffic.batch_min..=traffic.batch_max) as usize;
    let span_m = traffic.lane_span as f32 * lane_distance_m;
    let left_boundary = player_x - span_m;
    let right_boundary = player_x + span_m;
    let min_gap_m = traffic.min_car_spacing * traffic.car_width_m;

    let mut batch = Vec::with_capacity(count);
    for _ in 0..count {
        let raw_x = rng.random_range(left_boundary..=right_boundary);
        let x = snap_to_lane(raw_x, lane_distance_m, traffic.lane_offset_m);

        let mut z = player_z + traffic.spawn_ahead_m;
        if z - *last_spawn_z < min_gap_m {
            z = *last_spawn_z + min_gap_m;
        }
        *last_spawn_z = z;

        batch.push(PlannedCar {
            x,
            z,
            variant_index: rng.random_range(0..variant_count),
        });
    }

    batch
}

pub(crate) fn is_behind_retirement_line(car_z: f32, player_z: f32, despawn_behind_m: f32) -> bool {
    car_z < player_z - despawn_behind_m
}

fn cache_car_assets(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    config: Res<GameConfig>,
) {
    let variants = config
        .traffic
        .cars
        .iter()
        .map(|car| {
            let size = Vec3::from_array(car.size_m);
            CarVisual {
                mesh: meshes.add(Cuboid::new(size.x, size.y, size.z)),
                material: materials.add(StandardMaterial {
                    base_color: Color::srgb(car.color[0], car.color[1], car.color[2]),
                    perceptual_roughness: 0.6,
                    ..default()
                }),
                half_extents: size * 0.5,
            }
        })
        .collect();

    commands.insert_resource(CarAssets { variants });
}

fn reset_traffic_state(config: Res<GameConfig>, mut state: ResMut<TrafficState>) {
    state.spawn_timer = Timer::from_seconds(
        config.traffic.traffic.spawn_interval_seconds,
        TimerMode::Repeating,
    );
    state.last_spawn_z = 0.0;
    state.rng = Pcg32::seed_from_u64(unix_timestamp_seconds());
}

fn spawn_traffic_batches(
    mut commands: Commands,
    time: Res<Time>,
    config: Res<GameConfig>,
    car_assets: Res<CarAssets>,
    mut state: ResMut<TrafficState>,
    player_query: Query<&Transform, With<PlayerVehicle>>,
) {
    let Ok(player_transform) = player_query.single() else {
        return;
    };

    state.spawn_timer.tick(time.delta());
    if !state.spawn_timer.just_finished() {
        return;
    }

    if car_assets.variants.is_empty() {
        return;
    }

    let TrafficState {
        last_spawn_z, rng, ..
    } = &mut *state;
    let batch = plan_spawn_batch(
        rng,
        &config.traffic.traffic,
        config.lane_distance_m(),
        car_assets.variants.len(),
        player_transform.translation.x,
        player_transform.translation.z,
        last_spawn_z,
    );

    for planned in batch {
        let Some(visual) = car_assets.variants.get(planned.variant_index) else {
            debug_assert!(false, "planned car references a missing variant");
            continue;
        };

        commands.spawn((
            Name::new("OncomingCar"),
            OncomingCar,
            Mesh3d(visual.mesh.clone()),
            MeshMaterial3d(visual.material.clone()),
            // Oncoming traffic faces the player.
            Transform::from_xyz(planned.x, visual.half_extents.y, planned.z)
                .with_rotation(Quat::from_rotation_y(PI)),
            RigidBody::KinematicPositionBased,
            Collider::cuboid(
                visual.half_extents.x,
                visual.half_extents.y,
                visual.half_extents.z,
            ),
            ActiveCollisionTypes::default() | ActiveCollisionTypes::KINEMATIC_KINEMATIC,
        ));
    }
}

fn advance_oncoming_cars(
    time: Res<Time>,
    config: Res<GameConfig>,
    mut car_query: Query<&mut Transform, With<OncomingCar>>,
) {
    let step_m = config.traffic.traffic.car_speed_mps * time.delta_secs();
    for mut transform in &mut car_query {
        transform.translation.z -= step_m;
    }
}

fn retire_passed_cars(
    mut commands: Commands,
    config: Res<GameConfig>,
    player_query: Query<&Transform, With<PlayerVehicle>>,
    car_query: Query<(Entity, &Transform), With<OncomingCar>>,
) {
    let Ok(player_transform) = player_query.single() else {
        return;
    };
    let despawn_behind_m = config.traffic.traffic.despawn_behind_m;

    for (entity, transform) in &car_query {
        if is_behind_retirement_line(
            transform.translation.z,
            player_transform.translation.z,
            despawn_behind_m,
        ) {
            commands.entity(entity).despawn();
        }
    }
}

fn update_traffic_telemetry(
    state: Res<TrafficState>,
    mut telemetry: ResMut<TrafficTelemetry>,
    car_query: Query<(), With<OncomingCar>>,
) {
    telemetry.active_cars = car_query.iter().count();
    telemetry.last_spawn_z = state.last_spawn_z;
}

fn cleanup_traffic(mut commands: Commands, car_query: Query<Entity, With<OncomingCar>>) {
    for entity in &car_query {
        commands.entity(entity).try_despawn();
    }
}

fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;

    fn test_traffic() -> TrafficConfig {
        sample_config().traffic.traffic.clone()
    }

    #[test]
    fn batch_sizes_stay_within_configured_bounds() {
        let traffic = test_traffic();
        let mut rng = Pcg32::seed_from_u64(7);
        let mut last_z = 0.0;

        for _ in 0..50 {
            let batch = plan_spawn_batch(&mut rng, &traffic, 4.0, 4, 0.0, 0.0, &mut last_z);
            assert!(batch.len() >= traffic.batch_min as usize);
            assert!(batch.len() <= traffic.batch_max as usize);
        }
    }

    #[test]
    fn successive_spawns_respect_minimum_spacing() {
        let traffic = test_traffic();
        let mut rng = Pcg32::seed_from_u64(99);
        let min_gap = traffic.min_car_spacing * traffic.car_width_m;
        let mut last_z = 0.0;
        let mut player_z = 0.0;
        let mut spawned_z = Vec::new();

        for _ in 0..20 {
            let batch = plan_spawn_batch(&mut rng, &traffic, 4.0, 4, 3.0, player_z, &mut last_z);
            spawned_z.extend(batch.iter().map(|car| car.z));
            // Player advances a little between batches, far less than the
            // spawn horizon moves.
            player_z += 3.5;
        }

        for pair in spawned_z.windows(2) {
            assert!(
                pair[1] - pair[0] >= min_gap - 1e-4,
                "spawn gap {} fell below the minimum {}",
                pair[1] - pair[0],
                min_gap
            );
        }
    }

    #[test]
    fn spawned_cars_are_snapped_to_the_lane_lattice() {
        let traffic = test_traffic();
        let lane_distance = 4.0;
        let mut rng = Pcg32::seed_from_u64(1234);
        let mut last_z = 0.0;
        let player_x = 17.3;
        let span = traffic.lane_span as f32 * lane_distance;

        let batch = plan_spawn_batch(
            &mut rng,
            &traffic,
            lane_distance,
            4,
            player_x,
            250.0,
            &mut last_z,
        );

        for car in &batch {
            let lanes = (car.x - traffic.lane_offset_m) / lane_distance;
            assert!(
                (lanes - lanes.round()).abs() < 1e-3,
                "car x {} is off the lane lattice",
                car.x
            );
            assert!(car.x >= player_x - span - lane_distance * 0.5);
            assert!(car.x <= player_x + span + lane_distance * 0.5);
        }
    }

    #[test]
    fn spawn_z_is_pushed_ahead_of_the_watermark() {
        let traffic = test_traffic();
        let mut rng = Pcg32::seed_from_u64(5);
        // Watermark far ahead of the nominal spawn distance.
        let mut last_z = 500.0;

        let batch = plan_spawn_batch(&mut rng, &traffic, 4.0, 4, 0.0, 0.0, &mut last_z);

        let min_gap = traffic.min_car_spacing * traffic.car_width_m;
        assert!((batch[0].z - (500.0 + min_gap)).abs() < 1e-4);
        assert!(last_z >= 500.0 + batch.len() as f32 * min_gap - 1e-3);
    }

    #[test]
    fn retirement_line_only_triggers_behind_the_margin() {
        let traffic = test_traffic();

        assert!(!is_behind_retirement_line(
            100.0,
            0.0,
            traffic.despawn_behind_m
        ));
        assert!(!is_behind_retirement_line(
            -traffic.despawn_behind_m,
            0.0,
            traffic.despawn_behind_m
        ));
        assert!(is_behind_retirement_line(
            -traffic.despawn_behind_m - 0.1,
            0.0,
            traffic.despawn_behind_m
        ));
    }

    #[test]
    fn obstacle_crosses_the_retirement_line_exactly_once() {
        let traffic = test_traffic();
        let mut car_z = 100.0;
        let player_z = 0.0;
        let dt = 1.0 / 60.0;

        let mut retirements = 0;
        let mut retired = false;
        for _ in 0..600 {
            if retired {
                break;
            }
            car_z -= traffic.car_speed_mps * dt;
            if is_behind_retirement_line(car_z, player_z, traffic.despawn_behind_m) {
                retirements += 1;
                retired = true;
            }
        }

        assert_eq!(retirements, 1);
        assert!(car_z < player_z - traffic.despawn_behind_m);
    }
}
