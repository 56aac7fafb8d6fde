use crate::config::{GameConfig, VehicleConfig};
use crate::gameplay::driver::{DriveControl, PlayerVehicle};
use crate::gameplay::traffic::OncomingCar;
use crate::gameplay::SimStep;
use crate::states::GameState;
use bevy::prelude::*;
use bevy_rapier3d::prelude::*;

pub struct WreckPlugin;

impl Plugin for WreckPlugin {
    fn build(&self, app: &mut App) {
        app.add_message::<PlayerCrashed>()
            .init_resource::<CrashSequence>()
            .add_systems(OnEnter(GameState::InRun), reset_crash_sequence)
            .add_systems(
                Update,
                (detect_crash, run_crash_sequence)
                    .chain()
                    .in_set(SimStep::Resolve)
                    .run_if(in_state(GameState::InRun))
                    .run_if(resource_exists::<GameConfig>),
            );
    }
}

#[derive(Message, Debug, Clone, Copy)]
pub struct PlayerCrashed {
    pub impact_speed_mps: f32,
}

#[derive(Resource, Debug, Default)]
struct CrashSequence {
    results_delay: Option<Timer>,
}

fn reset_crash_sequence(mut sequence: ResMut<CrashSequence>) {
    sequence.results_delay = None;
}

/// Driving -> Crashing is the only transition here and it is one-way: the
/// overlap itself comes from the physics layer, this system only reacts.
fn detect_crash(
    mut commands: Commands,
    config: Res<GameConfig>,
    mut collision_events: MessageReader<CollisionEvent>,
    mut crashed_events: MessageWriter<PlayerCrashed>,
    mut sequence: ResMut<CrashSequence>,
    mut player_query: Query<(Entity, &mut DriveControl), With<PlayerVehicle>>,
    car_query: Query<(), With<OncomingCar>>,
) {
    let Ok((player_entity, mut control)) = player_query.single_mut() else {
        for _ in collision_events.read() {}
        return;
    };

    for event in collision_events.read() {
        let CollisionEvent::Started(first, second, _) = event else {
            continue;
        };
        let other = if *first == player_entity {
            *second
        } else if *second == player_entity {
            *first
        } else {
            continue;
        };
        if !car_query.contains(other) {
            continue;
        }
        if !control.is_controlled {
            continue;
        }

        control.is_controlled = false;

        let Some(vehicle) = config.vehicles_by_id.get(&config.game.app.default_vehicle) else {
            continue;
        };
        let impact_speed_mps = closing_speed_mps(vehicle, &config);

        commands
            .entity(player_entity)
            .insert(crash_body_bundle(vehicle));
        crashed_events.write(PlayerCrashed { impact_speed_mps });
        sequence.results_delay = Some(Timer::from_seconds(
            config.game.crash.results_delay_seconds,
            TimerMode::Once,
        ));

        info!("Crash at {impact_speed_mps:.1} m/s closing speed; control disabled.");
    }
}

/// The kinematic controller hands the body to the physics solver: dynamic
/// rigid body, gravity back on, an upward kick plus tumble torque.
fn crash_body_bundle(vehicle: &VehicleConfig) -> impl Bundle {
    (
        RigidBody::Dynamic,
        GravityScale(1.0),
        Velocity::zero(),
        ExternalImpulse {
            impulse: Vec3::new(
                0.0,
                vehicle.crash_impulse_up_ns,
                -vehicle.crash_impulse_up_ns * 0.25,
            ),
            torque_impulse: Vec3::new(
                vehicle.crash_torque_ns,
                vehicle.crash_torque_ns * 0.2,
                vehicle.crash_torque_ns * 0.5,
            ),
        },
        Damping {
            linear_damping: 0.2,
            angular_damping: 0.4,
        },
        Friction::coefficient(0.9),
        Restitution::coefficient(0.15),
        Sleeping::disabled(),
    )
}

pub(crate) fn closing_speed_mps(vehicle: &VehicleConfig, config: &GameConfig) -> f32 {
    vehicle.forward_speed_mps + config.traffic.traffic.car_speed_mps
}

fn run_crash_sequence(
    time: Res<Time>,
    mut sequence: ResMut<CrashSequence>,
    mut next_state: ResMut<NextState<GameState>>,
) {
    let Some(timer) = sequence.results_delay.as_mut() else {
        return;
    };

    timer.tick(time.delta());
    if timer.just_finished() {
        sequence.results_delay = None;
        next_state.set(GameState::Results);
    }
}
