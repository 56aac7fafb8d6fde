use crate::config::GameConfig;
use crate::gameplay::driver::DriveTelemetry;
use crate::gameplay::wreck::PlayerCrashed;
use bevy::app::AppExit;
use bevy::prelude::*;

#[derive(States, Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum GameState {
    #[default]
    Boot,
    InRun,
    Pause,
    Results,
}

pub struct GameStatePlugin;

impl Plugin for GameStatePlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<RunSummary>()
            .add_systems(Startup, setup_camera_and_lighting)
            .add_systems(OnEnter(GameState::Boot), enter_boot)
            .add_systems(Update, boot_to_in_run.run_if(in_state(GameState::Boot)))
            .add_systems(OnEnter(GameState::InRun), enter_in_run)
            .add_systems(
                Update,
                (update_run_summary, apply_crash_events, in_run_controls)
                    .chain()
                    .run_if(in_state(GameState::InRun))
                    .run_if(resource_exists::<GameConfig>),
            )
            .add_systems(OnEnter(GameState::Pause), enter_pause)
            .add_systems(Update, pause_controls.run_if(in_state(GameState::Pause)))
            .add_systems(OnEnter(GameState::Results), enter_results)
            .add_systems(
                Update,
                results_controls.run_if(in_state(GameState::Results)),
            );
    }
}

#[derive(Resource, Debug, Clone, Default)]
pub struct RunSummary {
    pub score: u32,
    pub distance_m: f32,
    pub was_crash: bool,
    pub crash_impact_speed_mps: f32,
}

fn setup_camera_and_lighting(mut commands: Commands) {
    commands.spawn((
        Name::new("ChaseCamera"),
        Camera3d::default(),
        Transform::from_xyz(0.0, 5.5, -9.0).looking_at(Vec3::new(0.0, 1.2, 8.0), Vec3::Y),
    ));

    commands.spawn((
        Name::new("SunLight"),
        DirectionalLight {
            illuminance: 9_000.0,
            shadows_enabled: false,
            ..default()
        },
        Transform::from_xyz(18.0, 40.0, -12.0).looking_at(Vec3::ZERO, Vec3::Y),
    ));

    commands.insert_resource(AmbientLight {
        color: Color::srgb(0.75, 0.80, 0.92),
        brightness: 220.0,
        ..default()
    });
}

fn enter_boot() {
    info!("Entered state: Boot");
}

fn boot_to_in_run(
    config: Option<Res<GameConfig>>,
    mut next_state: ResMut<NextState<GameState>>,
) {
    if config.is_some() {
        next_state.set(GameState::InRun);
    }
}

fn enter_in_run(mut run_summary: ResMut<RunSummary>) {
    *run_summary = RunSummary::default();
    info!("Entered state: InRun");
}

fn update_run_summary(
    config: Res<GameConfig>,
    telemetry: Res<DriveTelemetry>,
    mut run_summary: ResMut<RunSummary>,
) {
    run_summary.distance_m = telemetry.distance_m.max(0.0);
    run_summary.score = score_points_from_distance(
        run_summary.distance_m,
        config.game.scoring.points_per_meter,
    );
}

fn score_points_from_distance(distance_m: f32, points_per_meter: f32) -> u32 {
    if !distance_m.is_finite() || !points_per_meter.is_finite() {
        return 0;
    }
    (distance_m.max(0.0) * points_per_meter.max(0.0)).floor() as u32
}

fn apply_crash_events(
    mut crash_events: MessageReader<PlayerCrashed>,
    mut run_summary: ResMut<RunSummary>,
) {
    for event in crash_events.read() {
        run_summary.was_crash = true;
        run_summary.crash_impact_speed_mps = event.impact_speed_mps;
    }
}

fn in_run_controls(
    keyboard: Res<ButtonInput<KeyCode>>,
    mut next_state: ResMut<NextState<GameState>>,
) {
    if keyboard.just_pressed(KeyCode::Escape) {
        next_state.set(GameState::Pause);
    }

    if keyboard.just_pressed(KeyCode::KeyR) {
        next_state.set(GameState::Results);
    }
}

fn enter_pause() {
    info!("Entered state: Pause");
}

fn pause_controls(
    keyboard: Res<ButtonInput<KeyCode>>,
    mut next_state: ResMut<NextState<GameState>>,
) {
    if keyboard.just_pressed(KeyCode::Escape) {
        next_state.set(GameState::InRun);
    }

    if keyboard.just_pressed(KeyCode::Enter) {
        next_state.set(GameState::Results);
    }
}

fn enter_results(run_summary: Res<RunSummary>) {
    info!(
        "Entered state: Results (score {}, distance {:.1} m, crash: {}).",
        run_summary.score, run_summary.distance_m, run_summary.was_crash
    );
}

fn results_controls(
    keyboard: Res<ButtonInput<KeyCode>>,
    mut next_state: ResMut<NextState<GameState>>,
    mut exit: MessageWriter<AppExit>,
) {
    if keyboard.just_pressed(KeyCode::Space) {
        next_state.set(GameState::Boot);
    }

    if keyboard.just_pressed(KeyCode::KeyQ) {
        exit.write(AppExit::Success);
    }
}
