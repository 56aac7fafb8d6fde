#![allow(dead_code)]

use bevy::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "config";

pub struct ConfigPlugin;

impl Plugin for ConfigPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, load_game_config)
            .add_systems(Update, reload_game_config_hotkey);
    }
}

fn load_game_config(mut commands: Commands) {
    let config = GameConfig::load_from_dir(Path::new(CONFIG_DIR)).unwrap_or_else(|error| {
        panic!("failed to load configuration from `{CONFIG_DIR}`: {error}");
    });

    log_config_summary("Loaded", &config);
    info!("Press F5 to hot-reload config files from `{CONFIG_DIR}`.");

    commands.insert_resource(config);
}

fn reload_game_config_hotkey(
    keyboard: Res<ButtonInput<KeyCode>>,
    game_config: Option<ResMut<GameConfig>>,
) {
    if !keyboard.just_pressed(KeyCode::F5) {
        return;
    }

    let Some(mut current_config) = game_config else {
        warn!("Config hot-reload requested, but `GameConfig` resource is not initialized yet.");
        return;
    };

    match GameConfig::load_from_dir(Path::new(CONFIG_DIR)) {
        Ok(new_config) => {
            *current_config = new_config;
            log_config_summary("Hot-reloaded", &current_config);
        }
        Err(error) => {
            error!("Config hot-reload failed; keeping previous config: {error}");
        }
    }
}

fn log_config_summary(prefix: &str, config: &GameConfig) {
    info!(
        "{prefix} config: {} vehicles, {} tile variants, {} car variants.",
        config.vehicles_by_id.len(),
        config.tile_variants_by_id.len(),
        config.car_variants_by_id.len()
    );
}

#[derive(Resource, Debug, Clone)]
pub struct GameConfig {
    pub game: GameFile,
    pub vehicles: VehiclesFile,
    pub world: WorldFile,
    pub traffic: TrafficFile,
    pub leaderboard: LeaderboardFile,
    pub vehicles_by_id: HashMap<String, VehicleConfig>,
    pub tile_variants_by_id: HashMap<String, TileVariantConfig>,
    pub car_variants_by_id: HashMap<String, CarVariantConfig>,
}

impl GameConfig {
    pub fn load_from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        let game: GameFile = read_toml(&config_dir.join("game.toml"))?;
        let vehicles: VehiclesFile = read_toml(&config_dir.join("vehicles.toml"))?;
        let world: WorldFile = read_toml(&config_dir.join("world.toml"))?;
        let traffic: TrafficFile = read_toml(&config_dir.join("traffic.toml"))?;
        let leaderboard: LeaderboardFile = read_toml(&config_dir.join("leaderboard.toml"))?;

        let config = Self {
            vehicles_by_id: to_index("vehicles.toml::vehicles", &vehicles.vehicles)?,
            tile_variants_by_id: to_index("world.toml::tiles", &world.tiles)?,
            car_variants_by_id: to_index("traffic.toml::cars", &traffic.cars)?,
            game,
            vehicles,
            world,
            traffic,
            leaderboard,
        };

        config.validate_references()?;
        Ok(config)
    }

    /// Lane pitch shared by the driver, the spawner and the streamer.
    pub fn lane_distance_m(&self) -> f32 {
        self.world.streaming.lane_distance_m
    }

    /// Lateral width of one streamed tile column.
    pub fn corridor_width_m(&self) -> f32 {
        self.world.streaming.lane_distance_m * self.world.streaming.lanes_per_corridor as f32
    }

    fn validate_references(&self) -> Result<(), ConfigError> {
        if !self
            .vehicles_by_id
            .contains_key(&self.game.app.default_vehicle)
        {
            return Err(ConfigError::Validation(format!(
                "game.toml::app.default_vehicle references unknown vehicle id `{}`",
                self.game.app.default_vehicle
            )));
        }

        if self.game.scoring.points_per_meter < 0.0 {
            return Err(ConfigError::Validation(
                "game.toml::scoring.points_per_meter must be >= 0".to_string(),
            ));
        }
        if self.game.crash.results_delay_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "game.toml::crash.results_delay_seconds must be > 0".to_string(),
            ));
        }

        for (index, vehicle) in self.vehicles.vehicles.iter().enumerate() {
            if vehicle.forward_speed_mps <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].forward_speed_mps must be > 0"
                )));
            }
            if vehicle.lane_snap_rate <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].lane_snap_rate must be > 0"
                )));
            }
            if !(0.0 < vehicle.max_tilt_degrees && vehicle.max_tilt_degrees <= 90.0) {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].max_tilt_degrees must be in (0, 90]"
                )));
            }
            if vehicle.tilt_rate_degrees_per_s <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].tilt_rate_degrees_per_s must be > 0"
                )));
            }
            if vehicle.tilt_saturation_steers < 1.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].tilt_saturation_steers must be >= 1"
                )));
            }
            if vehicle.rapid_steer_window_seconds <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].rapid_steer_window_seconds must be > 0"
                )));
            }
            if vehicle.steer_decay_per_second <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].steer_decay_per_second must be > 0"
                )));
            }
            if vehicle.chassis_size_m.iter().any(|extent| *extent <= 0.0) {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].chassis_size_m extents must all be > 0"
                )));
            }
            if vehicle.crash_impulse_up_ns <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].crash_impulse_up_ns must be > 0"
                )));
            }
            if vehicle.crash_torque_ns < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "vehicles.toml::vehicles[{index}].crash_torque_ns must be >= 0"
                )));
            }
        }

        let streaming = &self.world.streaming;
        if streaming.lane_distance_m <= 0.0 {
            return Err(ConfigError::Validation(
                "world.toml::streaming.lane_distance_m must be > 0".to_string(),
            ));
        }
        if streaming.lanes_per_corridor == 0 {
            return Err(ConfigError::Validation(
                "world.toml::streaming.lanes_per_corridor must be >= 1".to_string(),
            ));
        }
        if streaming.segment_length_m <= 0.0 {
            return Err(ConfigError::Validation(
                "world.toml::streaming.segment_length_m must be > 0".to_string(),
            ));
        }
        if streaming.segments_on_screen == 0 {
            return Err(ConfigError::Validation(
                "world.toml::streaming.segments_on_screen must be >= 1".to_string(),
            ));
        }
        if streaming.retire_behind_segments <= 0.0 {
            return Err(ConfigError::Validation(
                "world.toml::streaming.retire_behind_segments must be > 0".to_string(),
            ));
        }
        if self.world.tiles.is_empty() {
            return Err(ConfigError::Validation(
                "world.toml::tiles must contain at least one tile variant".to_string(),
            ));
        }

        let traffic = &self.traffic.traffic;
        if traffic.spawn_interval_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.spawn_interval_seconds must be > 0".to_string(),
            ));
        }
        if traffic.batch_min == 0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.batch_min must be >= 1".to_string(),
            ));
        }
        if traffic.batch_max < traffic.batch_min {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.batch_max must be >= batch_min".to_string(),
            ));
        }
        if traffic.spawn_ahead_m <= 0.0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.spawn_ahead_m must be > 0".to_string(),
            ));
        }
        if traffic.car_speed_mps <= 0.0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.car_speed_mps must be > 0".to_string(),
            ));
        }
        if traffic.lane_span == 0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.lane_span must be >= 1".to_string(),
            ));
        }
        if traffic.min_car_spacing <= 0.0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.min_car_spacing must be > 0".to_string(),
            ));
        }
        if traffic.car_width_m <= 0.0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.car_width_m must be > 0".to_string(),
            ));
        }
        if traffic.despawn_behind_m <= 0.0 {
            return Err(ConfigError::Validation(
                "traffic.toml::traffic.despawn_behind_m must be > 0".to_string(),
            ));
        }
        if self.traffic.cars.is_empty() {
            return Err(ConfigError::Validation(
                "traffic.toml::cars must contain at least one car variant".to_string(),
            ));
        }
        for (index, car) in self.traffic.cars.iter().enumerate() {
            if car.size_m.iter().any(|extent| *extent <= 0.0) {
                return Err(ConfigError::Validation(format!(
                    "traffic.toml::cars[{index}].size_m extents must all be > 0"
                )));
            }
        }

        let leaderboard = &self.leaderboard.leaderboard;
        if leaderboard.subscription_flag_key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "leaderboard.toml::leaderboard.subscription_flag_key cannot be empty".to_string(),
            ));
        }
        if leaderboard.request_timeout_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "leaderboard.toml::leaderboard.request_timeout_seconds must be > 0".to_string(),
            ));
        }
        if leaderboard.retry_backoff_seconds < 0.0 {
            return Err(ConfigError::Validation(
                "leaderboard.toml::leaderboard.retry_backoff_seconds must be >= 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    Validation(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse `{}`: {source}", path.display())
            }
            Self::Validation(message) => write!(f, "{message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

fn to_index<T>(label: &str, rows: &[T]) -> Result<HashMap<String, T>, ConfigError>
where
    T: HasId + Clone,
{
    let mut map = HashMap::new();

    for row in rows {
        let id = row.id();
        if id.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{label} contains an empty id"
            )));
        }

        if map.insert(id.to_string(), row.clone()).is_some() {
            return Err(ConfigError::Validation(format!(
                "{label} contains duplicate id `{id}`"
            )));
        }
    }

    Ok(map)
}

trait HasId {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameFile {
    pub app: AppConfig,
    pub scoring: ScoringConfig,
    pub crash: CrashConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub default_vehicle: String,
    pub debug_overlay: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    pub points_per_meter: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrashConfig {
    pub results_delay_seconds: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehiclesFile {
    pub vehicles: Vec<VehicleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub id: String,
    pub forward_speed_mps: f32,
    /// Exponential smoothing rate toward the target lane x.
    pub lane_snap_rate: f32,
    pub max_tilt_degrees: f32,
    pub tilt_rate_degrees_per_s: f32,
    /// Rapid steers needed before the tilt reaches its full angle.
    pub tilt_saturation_steers: f32,
    pub rapid_steer_window_seconds: f32,
    pub steer_decay_per_second: f32,
    pub chassis_size_m: [f32; 3],
    pub color: [f32; 3],
    pub crash_impulse_up_ns: f32,
    pub crash_torque_ns: f32,
}

impl HasId for VehicleConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorldFile {
    pub streaming: StreamingConfig,
    pub tiles: Vec<TileVariantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    pub lane_distance_m: f32,
    pub lanes_per_corridor: u32,
    pub segment_length_m: f32,
    pub segments_on_screen: u32,
    pub retire_behind_segments: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TileVariantConfig {
    pub id: String,
    pub color: [f32; 3],
}

impl HasId for TileVariantConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficFile {
    pub traffic: TrafficConfig,
    pub cars: Vec<CarVariantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficConfig {
    pub spawn_interval_seconds: f32,
    pub batch_min: u32,
    pub batch_max: u32,
    pub spawn_ahead_m: f32,
    pub car_speed_mps: f32,
    /// Spawnable lanes either side of the player's current position.
    pub lane_span: u32,
    /// Minimum longitudinal gap between successive spawns, in car widths.
    pub min_car_spacing: f32,
    pub car_width_m: f32,
    pub lane_offset_m: f32,
    pub despawn_behind_m: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarVariantConfig {
    pub id: String,
    pub color: [f32; 3],
    pub size_m: [f32; 3],
}

impl HasId for CarVariantConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardFile {
    pub leaderboard: LeaderboardConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardConfig {
    pub enabled: bool,
    pub subscription_flag_key: String,
    pub request_timeout_seconds: f32,
    pub api_max_retries: u32,
    pub retry_backoff_seconds: f32,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config() -> GameConfig {
        let vehicles = VehiclesFile {
            vehicles: vec![VehicleConfig {
                id: "runabout".to_string(),
                forward_speed_mps: 10.0,
                lane_snap_rate: 10.0,
                max_tilt_degrees: 18.0,
                tilt_rate_degrees_per_s: 120.0,
                tilt_saturation_steers: 3.0,
                rapid_steer_window_seconds: 0.2,
                steer_decay_per_second: 4.0,
                chassis_size_m: [1.8, 1.2, 3.6],
                color: [0.93, 0.34, 0.24],
                crash_impulse_up_ns: 9.0,
                crash_torque_ns: 4.0,
            }],
        };
        let world = WorldFile {
            streaming: StreamingConfig {
                lane_distance_m: 4.0,
                lanes_per_corridor: 5,
                segment_length_m: 30.0,
                segments_on_screen: 6,
                retire_behind_segments: 2.0,
            },
            tiles: vec![
                TileVariantConfig {
                    id: "asphalt".to_string(),
                    color: [0.20, 0.22, 0.25],
                },
                TileVariantConfig {
                    id: "asphalt_worn".to_string(),
                    color: [0.16, 0.18, 0.21],
                },
            ],
        };
        let traffic = TrafficFile {
            traffic: TrafficConfig {
                spawn_interval_seconds: 0.35,
                batch_min: 3,
                batch_max: 5,
                spawn_ahead_m: 100.0,
                car_speed_mps: 15.0,
                lane_span: 20,
                min_car_spacing: 3.0,
                car_width_m: 2.0,
                lane_offset_m: 0.0,
                despawn_behind_m: 12.0,
            },
            cars: vec![CarVariantConfig {
                id: "sedan".to_string(),
                color: [0.54, 0.74, 0.92],
                size_m: [1.8, 1.3, 4.2],
            }],
        };
        let leaderboard = LeaderboardFile {
            leaderboard: LeaderboardConfig {
                enabled: true,
                subscription_flag_key: "isSubscribed".to_string(),
                request_timeout_seconds: 6.0,
                api_max_retries: 1,
                retry_backoff_seconds: 0.5,
            },
        };

        GameConfig {
            vehicles_by_id: to_index("vehicles.toml::vehicles", &vehicles.vehicles).unwrap(),
            tile_variants_by_id: to_index("world.toml::tiles", &world.tiles).unwrap(),
            car_variants_by_id: to_index("traffic.toml::cars", &traffic.cars).unwrap(),
            game: GameFile {
                app: AppConfig {
                    default_vehicle: "runabout".to_string(),
                    debug_overlay: true,
                },
                scoring: ScoringConfig {
                    points_per_meter: 1.0,
                },
                crash: CrashConfig {
                    results_delay_seconds: 2.5,
                },
            },
            vehicles,
            world,
            traffic,
            leaderboard,
        }
    }

    #[test]
    fn sample_config_passes_validation() {
        sample_config()
            .validate_references()
            .expect("sample config should validate");
    }

    #[test]
    fn validation_fails_for_missing_vehicle_reference() {
        let mut config = sample_config();
        config.game.app.default_vehicle = "missing_vehicle".to_string();

        let error = config
            .validate_references()
            .expect_err("validation should fail");
        let message = error.to_string();

        assert!(message.contains("default_vehicle"));
        assert!(message.contains("missing_vehicle"));
    }

    #[test]
    fn validation_fails_for_inverted_batch_bounds() {
        let mut config = sample_config();
        config.traffic.traffic.batch_min = 6;
        config.traffic.traffic.batch_max = 5;

        let error = config
            .validate_references()
            .expect_err("validation should fail");
        assert!(error.to_string().contains("batch_max"));
    }

    #[test]
    fn index_rejects_duplicate_ids() {
        let rows = vec![
            TileVariantConfig {
                id: "asphalt".to_string(),
                color: [0.2, 0.2, 0.2],
            },
            TileVariantConfig {
                id: "asphalt".to_string(),
                color: [0.3, 0.3, 0.3],
            },
        ];

        let error = to_index("world.toml::tiles", &rows).expect_err("duplicate ids should fail");
        assert!(error.to_string().contains("duplicate id"));
    }
}
