use crate::config::{GameConfig, StreamingConfig};
use crate::gameplay::driver::PlayerVehicle;
use crate::gameplay::SimStep;
use crate::states::GameState;
use bevy::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

/// Corridors kept materialized either side of the player's column. The
/// five-wide window (current ± 2) is an invariant of the streamer, not a
/// tunable.
pub const CORRIDOR_HALO: i32 = 2;

const TILE_THICKNESS_M: f32 = 0.2;

pub struct StreamingPlugin;

impl Plugin for StreamingPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<TerrainStream>()
            .init_resource::<StreamingTelemetry>()
            .add_systems(
                OnEnter(GameState::InRun),
                (cache_tile_assets, reset_terrain_stream).chain(),
            )
            .add_systems(OnExit(GameState::InRun), cleanup_terrain)
            .add_systems(
                Update,
                (
                    stream_corridors,
                    retire_passed_tiles,
                    update_streaming_telemetry,
                )
                    .chain()
                    .in_set(SimStep::Stream)
                    .run_if(in_state(GameState::InRun))
                    .run_if(resource_exists::<GameConfig>),
            );
    }
}

#[derive(Component)]
struct RoadTile;

#[derive(Resource, Default)]
struct TileAssets {
    mesh: Handle<Mesh>,
    materials: Vec<Handle<StandardMaterial>>,
}

#[derive(Debug)]
struct TileSlot {
    entity: Entity,
    z: f32,
}

#[derive(Debug, Default)]
struct CorridorColumn {
    tiles: VecDeque<TileSlot>,
    watermark_z: f32,
}

#[derive(Resource)]
struct TerrainStream {
    current_corridor: i32,
    corridors: HashMap<i32, CorridorColumn>,
    pool: Vec<Entity>,
    rng: Pcg32,
}

impl Default for TerrainStream {
    fn default() -> Self {
        Self {
            current_corridor: 0,
            corridors: HashMap::new(),
            pool: Vec::new(),
            rng: Pcg32::seed_from_u64(unix_timestamp_seconds()),
        }
    }
}

#[derive(Resource, Debug, Clone, Default)]
pub struct StreamingTelemetry {
    pub current_corridor: i32,
    pub active_corridors: Vec<i32>,
    pub active_tiles: usize,
    pub pooled_tiles: usize,
}

pub(crate) fn corridor_index_for_x(x: f32, corridor_width_m: f32) -> i32 {
    ((x + corridor_width_m * 0.5) / corridor_width_m).floor() as i32
}

pub(crate) fn corridor_window(center: i32) -> [i32; 5] {
    std::array::from_fn(|offset| center - CORRIDOR_HALO + offset as i32)
}

/// Window maintenance as a pure function of the new center and the set of
/// currently active indices.
pub(crate) fn corridor_window_delta(new_center: i32, active: &[i32]) -> (Vec<i32>, Vec<i32>) {
    let window = corridor_window(new_center);
    let to_add = window
        .iter()
        .copied()
        .filter(|index| !active.contains(index))
        .collect();
    let to_remove = active
        .iter()
        .copied()
        .filter(|index| (index - new_center).abs() > CORRIDOR_HALO)
        .collect();
    (to_add, to_remove)
}

pub(crate) fn forward_view_limit(player_z: f32, streaming: &StreamingConfig) -> f32 {
    player_z + streaming.segment_length_m * streaming.segments_on_screen as f32
}

pub(crate) fn trailing_cutoff(player_z: f32, streaming: &StreamingConfig) -> f32 {
    player_z - streaming.segment_length_m * streaming.retire_behind_segments
}

fn cache_tile_assets(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    config: Res<GameConfig>,
) {
    let streaming = &config.world.streaming;
    let mesh = meshes.add(Cuboid::new(
        config.corridor_width_m(),
        TILE_THICKNESS_M,
        streaming.segment_length_m,
    ));
    let tile_materials = config
        .world
        .tiles
        .iter()
        .map(|tile| {
            materials.add(StandardMaterial {
                base_color: Color::srgb(tile.color[0], tile.color[1], tile.color[2]),
                perceptual_roughness: 0.95,
                ..default()
            })
        })
        .collect();

    commands.insert_resource(TileAssets {
        mesh,
        materials: tile_materials,
    });
}

fn reset_terrain_stream(mut stream: ResMut<TerrainStream>) {
    stream.current_corridor = 0;
    stream.corridors.clear();
    stream.pool.clear();
    stream.rng = Pcg32::seed_from_u64(unix_timestamp_seconds());

    // The run starts at the origin; the first stream tick forward-fills the
    // initial window from each column's watermark.
    for index in corridor_window(0) {
        stream.corridors.insert(
            index,
            CorridorColumn {
                tiles: VecDeque::new(),
                watermark_z: 0.0,
            },
        );
    }
}

#[allow(clippy::type_complexity)]
fn stream_corridors(
    mut commands: Commands,
    config: Res<GameConfig>,
    tile_assets: Res<TileAssets>,
    mut stream: ResMut<TerrainStream>,
    mut tile_query: Query<
        (
            &mut Transform,
            &mut Visibility,
            &mut MeshMaterial3d<StandardMaterial>,
        ),
        With<RoadTile>,
    >,
    player_query: Query<&Transform, (With<PlayerVehicle>, Without<RoadTile>)>,
) {
    let Ok(player_transform) = player_query.single() else {
        return;
    };
    if tile_assets.materials.is_empty() {
        return;
    }

    let streaming = config.world.streaming.clone();
    let corridor_width = config.corridor_width_m();
    let player_z = player_transform.translation.z;

    let TerrainStream {
        current_corridor,
        corridors,
        pool,
        rng,
    } = &mut *stream;

    let new_index = corridor_index_for_x(player_transform.translation.x, corridor_width);
    if new_index != *current_corridor {
        let active: Vec<i32> = corridors.keys().copied().collect();
        let (to_add, to_remove) = corridor_window_delta(new_index, &active);

        for index in to_remove {
            release_corridor(corridors, pool, &mut tile_query, index);
        }
        for index in to_add {
            corridors.insert(
                index,
                CorridorColumn {
                    tiles: VecDeque::new(),
                    watermark_z: player_z,
                },
            );
        }
        *current_corridor = new_index;
    }

    // Forward fill: every active column keeps enough tiles ahead of the
    // player to cover the visible window, whatever the forward speed did
    // this tick.
    let view_limit = forward_view_limit(player_z, &streaming);
    let indices: Vec<i32> = corridors.keys().copied().collect();
    for index in indices {
        let center_x = index as f32 * corridor_width;
        loop {
            let Some(column) = corridors.get_mut(&index) else {
                debug_assert!(false, "active corridor {index} vanished mid-fill");
                break;
            };
            if column.watermark_z >= view_limit {
                break;
            }

            let z = column.watermark_z;
            let position = Vec3::new(
                center_x,
                -TILE_THICKNESS_M * 0.5,
                z + streaming.segment_length_m * 0.5,
            );
            let entity = place_or_recycle_tile(
                &mut commands,
                &tile_assets,
                pool,
                rng,
                &mut tile_query,
                position,
            );
            column.tiles.push_back(TileSlot { entity, z });
            column.watermark_z = z + streaming.segment_length_m;
        }
    }
}

/// Pops a pooled tile and fully reinitializes it (position, fresh random
/// variant, visibility) before it re-enters a corridor; spawns a new entity
/// when the pool is dry.
#[allow(clippy::type_complexity)]
fn place_or_recycle_tile(
    commands: &mut Commands,
    tile_assets: &TileAssets,
    pool: &mut Vec<Entity>,
    rng: &mut Pcg32,
    tile_query: &mut Query<
        (
            &mut Transform,
            &mut Visibility,
            &mut MeshMaterial3d<StandardMaterial>,
        ),
        With<RoadTile>,
    >,
    position: Vec3,
) -> Entity {
    let variant = rng.random_range(0..tile_assets.materials.len());
    let material = tile_assets.materials[variant].clone();

    if let Some(entity) = pool.pop() {
        if let Ok((mut transform, mut visibility, mut tile_material)) = tile_query.get_mut(entity) {
            transform.translation = position;
            *visibility = Visibility::Inherited;
            tile_material.0 = material;
            return entity;
        }
        debug_assert!(false, "pooled tile {entity:?} lost its components");
    }

    commands
        .spawn((
            Name::new("RoadTile"),
            RoadTile,
            Mesh3d(tile_assets.mesh.clone()),
            MeshMaterial3d(material),
            Transform::from_translation(position),
        ))
        .id()
}

#[allow(clippy::type_complexity)]
fn release_corridor(
    corridors: &mut HashMap<i32, CorridorColumn>,
    pool: &mut Vec<Entity>,
    tile_query: &mut Query<
        (
            &mut Transform,
            &mut Visibility,
            &mut MeshMaterial3d<StandardMaterial>,
        ),
        With<RoadTile>,
    >,
    index: i32,
) {
    let Some(mut column) = corridors.remove(&index) else {
        debug_assert!(false, "released corridor {index} was not active");
        return;
    };

    for slot in column.tiles.drain(..) {
        if let Ok((_, mut visibility, _)) = tile_query.get_mut(slot.entity) {
            *visibility = Visibility::Hidden;
        } else {
            debug_assert!(false, "corridor tile {:?} lost its components", slot.entity);
        }
        pool.push(slot.entity);
    }
}

fn retire_passed_tiles(
    config: Res<GameConfig>,
    mut stream: ResMut<TerrainStream>,
    mut visibility_query: Query<&mut Visibility, With<RoadTile>>,
    player_query: Query<&Transform, (With<PlayerVehicle>, Without<RoadTile>)>,
) {
    let Ok(player_transform) = player_query.single() else {
        return;
    };
    let cutoff = trailing_cutoff(player_transform.translation.z, &config.world.streaming);

    let TerrainStream {
        corridors, pool, ..
    } = &mut *stream;
    for column in corridors.values_mut() {
        while column.tiles.front().is_some_and(|slot| slot.z < cutoff) {
            if let Some(slot) = column.tiles.pop_front() {
                if let Ok(mut visibility) = visibility_query.get_mut(slot.entity) {
                    *visibility = Visibility::Hidden;
                } else {
                    debug_assert!(false, "retired tile {:?} lost its components", slot.entity);
                }
                pool.push(slot.entity);
            }
        }
    }
}

fn update_streaming_telemetry(
    stream: Res<TerrainStream>,
    mut telemetry: ResMut<StreamingTelemetry>,
) {
    let mut active: Vec<i32> = stream.corridors.keys().copied().collect();
    active.sort_unstable();

    telemetry.current_corridor = stream.current_corridor;
    telemetry.active_tiles = stream
        .corridors
        .values()
        .map(|column| column.tiles.len())
        .sum();
    telemetry.pooled_tiles = stream.pool.len();
    telemetry.active_corridors = active;
}

fn cleanup_terrain(
    mut commands: Commands,
    mut stream: ResMut<TerrainStream>,
    tile_query: Query<Entity, With<RoadTile>>,
) {
    for entity in &tile_query {
        commands.entity(entity).try_despawn();
    }
    stream.corridors.clear();
    stream.pool.clear();
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

    fn test_streaming() -> StreamingConfig {
        sample_config().world.streaming.clone()
    }

    #[test]
    fn corridor_index_maps_lateral_bands() {
        // corridor width 20 => band boundaries at ±10, ±30, ...
        let width = 20.0;

        assert_eq!(corridor_index_for_x(0.0, width), 0);
        assert_eq!(corridor_index_for_x(9.99, width), 0);
        assert_eq!(corridor_index_for_x(10.0, width), 1);
        assert_eq!(corridor_index_for_x(-10.01, width), -1);
        assert_eq!(corridor_index_for_x(-30.01, width), -2);
        assert_eq!(corridor_index_for_x(47.0, width), 2);
    }

    #[test]
    fn window_delta_materializes_and_culls_edges() {
        let (to_add, to_remove) = corridor_window_delta(0, &[]);
        assert_eq!(to_add, vec![-2, -1, 0, 1, 2]);
        assert!(to_remove.is_empty());

        let (to_add, to_remove) = corridor_window_delta(1, &[-2, -1, 0, 1, 2]);
        assert_eq!(to_add, vec![3]);
        assert_eq!(to_remove, vec![-2]);

        let (to_add, to_remove) = corridor_window_delta(-3, &[-2, -1, 0, 1, 2]);
        assert_eq!(to_add, vec![-5, -4, -3]);
        assert_eq!(to_remove, vec![0, 1, 2]);
    }

    #[test]
    fn window_settles_after_any_walk() {
        let mut rng = Pcg32::seed_from_u64(42);
        let mut center = 0_i32;
        let mut active: Vec<i32> = corridor_window(center).to_vec();

        for _ in 0..300 {
            center += rng.random_range(-4_i32..=4);
            let (to_add, to_remove) = corridor_window_delta(center, &active);
            active.retain(|index| !to_remove.contains(index));
            active.extend(to_add);
            active.sort_unstable();

            let mut expected = corridor_window(center).to_vec();
            expected.sort_unstable();
            assert_eq!(active, expected, "window drifted at center {center}");
        }
    }

    #[test]
    fn forward_fill_produces_contiguous_ascending_tiles() {
        let streaming = test_streaming();
        let mut watermark = 0.0_f32;
        let mut placed = Vec::new();

        // The same fill loop the streamer runs, across an advancing player.
        let mut player_z = 0.0_f32;
        for _ in 0..200 {
            let view_limit = forward_view_limit(player_z, &streaming);
            while watermark < view_limit {
                placed.push(watermark);
                watermark += streaming.segment_length_m;
            }
            player_z += 7.3;
        }

        for pair in placed.windows(2) {
            assert!(
                (pair[1] - pair[0] - streaming.segment_length_m).abs() < 1e-3,
                "tile spacing drifted: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn initial_fill_covers_exactly_the_visible_window() {
        let streaming = test_streaming();
        let view_limit = forward_view_limit(0.0, &streaming);

        let mut watermark = 0.0_f32;
        let mut count = 0;
        while watermark < view_limit {
            count += 1;
            watermark += streaming.segment_length_m;
        }

        assert_eq!(count, streaming.segments_on_screen as usize);
    }

    #[test]
    fn trailing_cutoff_retires_only_stale_tiles() {
        let streaming = test_streaming();
        let player_z = 300.0;
        let cutoff = trailing_cutoff(player_z, &streaming);

        assert!((cutoff - (player_z - 2.0 * streaming.segment_length_m)).abs() < 1e-3);

        let mut tiles: VecDeque<f32> =
            (0..12).map(|i| 150.0 + i as f32 * streaming.segment_length_m).collect();
        let before = tiles.len();
        let mut retired = Vec::new();
        while tiles.front().is_some_and(|z| *z < cutoff) {
            if let Some(z) = tiles.pop_front() {
                retired.push(z);
            }
        }

        assert!(!retired.is_empty());
        assert_eq!(before, retired.len() + tiles.len());
        assert!(retired.iter().all(|z| *z < cutoff));
        assert!(tiles.iter().all(|z| *z >= cutoff));
    }

    #[test]
    fn recycled_tiles_never_keep_position_memory() {
        let streaming = test_streaming();

        // Model of the pool handoff: retired z values go to a pool, reuse
        // assigns the column watermark, which only ever grows.
        let mut watermark = 0.0_f32;
        let mut active: VecDeque<f32> = VecDeque::new();
        let mut pool: Vec<f32> = Vec::new();
        let mut player_z = 0.0_f32;

        for _ in 0..100 {
            let view_limit = forward_view_limit(player_z, &streaming);
            while watermark < view_limit {
                // Reused or fresh, the placement is always the watermark.
                let reused = pool.pop();
                let placed_z = watermark;
                if let Some(old_z) = reused {
                    assert!(
                        placed_z >= old_z,
                        "recycled tile moved backwards: {old_z} -> {placed_z}"
                    );
                }
                active.push_back(placed_z);
                watermark += streaming.segment_length_m;
            }

            let cutoff = trailing_cutoff(player_z, &streaming);
            while active.front().is_some_and(|z| *z < cutoff) {
                if let Some(z) = active.pop_front() {
                    pool.push(z);
                }
            }

            player_z += 11.0;
        }

        assert!(!pool.is_empty() || !active.is_empty());
    }
}
