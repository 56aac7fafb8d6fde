use crate::config::GameConfig;
use crate::gameplay::driver::DriveTelemetry;
use crate::gameplay::streaming::StreamingTelemetry;
use crate::gameplay::traffic::TrafficTelemetry;
use crate::leaderboard::LeaderboardState;
use crate::states::GameState;
use bevy::diagnostic::{DiagnosticsStore, FrameTimeDiagnosticsPlugin};
use bevy::prelude::*;
use bevy_egui::{egui, EguiContexts, EguiPrimaryContextPass};

pub struct DebugOverlayPlugin;

impl Plugin for DebugOverlayPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<DebugOverlayState>()
            .add_systems(Update, toggle_debug_overlay)
            .add_systems(
                EguiPrimaryContextPass,
                streaming_debug_panel
                    .run_if(in_state(GameState::InRun))
                    .run_if(resource_exists::<GameConfig>),
            );
    }
}

#[derive(Resource, Debug, Clone)]
struct DebugOverlayState {
    visible: bool,
}

impl Default for DebugOverlayState {
    fn default() -> Self {
        Self { visible: true }
    }
}

fn toggle_debug_overlay(
    keyboard: Res<ButtonInput<KeyCode>>,
    mut overlay: ResMut<DebugOverlayState>,
) {
    if keyboard.just_pressed(KeyCode::F3) {
        overlay.visible = !overlay.visible;
    }
}

#[allow(clippy::too_many_arguments)]
fn streaming_debug_panel(
    mut egui_contexts: EguiContexts,
    overlay: Res<DebugOverlayState>,
    config: Res<GameConfig>,
    diagnostics: Res<DiagnosticsStore>,
    drive: Res<DriveTelemetry>,
    streaming: Res<StreamingTelemetry>,
    traffic: Res<TrafficTelemetry>,
    leaderboard: Res<LeaderboardState>,
) {
    if !(config.game.app.debug_overlay && overlay.visible) {
        return;
    }
    let Ok(ctx) = egui_contexts.ctx_mut() else {
        return;
    };

    egui::Window::new("World Streaming (F3)").show(ctx, |ui| {
        let fps = diagnostics
            .get(&FrameTimeDiagnosticsPlugin::FPS)
            .and_then(|diagnostic| diagnostic.smoothed())
            .unwrap_or(0.0);
        ui.label(format!("FPS: {fps:.0}"));

        ui.separator();
        ui.label(format!(
            "Player: {:.1} m at {:.1} m/s, lane {}",
            drive.distance_m, drive.speed_mps, drive.lane
        ));

        ui.separator();
        ui.label(format!("Current corridor: {}", streaming.current_corridor));
        ui.label(format!("Active corridors: {:?}", streaming.active_corridors));
        ui.label(format!(
            "Tiles: {} active, {} pooled",
            streaming.active_tiles, streaming.pooled_tiles
        ));

        ui.separator();
        ui.label(format!(
            "Traffic: {} cars, spawn watermark {:.1} m",
            traffic.active_cars, traffic.last_spawn_z
        ));

        ui.separator();
        ui.label(format!("Leaderboard: {}", leaderboard.status));
    });
}
