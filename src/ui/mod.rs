use crate::config::GameConfig;
use crate::gameplay::driver::DriveTelemetry;
use crate::leaderboard::{AccessGate, LeaderboardState};
use crate::states::{GameState, RunSummary};
use bevy::prelude::*;

const HUD_PANEL_Z_INDEX: i32 = 190;
const RESULTS_PANEL_Z_INDEX: i32 = 300;
const HUD_PANEL_BG: Color = Color::srgba(0.06, 0.09, 0.12, 0.86);
const HUD_PANEL_BORDER: Color = Color::srgba(0.58, 0.68, 0.76, 0.92);
const HUD_TEXT_PRIMARY: Color = Color::srgb(0.94, 0.97, 1.0);
const HUD_TEXT_MUTED: Color = Color::srgb(0.76, 0.83, 0.9);

pub struct GameHudPlugin;

impl Plugin for GameHudPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(OnEnter(GameState::InRun), spawn_game_hud)
            .add_systems(OnExit(GameState::InRun), cleanup_game_hud)
            .add_systems(
                Update,
                update_game_hud.run_if(in_state(GameState::InRun)),
            )
            .add_systems(OnEnter(GameState::Results), spawn_results_overlay)
            .add_systems(OnExit(GameState::Results), cleanup_results_overlay)
            .add_systems(
                Update,
                update_results_leaderboard_panel.run_if(in_state(GameState::Results)),
            );
    }
}

#[derive(Component)]
struct GameHudRoot;

#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
enum HudTextKind {
    Score,
    Drive,
    Lane,
}

#[derive(Component)]
struct ResultsOverlayRoot;

#[derive(Component)]
struct ResultsLeaderboardText;

fn spawn_game_hud(mut commands: Commands) {
    commands
        .spawn((
            Name::new("GameHudRoot"),
            GameHudRoot,
            Node {
                position_type: PositionType::Absolute,
                left: Val::Px(12.0),
                top: Val::Px(12.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(4.0),
                padding: UiRect::all(Val::Px(10.0)),
                border: UiRect::all(Val::Px(1.0)),
                ..default()
            },
            BackgroundColor(HUD_PANEL_BG),
            BorderColor::all(HUD_PANEL_BORDER),
            ZIndex(HUD_PANEL_Z_INDEX),
        ))
        .with_children(|parent| {
            parent.spawn((
                Name::new("HudScore"),
                HudTextKind::Score,
                Text::new("Score: 0"),
                TextFont {
                    font_size: 26.0,
                    ..default()
                },
                TextColor(HUD_TEXT_PRIMARY),
            ));
            parent.spawn((
                Name::new("HudDrive"),
                HudTextKind::Drive,
                Text::new("0.0 m  |  0.0 m/s"),
                TextFont {
                    font_size: 18.0,
                    ..default()
                },
                TextColor(HUD_TEXT_MUTED),
            ));
            parent.spawn((
                Name::new("HudLane"),
                HudTextKind::Lane,
                Text::new("Lane 0"),
                TextFont {
                    font_size: 18.0,
                    ..default()
                },
                TextColor(HUD_TEXT_MUTED),
            ));
        });
}

fn cleanup_game_hud(mut commands: Commands, hud_query: Query<Entity, With<GameHudRoot>>) {
    for entity in &hud_query {
        commands.entity(entity).try_despawn();
    }
}

fn update_game_hud(
    run_summary: Res<RunSummary>,
    telemetry: Res<DriveTelemetry>,
    mut text_query: Query<(&HudTextKind, &mut Text)>,
) {
    for (kind, mut text) in &mut text_query {
        match kind {
            HudTextKind::Score => {
                *text = Text::new(format!("Score: {}", run_summary.score));
            }
            HudTextKind::Drive => {
                *text = Text::new(format!(
                    "{:.1} m  |  {:.1} m/s",
                    telemetry.distance_m, telemetry.speed_mps
                ));
            }
            HudTextKind::Lane => {
                *text = Text::new(format!("Lane {}", telemetry.lane));
            }
        }
    }
}

fn spawn_results_overlay(mut commands: Commands, run_summary: Res<RunSummary>) {
    let title = if run_summary.was_crash {
        "GAME OVER"
    } else {
        "RESULTS"
    };
    let crash_line = if run_summary.was_crash {
        format!(
            "Crashed at {:.1} m/s closing speed",
            run_summary.crash_impact_speed_mps
        )
    } else {
        "Run ended".to_string()
    };
    let summary_text = format!(
        "Score: {score}\n\
Distance: {distance:.1} m\n\
{crash_line}\n\n\
Space - New Run\n\
Q - Quit",
        score = run_summary.score,
        distance = run_summary.distance_m,
        crash_line = crash_line,
    );

    commands
        .spawn((
            Name::new("ResultsOverlay"),
            ResultsOverlayRoot,
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                justify_content: JustifyContent::Center,
                align_items: AlignItems::Center,
                ..default()
            },
            BackgroundColor(Color::srgba(0.01, 0.02, 0.03, 0.94)),
            ZIndex(RESULTS_PANEL_Z_INDEX),
        ))
        .with_children(|parent| {
            parent
                .spawn((
                    Node {
                        width: Val::Percent(64.0),
                        max_width: Val::Px(860.0),
                        min_width: Val::Px(420.0),
                        flex_direction: FlexDirection::Column,
                        row_gap: Val::Px(10.0),
                        padding: UiRect::all(Val::Px(16.0)),
                        border: UiRect::all(Val::Px(1.0)),
                        ..default()
                    },
                    BackgroundColor(Color::srgba(0.08, 0.10, 0.13, 0.96)),
                    BorderColor::all(HUD_PANEL_BORDER),
                ))
                .with_children(|panel| {
                    panel.spawn((
                        Text::new(title),
                        TextFont {
                            font_size: 52.0,
                            ..default()
                        },
                        TextColor(HUD_TEXT_PRIMARY),
                    ));
                    panel.spawn((
                        Text::new(summary_text),
                        TextFont {
                            font_size: 22.0,
                            ..default()
                        },
                        TextColor(Color::srgb(0.90, 0.94, 0.98)),
                    ));
                    panel.spawn((
                        ResultsLeaderboardText,
                        Text::new("Leaderboard: checking access..."),
                        TextFont {
                            font_size: 20.0,
                            ..default()
                        },
                        TextColor(HUD_TEXT_MUTED),
                    ));
                });
        });
}

fn cleanup_results_overlay(
    mut commands: Commands,
    overlay_query: Query<Entity, With<ResultsOverlayRoot>>,
) {
    for entity in &overlay_query {
        commands.entity(entity).try_despawn();
    }
}

fn update_results_leaderboard_panel(
    config: Res<GameConfig>,
    leaderboard: Res<LeaderboardState>,
    mut text_query: Query<&mut Text, With<ResultsLeaderboardText>>,
) {
    let Ok(mut text) = text_query.single_mut() else {
        return;
    };

    let line = if config.leaderboard.leaderboard.enabled {
        leaderboard_panel_text(
            leaderboard.access,
            leaderboard.user_id.is_some(),
            leaderboard.score_submitted,
            &leaderboard.status,
        )
    } else {
        "Leaderboard disabled.".to_string()
    };
    *text = Text::new(line);
}

/// The subscription-gated branch of the results screen: leaderboard for
/// subscribers, a subscribe prompt for everyone else.
fn leaderboard_panel_text(
    access: AccessGate,
    signed_in: bool,
    score_submitted: bool,
    status: &str,
) -> String {
    match access {
        AccessGate::Unknown => format!("Leaderboard: {status}"),
        AccessGate::Granted => {
            if score_submitted {
                "Leaderboard unlocked - score submitted.".to_string()
            } else {
                format!("Leaderboard unlocked ({status})")
            }
        }
        AccessGate::Denied => {
            if signed_in {
                format!("Subscribe to see the leaderboard - press B. ({status})")
            } else {
                format!("Leaderboard locked: {status}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granted_access_shows_the_leaderboard_branch() {
        let line = leaderboard_panel_text(AccessGate::Granted, true, true, "score submitted");
        assert!(line.contains("unlocked"));
        assert!(!line.contains("Subscribe"));
    }

    #[test]
    fn denied_access_shows_the_subscribe_prompt() {
        let line = leaderboard_panel_text(AccessGate::Denied, true, false, "not subscribed");
        assert!(line.contains("Subscribe"));
        assert!(line.contains("press B"));
    }

    #[test]
    fn signed_out_denial_reports_the_reason_without_a_prompt() {
        let line = leaderboard_panel_text(AccessGate::Denied, false, false, "sign-in skipped");
        assert!(line.contains("sign-in skipped"));
        assert!(!line.contains("press B"));
    }
}
