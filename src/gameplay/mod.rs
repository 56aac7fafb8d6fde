pub mod driver;
pub mod streaming;
pub mod traffic;
pub mod wreck;

use bevy::prelude::*;
use driver::DriverPlugin;
use streaming::StreamingPlugin;
use traffic::TrafficPlugin;
use wreck::WreckPlugin;

/// Per-tick simulation order: steering and motion first, then spawning,
/// then world streaming, then collision outcome resolution.
#[derive(SystemSet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimStep {
    Drive,
    Spawn,
    Stream,
    Resolve,
}

pub struct GameplayPlugin;

impl Plugin for GameplayPlugin {
    fn build(&self, app: &mut App) {
        app.configure_sets(
            Update,
            (
                SimStep::Drive,
                SimStep::Spawn,
                SimStep::Stream,
                SimStep::Resolve,
            )
                .chain(),
        )
        .add_plugins(DriverPlugin)
        .add_plugins(TrafficPlugin)
        .add_plugins(StreamingPlugin)
        .add_plugins(WreckPlugin);
    }
}
