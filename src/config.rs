use std::path::{Path, PathBuf};

use color_eyre::eyre::{self, WrapErr};
use nalgebra::Vector3;
use orrery::{
    bodies::BodyId,
    channel::TraceId,
    time::UT,
    trajectory::{TraceConfig, TracePoint},
};
use serde::{Deserialize, Serialize};

/// Session settings, read from the TOML file named on the command line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Body catalog; the built-in solar system when absent.
    pub catalog: Option<PathBuf>,
    /// Calendar start time; the catalog epoch when absent.
    pub epoch: Option<String>,
    pub time_warp: f64,
    /// Wall-clock seconds per tick.
    pub tick_seconds: f64,
    pub ticks: u32,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Worker mailbox size, in batches.
    pub mailbox: usize,
    pub trace: TraceConfig,
    pub craft: Vec<CraftConfig>,
    /// RON dump of the final state.
    pub output: Option<PathBuf>,
    /// Dump in render axes (Y-up) instead of world axes.
    pub render_frame: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: None,
            epoch: None,
            time_warp: 1.0,
            tick_seconds: 1.0 / 60.0,
            ticks: 600,
            log_filter: "info".into(),
            mailbox: 1,
            trace: TraceConfig::default(),
            craft: vec![],
            output: None,
            render_frame: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).wrap_err_with(|| format!("parsing config {}", path.display()))
    }
}

/// A traced entity. Position (km) and velocity (km/s) are relative to
/// `central`, in world axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CraftConfig {
    pub id: TraceId,
    #[serde(default)]
    pub name: Option<String>,
    pub central: BodyId,
    pub position: [f64; 3],
    pub velocity: [f64; 3],
}

impl CraftConfig {
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn point(&self, time: UT) -> TracePoint {
        TracePoint {
            time,
            central_body: self.central,
            position: Vector3::from(self.position),
            velocity: Vector3::from(self.velocity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn craft_and_trace_sections() {
        let config: Config = toml::from_str(
            r#"
            ticks = 10
            render_frame = true

            [trace]
            samples = 32

            [[craft]]
            id = 1
            name = "probe"
            central = 399
            position = [7000.0, 0.0, 0.0]
            velocity = [0.0, 0.0, 7.546]
            "#,
        )
        .unwrap();
        assert_eq!(config.ticks, 10);
        assert!(config.render_frame);
        assert_eq!(config.trace.samples, 32);
        assert_eq!(config.trace.step, TraceConfig::default().step);
        let craft = &config.craft[0];
        assert_eq!(craft.id, TraceId(1));
        assert_eq!(craft.central, BodyId(399));
        assert_eq!(craft.label(), "probe");
        assert_eq!(craft.point(UT::J2000).position.x, 7000.0);
    }
}
