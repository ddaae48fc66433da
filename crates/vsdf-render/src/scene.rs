//! Built-in procedural scenes and their per-frame uniforms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vsdf_core::error::EngineError;
use vsdf_core::types::FrameExtent;

/// Per-frame shader inputs.
///
/// Time is derived from the frame index, never from the wall clock, so an
/// offline run renders the same frames every time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Uniforms {
    pub time_seconds: f32,
    pub frame: u32,
    pub resolution: [f32; 2],
}

impl Uniforms {
    pub fn for_frame(frame_index: u64, fps: u32, extent: FrameExtent) -> Self {
        let fps = fps.max(1);
        Self {
            time_seconds: (frame_index as f64 / f64::from(fps)) as f32,
            frame: frame_index as u32,
            resolution: [extent.width as f32, extent.height as f32],
        }
    }
}

/// Linear RGB in `0.0..=1.0`.
pub type Rgb = [f32; 3];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    Quadrants,
    #[default]
    Orbs,
    Plasma,
}

impl Scene {
    pub const ALL: [Scene; 3] = [Scene::Quadrants, Scene::Orbs, Scene::Plasma];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Quadrants => "quadrants",
            Self::Orbs => "orbs",
            Self::Plasma => "plasma",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Quadrants => "static debug pattern: red, green, black and blue quadrants",
            Self::Orbs => "three orbiting SDF circles joined with a smooth union",
            Self::Plasma => "animated cosine colour gradient",
        }
    }

    /// Colour of the pixel whose top-left corner is `(x, y)`, image rows top-down.
    pub fn shade(self, x: u32, y: u32, u: &Uniforms) -> Rgb {
        let frag = [x as f32 + 0.5, y as f32 + 0.5];
        match self {
            Self::Quadrants => quadrants(frag, u),
            Self::Orbs => orbs(frag, u),
            Self::Plasma => plasma(frag, u),
        }
    }
}

impl fmt::Display for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scene {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scene| scene.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|scene| scene.name()).collect();
                EngineError::Configuration(format!(
                    "unknown scene '{s}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

// ─── Scenes ─────────────────────────────────────────────────────────────────

fn quadrants(frag: [f32; 2], u: &Uniforms) -> Rgb {
    let left = frag[0] < u.resolution[0] * 0.5;
    let top = frag[1] < u.resolution[1] * 0.5;
    match (left, top) {
        (true, true) => [1.0, 0.0, 0.0],
        (false, true) => [0.0, 1.0, 0.0],
        (true, false) => [0.0, 0.0, 0.0],
        (false, false) => [0.0, 0.0, 1.0],
    }
}

fn plasma(frag: [f32; 2], u: &Uniforms) -> Rgb {
    let uv = [frag[0] / u.resolution[0], frag[1] / u.resolution[1]];
    let t = u.time_seconds;
    [
        0.5 + 0.5 * (t + uv[0]).cos(),
        0.5 + 0.5 * (t + uv[1] + 2.0).cos(),
        0.5 + 0.5 * (t + uv[0] + 4.0).cos(),
    ]
}

/// Polynomial smooth minimum with blend radius `k`.
fn smin(a: f32, b: f32, k: f32) -> f32 {
    let h = (0.5 + 0.5 * (b - a) / k).clamp(0.0, 1.0);
    b + (a - b) * h - k * h * (1.0 - h)
}

fn circle(p: [f32; 2], centre: [f32; 2], radius: f32) -> f32 {
    let d = [p[0] - centre[0], p[1] - centre[1]];
    (d[0] * d[0] + d[1] * d[1]).sqrt() - radius
}

fn orbs(frag: [f32; 2], u: &Uniforms) -> Rgb {
    // Centre-origin coordinates, y up, scaled by height.
    let p = [
        (frag[0] - 0.5 * u.resolution[0]) / u.resolution[1],
        (0.5 * u.resolution[1] - frag[1]) / u.resolution[1],
    ];
    let t = u.time_seconds;

    let mut d = f32::MAX;
    for i in 0..3 {
        let phase = t * 0.9 + i as f32 * std::f32::consts::TAU / 3.0;
        let centre = [0.28 * phase.cos(), 0.18 * (phase * 1.3).sin()];
        let orb = circle(p, centre, 0.12 + 0.02 * (t * 2.0 + i as f32).sin());
        d = if d == f32::MAX { orb } else { smin(d, orb, 0.08) };
    }

    let background = [0.05, 0.06 + 0.1 * (p[1] + 0.5), 0.12];
    if d < 0.0 {
        let inner = (-d * 6.0).min(1.0);
        [0.95, 0.45 + 0.4 * inner, 0.2 + 0.3 * inner]
    } else {
        let glow = (-d * 18.0).exp();
        [
            background[0] + 0.9 * glow,
            background[1] + 0.4 * glow,
            background[2] + 0.2 * glow,
        ]
    }
}

/// Convert to 8-bit, clamping out-of-range channels.
pub fn to_unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

#[cfg(test)]
mod tests {
    use super::{Scene, Uniforms, to_unorm8};
    use vsdf_core::types::FrameExtent;

    #[test]
    fn time_follows_the_frame_index() {
        let u = Uniforms::for_frame(45, 30, FrameExtent::new(640, 360));
        assert!((u.time_seconds - 1.5).abs() < 1e-6);
        assert_eq!(u.frame, 45);
        assert_eq!(u.resolution, [640.0, 360.0]);
    }

    #[test]
    fn quadrant_colours() {
        let u = Uniforms::for_frame(0, 30, FrameExtent::new(8, 8));
        assert_eq!(Scene::Quadrants.shade(1, 1, &u), [1.0, 0.0, 0.0]);
        assert_eq!(Scene::Quadrants.shade(6, 1, &u), [0.0, 1.0, 0.0]);
        assert_eq!(Scene::Quadrants.shade(1, 6, &u), [0.0, 0.0, 0.0]);
        assert_eq!(Scene::Quadrants.shade(6, 6, &u), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn orbs_animate_over_time() {
        let extent = FrameExtent::new(64, 36);
        let first = Uniforms::for_frame(0, 30, extent);
        let later = Uniforms::for_frame(20, 30, extent);
        let differs =
            (0..64).any(|x| Scene::Orbs.shade(x, 18, &first) != Scene::Orbs.shade(x, 18, &later));
        assert!(differs);
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("Plasma".parse::<Scene>().expect("known"), Scene::Plasma);
        let err = "teapot".parse::<Scene>().expect_err("unknown");
        assert!(err.to_string().contains("quadrants, orbs, plasma"));
    }

    #[test]
    fn unorm_conversion_clamps() {
        assert_eq!(to_unorm8(-1.0), 0);
        assert_eq!(to_unorm8(0.5), 128);
        assert_eq!(to_unorm8(2.0), 255);
    }
}
