//! Built-in scene: one diffuse sphere over a sky gradient, lit by a light
//! that circles the sphere over the frame sequence.

use std::f32::consts::TAU;

use model::FramebufferSize;
use tiles::{RenderJob, RenderJobError, Rgba8, Tile, TileRenderer};

const SPHERE_RADIUS: f32 = 0.35;
const AMBIENT: f32 = 0.08;

pub struct SphereScene {
    frame: u32,
    frames: u32,
}

impl SphereScene {
    /// Frame `frame` of an orbit split into `frames` steps.
    pub fn new(frame: u32, frames: u32) -> Self {
        Self {
            frame,
            frames: frames.max(1),
        }
    }
}

impl TileRenderer for SphereScene {
    type Job = SphereJob;

    fn create_render_job(&self, size: FramebufferSize) -> SphereJob {
        let angle = TAU * self.frame as f32 / self.frames as f32;
        let light = normalize([angle.cos(), 0.6, angle.sin().abs() + 0.4]);
        SphereJob {
            light,
            aspect: size.width as f32 / size.height as f32,
        }
    }
}

pub struct SphereJob {
    light: [f32; 3],
    aspect: f32,
}

impl SphereJob {
    /// `u`, `v` in `[0, 1]`, origin top left.
    fn shade(&self, u: f32, v: f32) -> Rgba8 {
        let x = (u - 0.5) * self.aspect.max(1.0);
        let y = (0.5 - v) / self.aspect.min(1.0);
        let radial = x * x + y * y;
        let radius_sq = SPHERE_RADIUS * SPHERE_RADIUS;
        if radial >= radius_sq {
            let sky = 0.35 + 0.5 * v;
            return to_rgba8([sky * 0.55, sky * 0.7, sky]);
        }
        let normal = [x, y, (radius_sq - radial).sqrt()].map(|axis| axis / SPHERE_RADIUS);
        let lambert = dot(normal, self.light).max(0.0);
        let intensity = AMBIENT + (1.0 - AMBIENT) * lambert;
        to_rgba8([0.9 * intensity, 0.45 * intensity, 0.2 * intensity])
    }
}

impl RenderJob for SphereJob {
    fn render_tile(&self, tile: &mut Tile) -> Result<(), RenderJobError> {
        let [rcp_width, rcp_height] = tile.rcp_fb_size();
        let region = tile.region;
        for y in region.lower.y..region.upper.y {
            let v = (y as f32 + 0.5) * rcp_height;
            for x in region.lower.x..region.upper.x {
                let u = (x as f32 + 0.5) * rcp_width;
                let local_x = (x - region.lower.x) as u32;
                let local_y = (y - region.lower.y) as u32;
                *tile.pixel_mut(local_x, local_y) = self.shade(u, v);
            }
        }
        Ok(())
    }
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(vector: [f32; 3]) -> [f32; 3] {
    let length = dot(vector, vector).sqrt();
    vector.map(|axis| axis / length)
}

fn to_rgba8(color: [f32; 3]) -> Rgba8 {
    let [r, g, b] = color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8);
    [r, g, b, 255]
}
