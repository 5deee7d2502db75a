//! Circle-versus-box collision between bodies and track obstacles.
//!
//! The body center is rotated into the obstacle's local frame, where the box
//! is axis-aligned. The closest point on the box to the center decides the
//! contact normal; the normal is rotated back to world space for the
//! position correction and the velocity response.

use crate::track::Obstacle;
use crate::{Body, PhysicsParams};

/// Overlap between a body and an obstacle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    /// Unit normal in world space, pointing out of the obstacle.
    pub normal: [f64; 2],
    /// Distance the body must move along `normal` to stop overlapping.
    pub depth: f64,
    /// True when the body center was inside the box.
    pub inside: bool,
}

/// Correction produced for one (body, obstacle) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub position_delta: [f64; 2],
    pub velocity: [f64; 2],
}

/// Find the contact between a circle and an obstacle, if they touch.
///
/// Touching exactly (distance == radius) counts as a contact of depth zero.
pub fn detect_contact(position: [f64; 2], radius: f64, obstacle: &Obstacle) -> Option<Contact> {
    let (sin, cos) = obstacle.rotation.sin_cos();
    let [hx, hy] = obstacle.half_extents;

    let rel_x = position[0] - obstacle.center[0];
    let rel_y = position[1] - obstacle.center[1];
    let local_x = rel_x * cos + rel_y * sin;
    let local_y = -rel_x * sin + rel_y * cos;

    let offset_x = local_x - local_x.clamp(-hx, hx);
    let offset_y = local_y - local_y.clamp(-hy, hy);
    let distance_sq = offset_x * offset_x + offset_y * offset_y;
    if distance_sq > radius * radius {
        return None;
    }

    let (local_normal, distance, inside) = if distance_sq == 0.0 {
        // Center inside the box: leave through the face with the least clearance.
        let clearance_x = hx - local_x.abs();
        let clearance_y = hy - local_y.abs();
        let normal = if clearance_x < clearance_y {
            [face_sign(local_x), 0.0]
        } else {
            [0.0, face_sign(local_y)]
        };
        (normal, 0.0, true)
    } else {
        let distance = distance_sq.sqrt();
        ([offset_x / distance, offset_y / distance], distance, false)
    };

    let normal = [
        local_normal[0] * cos - local_normal[1] * sin,
        local_normal[0] * sin + local_normal[1] * cos,
    ];

    Some(Contact {
        normal,
        depth: radius - distance,
        inside,
    })
}

/// Resolve one body against one obstacle.
///
/// The body is pushed out along the contact normal by the penetration depth.
/// Velocity is reflected only while it still points into the surface, using
/// the restitution for the obstacle's kind. Without contact the delta is zero
/// and the velocity is returned unchanged.
pub fn resolve(body: &Body, obstacle: &Obstacle, params: &PhysicsParams) -> Resolution {
    let mut resolution = Resolution {
        position_delta: [0.0, 0.0],
        velocity: body.velocity,
    };

    let Some(contact) = detect_contact(body.position, params.body_radius, obstacle) else {
        return resolution;
    };

    let [nx, ny] = contact.normal;
    resolution.position_delta = [nx * contact.depth, ny * contact.depth];

    let normal_speed = body.velocity[0] * nx + body.velocity[1] * ny;
    if normal_speed < 0.0 {
        let bounce = params.restitution_for(obstacle.kind);
        resolution.velocity[0] -= (1.0 + bounce) * normal_speed * nx;
        resolution.velocity[1] -= (1.0 + bounce) * normal_speed * ny;
    }

    resolution
}

fn face_sign(value: f64) -> f64 {
    if value > 0.0 { 1.0 } else { -1.0 }
}
